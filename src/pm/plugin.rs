use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pm::events::pm_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginEventKind {
    BeforeFullUpload,
    AfterFullUpload,
    BeforeAppRestart,
    AfterAppRestart,
    BeforeAppDelete,
    AfterAppDelete,
    BeforeFileUpdate,
    AfterFileUpdate,
    BeforeFileCreate,
    AfterFileCreate,
    BeforeFileDelete,
    AfterFileDelete,
}

impl PluginEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginEventKind::BeforeFullUpload => "before-full-upload",
            PluginEventKind::AfterFullUpload => "after-full-upload",
            PluginEventKind::BeforeAppRestart => "before-app-restart",
            PluginEventKind::AfterAppRestart => "after-app-restart",
            PluginEventKind::BeforeAppDelete => "before-app-delete",
            PluginEventKind::AfterAppDelete => "after-app-delete",
            PluginEventKind::BeforeFileUpdate => "before-file-update",
            PluginEventKind::AfterFileUpdate => "after-file-update",
            PluginEventKind::BeforeFileCreate => "before-file-create",
            PluginEventKind::AfterFileCreate => "after-file-create",
            PluginEventKind::BeforeFileDelete => "before-file-delete",
            PluginEventKind::AfterFileDelete => "after-file-delete",
        }
    }
}

impl std::fmt::Display for PluginEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub kind: PluginEventKind,
    /// File the event is about; empty for app-level events.
    #[serde(default)]
    pub path: String,
    pub app_dir: PathBuf,
    pub app_id: String,
    #[serde(default)]
    pub enabled_plugins: Vec<String>,
}

impl PluginEvent {
    pub fn app(kind: PluginEventKind, app_id: &str, app_dir: &Path, enabled_plugins: &[String]) -> Self {
        Self {
            kind,
            path: String::new(),
            app_dir: app_dir.to_path_buf(),
            app_id: app_id.to_string(),
            enabled_plugins: enabled_plugins.to_vec(),
        }
    }
}

/// Receiver for lifecycle events. Hook execution itself lives outside the daemon; implementations
/// must not block.
pub trait PluginHooks: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: PluginEvent);
}

/// Default hooks: record the event in the daemon log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl PluginHooks for LoggingHooks {
    fn emit(&self, event: PluginEvent) {
        pm_event(
            "plugin",
            Some(&event.app_id),
            format!(
                "event={} dir={} path={:?} plugins={}",
                event.kind,
                event.app_dir.display(),
                event.path,
                event.enabled_plugins.join(",")
            ),
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Hooks that remember every event, for assertions on ordering.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingHooks {
        pub(crate) events: Mutex<Vec<PluginEvent>>,
    }

    impl RecordingHooks {
        pub(crate) fn kinds(&self) -> Vec<PluginEventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    impl PluginHooks for RecordingHooks {
        fn emit(&self, event: PluginEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_kebab_case() {
        let v = serde_json::to_value(PluginEventKind::BeforeAppRestart).unwrap();
        assert_eq!(v, "before-app-restart");
        assert_eq!(PluginEventKind::AfterFileDelete.to_string(), "after-file-delete");
        let back: PluginEventKind = serde_json::from_str("\"after-full-upload\"").unwrap();
        assert_eq!(back, PluginEventKind::AfterFullUpload);
    }

    #[test]
    fn app_event_has_no_path() {
        let ev = PluginEvent::app(
            PluginEventKind::AfterAppRestart,
            "a1",
            Path::new("/srv/a1"),
            &["slack".to_string()],
        );
        assert!(ev.path.is_empty());
        assert_eq!(ev.enabled_plugins, vec!["slack".to_string()]);
        LoggingHooks.emit(ev);
    }
}
