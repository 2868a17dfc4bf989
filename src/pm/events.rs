use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

const MAX_EVENTS: usize = 2000;

static EVENTS: OnceLock<Mutex<VecDeque<EventEntry>>> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    #[serde(default)]
    pub app: Option<String>,
    pub message: String,
}

/// Install the tracing subscriber used by both binaries. `RUST_LOG` overrides the default level.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Record a daemon event: logged through tracing and kept in the in-memory ring served over rpc.
pub fn pm_event(component: &str, app: Option<&str>, msg: impl AsRef<str>) {
    let msg = msg.as_ref();
    match app {
        Some(a) => tracing::info!("[{component}] app={a} {msg}"),
        None => tracing::info!("[{component}] {msg}"),
    }
    push(component, app, msg);
}

/// Same as [`pm_event`] but logged at warn level.
pub fn pm_warn(component: &str, app: Option<&str>, msg: impl AsRef<str>) {
    let msg = msg.as_ref();
    match app {
        Some(a) => tracing::warn!("[{component}] app={a} {msg}"),
        None => tracing::warn!("[{component}] {msg}"),
    }
    push(component, app, msg);
}

fn push(component: &str, app: Option<&str>, msg: &str) {
    let entry = EventEntry {
        ts: Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string(),
        component: component.to_string(),
        app: app.map(|s| s.to_string()),
        message: msg.to_string(),
    };
    let q = EVENTS.get_or_init(|| Mutex::new(VecDeque::new()));
    let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
    g.push_back(entry);
    while g.len() > MAX_EVENTS {
        g.pop_front();
    }
}

/// Most recent `n` events, oldest first, optionally filtered by app id.
pub fn recent_events(app: Option<&str>, n: usize) -> Vec<EventEntry> {
    let Some(q) = EVENTS.get() else {
        return Vec::new();
    };
    let g = q.lock().unwrap_or_else(|p| p.into_inner());
    let mut out: Vec<EventEntry> = g
        .iter()
        .rev()
        .filter(|e| match app {
            Some(a) => e.app.as_deref() == Some(a),
            None => true,
        })
        .take(n)
        .cloned()
        .collect();
    out.reverse();
    out
}
