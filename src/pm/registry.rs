use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::pm::app::{AppSpec, Application, CommandSet};
use crate::pm::error::{Error, Result};
use crate::pm::events::{pm_event, pm_warn};

pub const STORE_FILE: &str = "apps.json";

/// In-memory map of application id to record, persisted as a flat JSON snapshot.
#[derive(Debug)]
pub struct Registry {
    apps: RwLock<HashMap<String, Arc<Application>>>,
    store_path: PathBuf,
    log_dir: PathBuf,
}

impl Registry {
    pub fn new(store_path: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            store_path: store_path.into(),
            log_dir: log_dir.into(),
        }
    }

    /// Recreate every application found in the snapshot. A missing snapshot is an empty registry;
    /// entries that cannot be recreated are skipped with a warning.
    pub fn load(store_path: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Result<Self> {
        let reg = Self::new(store_path, log_dir);
        let bytes = match fs::read(&reg.store_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(reg),
            Err(e) => return Err(Error::io(format!("read {}", reg.store_path.display()), e)),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(reg);
        }
        let specs: BTreeMap<String, AppSpec> = serde_json::from_slice(&bytes)?;
        {
            let mut apps = reg.write();
            for (key, mut spec) in specs {
                if spec.id.is_empty() {
                    spec.id = key;
                }
                match Application::create(&spec, &reg.log_dir) {
                    Ok(app) => {
                        apps.insert(spec.id.clone(), Arc::new(app));
                    }
                    Err(e) => pm_warn("registry", Some(&spec.id), format!("load_skipped err={e}")),
                }
            }
            pm_event("registry", None, format!("loaded apps={} from={}", apps.len(), reg.store_path.display()));
        }
        Ok(reg)
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Application>>> {
        self.apps.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Application>>> {
        self.apps.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn create(&self, spec: &AppSpec) -> Result<Arc<Application>> {
        let mut apps = self.write();
        if apps.contains_key(&spec.id) {
            return Err(Error::AppExists(spec.id.clone()));
        }
        let app = Arc::new(Application::create(spec, &self.log_dir)?);
        apps.insert(spec.id.clone(), Arc::clone(&app));
        pm_event("registry", Some(&spec.id), format!("created path={}", app.path().display()));
        Ok(app)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Application>> {
        self.read().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<Application>> {
        self.get(id).ok_or_else(|| Error::AppNotFound(id.to_string()))
    }

    /// Every application, ordered by id.
    pub fn list(&self) -> Vec<Arc<Application>> {
        let mut out: Vec<Arc<Application>> = self.read().values().cloned().collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Replace the current commands. The running snapshot is left alone until a reset restart.
    pub fn update_commands(&self, id: &str, commands: CommandSet) -> Result<Arc<Application>> {
        let app = self.require(id)?;
        app.set_commands(commands);
        pm_event("registry", Some(id), "commands updated");
        Ok(app)
    }

    /// Drop the record and hand it back so the caller can kill its processes and close its sinks.
    pub fn remove(&self, id: &str) -> Result<Arc<Application>> {
        let app = self
            .write()
            .remove(id)
            .ok_or_else(|| Error::AppNotFound(id.to_string()))?;
        pm_event("registry", Some(id), "removed");
        Ok(app)
    }

    /// Write the snapshot: temp file in the same directory, then rename over the old one.
    pub fn save(&self) -> Result<()> {
        let specs: BTreeMap<String, AppSpec> = self
            .read()
            .iter()
            .map(|(id, app)| (id.clone(), app.spec()))
            .collect();
        let json = serde_json::to_vec_pretty(&specs)?;

        let parent = self.store_path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| Error::io(format!("create_dir_all {}", parent.display()), e))?;
        let tmp = parent.join(format!(".{STORE_FILE}.tmp.{}", std::process::id()));
        fs::write(&tmp, &json).map_err(|e| Error::io(format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.store_path)
            .map_err(|e| Error::io(format!("rename {} -> {}", tmp.display(), self.store_path.display()), e))?;
        Ok(())
    }
}
