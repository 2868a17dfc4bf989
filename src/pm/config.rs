use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pm::command::DEFAULT_SHELL;
use crate::pm::proctree::DEFAULT_PROC_ROOT;
use crate::pm::registry::STORE_FILE;
use crate::pm::supervisor::{LockScope, SupervisorConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    #[serde(default = "default_sock")]
    pub sock: PathBuf,
    /// Unix socket mode (octal), e.g. 660 or "660" or "0660".
    #[serde(default = "default_sock_mode", deserialize_with = "deserialize_sock_mode")]
    pub sock_mode: u32,

    /// Holds the `apps.json` registry snapshot.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,
    /// Per-application `<id>-stdout.log` / `<id>-stderr.log`.
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    /// Scripts launched alongside every pipeline. Unset means none.
    #[serde(default)]
    pub image_scripts_directory: Option<PathBuf>,

    #[serde(default)]
    pub lock_scope: LockScope,
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            sock: default_sock(),
            sock_mode: default_sock_mode(),
            state_directory: default_state_directory(),
            log_directory: default_log_directory(),
            image_scripts_directory: None,
            lock_scope: LockScope::default(),
            kill_wait_ms: default_kill_wait_ms(),
            shell: default_shell(),
        }
    }
}

impl MasterConfig {
    pub fn store_path(&self) -> PathBuf {
        self.state_directory.join(STORE_FILE)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            lock_scope: self.lock_scope,
            kill_wait: Duration::from_millis(self.kill_wait_ms),
            shell: self.shell.clone(),
            image_scripts_dir: self.image_scripts_directory.clone(),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }
}

// -------- YAML file schema (grouped only; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    unix_socket: Option<UnixSocketConfigFile>,
    #[serde(default)]
    global: Option<GlobalConfigFile>,
    #[serde(default)]
    supervisor: Option<SupervisorConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixSocketConfigFile {
    #[serde(default = "default_sock")]
    path: PathBuf,
    #[serde(default = "default_sock_mode", deserialize_with = "deserialize_sock_mode")]
    mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalConfigFile {
    #[serde(default)]
    state_directory: Option<PathBuf>,
    #[serde(default)]
    log_directory: Option<PathBuf>,
    #[serde(default)]
    image_scripts_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorConfigFile {
    #[serde(default)]
    lock_scope: Option<LockScope>,
    #[serde(default)]
    kill_wait_ms: Option<u64>,
    #[serde(default)]
    shell: Option<PathBuf>,
}

fn default_sock() -> PathBuf {
    "/tmp/pipemaster.sock".into()
}
fn default_sock_mode() -> u32 {
    0o600
}
fn default_state_directory() -> PathBuf {
    "state".into()
}
fn default_log_directory() -> PathBuf {
    "logs".into()
}
fn default_kill_wait_ms() -> u64 {
    3000
}
fn default_shell() -> PathBuf {
    DEFAULT_SHELL.into()
}

fn deserialize_sock_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        // A bare 660 in YAML is decimal; read its digits as octal.
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("sock mode must be an integer"))
            .and_then(|x| parse_mode_str(&x.to_string()).map_err(D::Error::custom)),
        serde_yaml::Value::String(s) => parse_mode_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "sock mode must be an integer or string (e.g. 660 or \"0660\")",
        )),
    }
}

fn parse_mode_str(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let t = t.strip_prefix("0o").unwrap_or(t);
    let t = t.strip_prefix("0O").unwrap_or(t);
    let t = t.strip_prefix("0").unwrap_or(t);
    let mode = u32::from_str_radix(t, 8).map_err(|e| format!("invalid sock mode {s:?}: {e}"))?;
    if mode > 0o777 {
        return Err(format!("invalid sock mode {s:?}: above 0777"));
    }
    Ok(mode)
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_master_config(&raw, config_path)
}

/// Parse `raw` as if it had been read from `config_path`; relative paths resolve against that
/// file's directory.
pub fn parse_master_config(raw: &str, config_path: &Path) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile = if raw.trim().is_empty() {
        MasterConfigFile {
            unix_socket: None,
            global: None,
            supervisor: None,
        }
    } else {
        serde_yaml::from_str(raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?
    };

    let mut cfg = MasterConfig::default();

    if let Some(us) = file_cfg.unix_socket {
        cfg.sock = us.path;
        cfg.sock_mode = us.mode;
    }
    if let Some(gl) = file_cfg.global {
        if let Some(d) = gl.state_directory {
            cfg.state_directory = d;
        }
        if let Some(d) = gl.log_directory {
            cfg.log_directory = d;
        }
        cfg.image_scripts_directory = gl.image_scripts_directory;
    }
    if let Some(sv) = file_cfg.supervisor {
        if let Some(scope) = sv.lock_scope {
            cfg.lock_scope = scope;
        }
        if let Some(ms) = sv.kill_wait_ms {
            cfg.kill_wait_ms = ms;
        }
        if let Some(shell) = sv.shell {
            anyhow::ensure!(
                !shell.as_os_str().is_empty(),
                "supervisor.shell must not be empty"
            );
            cfg.shell = shell;
        }
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    for p in [&mut cfg.sock, &mut cfg.state_directory, &mut cfg.log_directory] {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    }
    if let Some(p) = cfg.image_scripts_directory.as_mut()
        && p.is_relative()
    {
        *p = base.join(&*p);
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_resolves_relative_paths() {
        let raw = r#"
unix_socket:
  path: ./pipemaster.sock
  mode: "0660"
global:
  state_directory: ./state
  log_directory: /var/log/pipemaster
  image_scripts_directory: scripts
supervisor:
  lock_scope: per_app
  kill_wait_ms: 500
  shell: /bin/bash
"#;
        let cfg = parse_master_config(raw, Path::new("/etc/pipemaster/config.yaml")).unwrap();
        assert_eq!(cfg.sock, PathBuf::from("/etc/pipemaster/./pipemaster.sock"));
        assert_eq!(cfg.sock_mode, 0o660);
        assert_eq!(cfg.state_directory, PathBuf::from("/etc/pipemaster/./state"));
        assert_eq!(cfg.log_directory, PathBuf::from("/var/log/pipemaster"));
        assert_eq!(
            cfg.image_scripts_directory,
            Some(PathBuf::from("/etc/pipemaster/scripts"))
        );
        assert_eq!(cfg.store_path(), PathBuf::from("/etc/pipemaster/./state/apps.json"));

        let sv = cfg.supervisor_config();
        assert_eq!(sv.lock_scope, LockScope::PerApp);
        assert_eq!(sv.kill_wait, Duration::from_millis(500));
        assert_eq!(sv.shell, PathBuf::from("/bin/bash"));
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg = parse_master_config("", Path::new("/srv/pm/config.yaml")).unwrap();
        assert_eq!(cfg.sock, PathBuf::from("/tmp/pipemaster.sock"));
        assert_eq!(cfg.sock_mode, 0o600);
        assert_eq!(cfg.state_directory, PathBuf::from("/srv/pm/state"));
        assert_eq!(cfg.lock_scope, LockScope::Global);
        assert_eq!(cfg.kill_wait_ms, 3000);
        assert!(cfg.image_scripts_directory.is_none());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_modes() {
        let p = Path::new("/x/config.yaml");
        assert!(parse_master_config("global:\n  config_directory: x\n", p).is_err());
        assert!(parse_master_config("web_console: {}\n", p).is_err());
        assert!(parse_master_config("unix_socket:\n  mode: \"999\"\n", p).is_err());
        assert!(parse_master_config("supervisor:\n  lock_scope: sometimes\n", p).is_err());
        let cfg = parse_master_config("unix_socket:\n  mode: 660\n", p).unwrap();
        assert_eq!(cfg.sock_mode, 0o660);
    }
}
