use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::pm::error::{Error, Result};
use crate::pm::output::OutputSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Build,
    Test,
    Start,
    /// Image-level background script; not part of the command set.
    Ambient,
}

impl Stage {
    pub const PIPELINE: [Stage; 4] = [Stage::Init, Stage::Build, Stage::Test, Stage::Start];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Build => "build",
            Stage::Test => "test",
            Stage::Start => "start",
            Stage::Ambient => "ambient",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    #[default]
    Idle,
    Building,
    Testing,
    Running,
    Failed,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Idle => "idle",
            AppState::Building => "building",
            AppState::Testing => "testing",
            AppState::Running => "running",
            AppState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four pipeline command strings. An empty string means the stage is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    #[serde(default)]
    pub init: String,
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub test: String,
    #[serde(default)]
    pub start: String,
}

impl CommandSet {
    pub fn get(&self, stage: Stage) -> &str {
        match stage {
            Stage::Init => &self.init,
            Stage::Build => &self.build,
            Stage::Test => &self.test,
            Stage::Start => &self.start,
            Stage::Ambient => "",
        }
    }

    /// Command for `stage`, or `None` when the stage is a no-op.
    pub fn command(&self, stage: Stage) -> Option<&str> {
        let c = self.get(stage).trim();
        (!c.is_empty()).then_some(c)
    }
}

/// How a stage process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    WaitFailed(String),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Exited(c) => write!(f, "exit status {c}"),
            ExitOutcome::Signaled(s) => {
                let name = nix::sys::signal::Signal::try_from(*s)
                    .map(|sig| sig.as_str().to_string())
                    .unwrap_or_else(|_| s.to_string());
                write!(f, "signal: {name}")
            }
            ExitOutcome::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

/// Ownership token for one live stage process.
///
/// The OS child handle itself lives in the waiter task; this token carries the pid plus the exit
/// notification, and is held by exactly one [`RunningProcesses`] slot until it is killed.
#[derive(Debug)]
pub struct StageProcess {
    pub stage: Stage,
    pub pid: i32,
    pub command: String,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl StageProcess {
    pub fn new(stage: Stage, pid: i32, command: String, exit: watch::Receiver<Option<ExitOutcome>>) -> Self {
        Self {
            stage,
            pid,
            command,
            exit,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    /// Resolves once the waiter has reaped the process.
    pub async fn exited(&self) -> Option<ExitOutcome> {
        let mut rx = self.exit.clone();
        match rx.wait_for(|o| o.is_some()).await {
            Ok(v) => v.clone(),
            // Sender dropped without reporting: the waiter is gone, nothing left to wait for.
            Err(_) => None,
        }
    }
}

/// Live processes owned by one application.
#[derive(Debug, Default)]
pub struct RunningProcesses {
    pub init: Option<StageProcess>,
    pub build: Option<StageProcess>,
    pub test: Option<StageProcess>,
    pub start: Option<StageProcess>,
    pub ambient: Vec<StageProcess>,
}

impl RunningProcesses {
    pub fn slot(&mut self, stage: Stage) -> Option<&mut Option<StageProcess>> {
        match stage {
            Stage::Init => Some(&mut self.init),
            Stage::Build => Some(&mut self.build),
            Stage::Test => Some(&mut self.test),
            Stage::Start => Some(&mut self.start),
            Stage::Ambient => None,
        }
    }

    /// Record a freshly launched process, replacing whatever held the slot.
    pub fn put(&mut self, p: StageProcess) {
        match self.slot(p.stage) {
            Some(slot) => *slot = Some(p),
            None => self.ambient.push(p),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageProcess> {
        self.init
            .iter()
            .chain(self.build.iter())
            .chain(self.test.iter())
            .chain(self.start.iter())
            .chain(self.ambient.iter())
    }

    /// Live (not yet reaped) pids, optionally leaving init out.
    pub fn live_pids(&self, include_init: bool) -> Vec<i32> {
        self.iter()
            .filter(|p| include_init || p.stage != Stage::Init)
            .filter(|p| !p.has_exited())
            .map(|p| p.pid)
            .collect()
    }

    /// Remove and return every token the teardown should kill.
    pub fn take_for_kill(&mut self, include_init: bool) -> Vec<StageProcess> {
        let mut out: Vec<StageProcess> = Vec::new();
        if include_init {
            out.extend(self.init.take());
        }
        out.extend(self.build.take());
        out.extend(self.test.take());
        out.extend(self.start.take());
        out.append(&mut self.ambient);
        out
    }
}

/// Persisted shape of an application (the registry snapshot entry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(flatten)]
    pub commands: CommandSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_plugins: Vec<String>,
}

#[derive(Debug, Default)]
pub struct AppRuntime {
    pub commands: CommandSet,
    /// Commands in effect for the running pipeline, in init/build/test/start order.
    pub snapshot: CommandSet,
    pub running: RunningProcesses,
    pub state: AppState,
    /// Set once the application is being deleted; nothing new may be recorded after that.
    pub retired: bool,
    /// Bumped by every explicit kill. A pipeline only records processes while the generation it
    /// started under is current.
    pub kill_generation: u64,
}

impl AppRuntime {
    /// Whether a pipeline started under `generation` may still record a new process.
    pub fn accepts_launch(&self, generation: u64) -> bool {
        !self.retired && self.kill_generation == generation
    }
}

/// The unit of supervision: one uploaded application and everything it runs.
#[derive(Debug)]
pub struct Application {
    id: String,
    path: PathBuf,
    enabled_plugins: Vec<String>,
    stdout: Arc<OutputSink>,
    stderr: Arc<OutputSink>,
    runtime: Mutex<AppRuntime>,
    restart_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Application {
    /// Build the record for `spec`: resolves and creates the working directory and opens the sinks
    /// as `<log_dir>/<id>-stdout.log` and `<log_dir>/<id>-stderr.log`.
    pub fn create(spec: &AppSpec, log_dir: &Path) -> Result<Self> {
        validate_id(&spec.id)?;
        let path = resolve_app_path(&spec.path)?;
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::io(format!("create_dir_all {}", path.display()), e))?;
        let stdout = Arc::new(OutputSink::open(log_dir.join(format!("{}-stdout.log", spec.id)))?);
        let stderr = Arc::new(OutputSink::open(log_dir.join(format!("{}-stderr.log", spec.id)))?);
        Ok(Self::with_sinks(spec, path, stdout, stderr))
    }

    /// Assemble a record around existing sinks (they may be the same sink).
    pub fn with_sinks(spec: &AppSpec, path: PathBuf, stdout: Arc<OutputSink>, stderr: Arc<OutputSink>) -> Self {
        Self {
            id: spec.id.clone(),
            path,
            enabled_plugins: spec.enabled_plugins.clone(),
            stdout,
            stderr,
            runtime: Mutex::new(AppRuntime {
                commands: spec.commands.clone(),
                ..AppRuntime::default()
            }),
            restart_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn enabled_plugins(&self) -> &[String] {
        &self.enabled_plugins
    }

    pub fn stdout(&self) -> &Arc<OutputSink> {
        &self.stdout
    }

    pub fn stderr(&self) -> &Arc<OutputSink> {
        &self.stderr
    }

    pub(crate) fn restart_lock(&self) -> &Arc<tokio::sync::Mutex<()>> {
        &self.restart_lock
    }

    pub(crate) fn runtime(&self) -> MutexGuard<'_, AppRuntime> {
        self.runtime.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn commands(&self) -> CommandSet {
        self.runtime().commands.clone()
    }

    /// Replace the current command strings. The running snapshot only follows on a reset restart.
    pub fn set_commands(&self, commands: CommandSet) {
        self.runtime().commands = commands;
    }

    pub fn snapshot(&self) -> CommandSet {
        self.runtime().snapshot.clone()
    }

    pub fn state(&self) -> AppState {
        self.runtime().state
    }

    pub(crate) fn set_state(&self, state: AppState) {
        self.runtime().state = state;
    }

    pub fn pid(&self, stage: Stage) -> Option<i32> {
        let mut rt = self.runtime();
        rt.running.slot(stage)?.as_ref().map(|p| p.pid)
    }

    pub fn spec(&self) -> AppSpec {
        AppSpec {
            id: self.id.clone(),
            path: self.path.display().to_string(),
            commands: self.commands(),
            enabled_plugins: self.enabled_plugins.clone(),
        }
    }

    pub fn status(&self) -> AppStatus {
        let rt = self.runtime();
        AppStatus {
            id: self.id.clone(),
            path: self.path.display().to_string(),
            state: rt.state,
            commands: rt.commands.clone(),
            snapshot: rt.snapshot.clone(),
            processes: rt
                .running
                .iter()
                .map(|p| ProcessStatus {
                    stage: p.stage,
                    pid: p.pid,
                    command: p.command.clone(),
                    exit: p.outcome().map(|o| o.to_string()),
                })
                .collect(),
            enabled_plugins: self.enabled_plugins.clone(),
        }
    }

    /// Mark the application as deleted. Launches that race with the final kill see the flag when
    /// they try to record their process.
    pub fn retire(&self) {
        self.runtime().retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.runtime().retired
    }

    /// Close both sinks. Used when the application is deleted.
    pub fn close_sinks(&self) -> Result<()> {
        self.stdout.close()?;
        self.stderr.close()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub stage: Stage,
    pub pid: i32,
    pub command: String,
    #[serde(default)]
    pub exit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatus {
    pub id: String,
    pub path: String,
    pub state: AppState,
    pub commands: CommandSet,
    pub snapshot: CommandSet,
    #[serde(default)]
    pub processes: Vec<ProcessStatus>,
    #[serde(default)]
    pub enabled_plugins: Vec<String>,
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidApp("id must not be empty".to_string()));
    }
    // The id becomes part of the sink file names.
    if id.contains('/') || id.contains('\0') || id == "." || id == ".." {
        return Err(Error::InvalidApp(format!("id {id:?} is not a valid file name")));
    }
    Ok(())
}

/// `dir` is used as given; `local::remote` selects `remote`, where `~` expands to the home
/// directory and a relative remote path is taken relative to it.
pub fn resolve_app_path(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    let Some((_, remote)) = raw.split_once("::") else {
        if raw.is_empty() {
            return Err(Error::InvalidApp("path must not be empty".to_string()));
        }
        return Ok(PathBuf::from(raw));
    };
    let home = home::home_dir()
        .ok_or_else(|| Error::InvalidApp("cannot resolve home directory".to_string()))?;
    if remote.is_empty() {
        return Ok(home);
    }
    if let Some(rest) = remote.strip_prefix('~') {
        return Ok(home.join(rest.trim_start_matches('/')));
    }
    let p = PathBuf::from(remote);
    if p.is_absolute() {
        Ok(p)
    } else {
        Ok(home.join(p))
    }
}
