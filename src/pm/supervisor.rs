use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::pm::app::{AppState, Application, CommandSet, ExitOutcome, Stage, StageProcess};
use crate::pm::asyncutil::TaskTracker;
use crate::pm::command::{CommandFactory, Launched, StageCommand, DEFAULT_SHELL};
use crate::pm::error::{Error, KillFailure, Result};
use crate::pm::events::{pm_event, pm_warn};
use crate::pm::plugin::{PluginEvent, PluginEventKind, PluginHooks};
use crate::pm::proctree::{kill_group, kill_tree, ProcessNode, ProcessSnapshot, ProcessTable, DEFAULT_PROC_ROOT};

pub const DEFAULT_KILL_WAIT: Duration = Duration::from_millis(3000);

/// Which restarts exclude each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// One teardown/build/launch sequence at a time across every application.
    #[default]
    Global,
    /// Restarts of different applications may overlap.
    PerApp,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub lock_scope: LockScope,
    /// How long a kill waits for the signalled roots to be reaped.
    pub kill_wait: Duration,
    pub shell: PathBuf,
    pub image_scripts_dir: Option<PathBuf>,
    pub proc_root: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            lock_scope: LockScope::Global,
            kill_wait: DEFAULT_KILL_WAIT,
            shell: PathBuf::from(DEFAULT_SHELL),
            image_scripts_dir: None,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }
}

/// Single-use result of a restart: `true` once the start stage has been launched, `false` if the
/// build failed or no start process could be launched.
#[derive(Debug)]
pub struct RestartSignal {
    rx: oneshot::Receiver<bool>,
}

impl RestartSignal {
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

/// Restart/kill orchestration for every application of the daemon.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cfg: SupervisorConfig,
    global_lock: Arc<AsyncMutex<()>>,
    factory: CommandFactory,
    table: ProcessTable,
    hooks: Arc<dyn PluginHooks>,
    tasks: TaskTracker,
}

/// A process taken out of its application for killing, with the tree read for it.
struct Victim {
    process: StageProcess,
    tree: Option<ProcessNode>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig, hooks: Arc<dyn PluginHooks>) -> Self {
        let factory = CommandFactory::new(cfg.shell.clone());
        let table = ProcessTable::with_root(cfg.proc_root.clone());
        Self {
            inner: Arc::new(Inner {
                cfg,
                global_lock: Arc::new(AsyncMutex::new(())),
                factory,
                table,
                hooks,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.cfg
    }

    pub fn table(&self) -> &ProcessTable {
        &self.inner.table
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.inner.tasks
    }

    fn lock_for(&self, app: &Application) -> Arc<AsyncMutex<()>> {
        match self.inner.cfg.lock_scope {
            LockScope::Global => Arc::clone(&self.inner.global_lock),
            LockScope::PerApp => Arc::clone(app.restart_lock()),
        }
    }

    /// Tear down the previous pipeline and launch a new one in the background.
    ///
    /// Returns once the old processes are gone; the pipeline itself runs on a task that holds the
    /// supervision lock until every stage has been launched. Errors reading the process table are
    /// returned here and leave the application untouched.
    pub async fn restart(
        &self,
        app: &Arc<Application>,
        hard_reset: bool,
        command_reset: bool,
    ) -> Result<RestartSignal> {
        pm_event(
            "restart",
            Some(app.id()),
            format!("requested hard_reset={hard_reset} command_reset={command_reset}"),
        );
        self.emit(app, PluginEventKind::BeforeAppRestart);

        let guard = self.lock_for(app).lock_owned().await;

        let (snapshot, generation) = {
            let rt = app.runtime();
            (
                effective_snapshot(&rt.commands, &rt.snapshot, hard_reset, command_reset),
                rt.kill_generation,
            )
        };

        let failures = self.teardown(app, hard_reset).await?;
        if !failures.is_empty() {
            let e = Error::KillFailed { failures };
            pm_warn("restart", Some(app.id()), format!("teardown incomplete err={e}"));
            write_stderr(app, format!("teardown: {e}")).await;
        }

        app.runtime().snapshot = snapshot.clone();

        let (tx, rx) = oneshot::channel();
        let sup = self.clone();
        let app = Arc::clone(app);
        self.inner
            .tasks
            .spawn(sup.run_pipeline(app, snapshot, generation, hard_reset, guard, tx));
        Ok(RestartSignal { rx })
    }

    /// Kill build, test, start and ambient processes, and init when `include_init` is set.
    ///
    /// Does not take the supervision lock: a kill issued during a build ends that build, and a
    /// pipeline still launching stages when the kill lands records nothing further.
    pub async fn kill(&self, app: &Application, include_init: bool) -> Result<()> {
        app.runtime().kill_generation += 1;
        let failures = self.teardown(app, include_init).await?;
        app.set_state(AppState::Idle);
        pm_event("kill", Some(app.id()), format!("done include_init={include_init}"));
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::KillFailed { failures })
        }
    }

    async fn read_table(&self) -> Result<ProcessSnapshot> {
        let table = self.inner.table.clone();
        tokio::task::spawn_blocking(move || table.snapshot())
            .await
            .map_err(|e| Error::io("process table reader", std::io::Error::other(e)))?
    }

    /// Read the table once, then take the tokens and kill their trees. Nothing is taken when the
    /// table cannot be read.
    async fn teardown(&self, app: &Application, include_init: bool) -> Result<Vec<KillFailure>> {
        let snap = self.read_table().await?;
        let victims = {
            let mut rt = app.runtime();
            victims(&snap, rt.running.take_for_kill(include_init))
        };
        Ok(self.kill_victims(app.id(), victims).await)
    }

    async fn kill_victims(&self, app_id: &str, victims: Vec<Victim>) -> Vec<KillFailure> {
        let mut failures = Vec::new();
        for v in &victims {
            if let Some(tree) = &v.tree {
                pm_event(
                    "kill",
                    Some(app_id),
                    format!("stage={} pid={} tree={:?}", v.process.stage, v.process.pid, tree.pids()),
                );
                collect_kill_failures(app_id, v.process.pid, kill_tree(tree, Signal::SIGKILL), &mut failures);
            }
            // Stragglers reparented away from an exited root are only reachable through its group.
            collect_kill_failures(app_id, v.process.pid, kill_group(v.process.pid, Signal::SIGKILL), &mut failures);
        }

        let deadline = tokio::time::Instant::now() + self.inner.cfg.kill_wait;
        for v in victims.iter().filter(|v| v.tree.is_some()) {
            if tokio::time::timeout_at(deadline, v.process.exited()).await.is_err() {
                pm_warn(
                    "kill",
                    Some(app_id),
                    format!("stage={} pid={} not reaped yet", v.process.stage, v.process.pid),
                );
            }
        }
        failures
    }

    async fn kill_ambient(&self, app: &Application) {
        let snap = match self.read_table().await {
            Ok(s) => s,
            Err(e) => {
                pm_warn("kill", Some(app.id()), format!("ambient teardown skipped err={e}"));
                return;
            }
        };
        let victims = {
            let mut rt = app.runtime();
            victims(&snap, std::mem::take(&mut rt.running.ambient))
        };
        let failures = self.kill_victims(app.id(), victims).await;
        if !failures.is_empty() {
            let e = Error::KillFailed { failures };
            pm_warn("kill", Some(app.id()), format!("ambient err={e}"));
        }
    }

    async fn run_pipeline(
        self,
        app: Arc<Application>,
        snapshot: CommandSet,
        generation: u64,
        hard_reset: bool,
        guard: OwnedMutexGuard<()>,
        tx: oneshot::Sender<bool>,
    ) {
        let id = app.id().to_string();
        let mut waits: JoinSet<()> = JoinSet::new();

        if let Some(dir) = &self.inner.cfg.image_scripts_dir {
            for script in discover_ambient_scripts(dir) {
                let Some(cmd) = self.inner.factory.script(&id, &script, app.stdout(), app.stderr()) else {
                    continue;
                };
                if let Some(waiter) = self.launch(&app, &cmd, generation).await {
                    watch_exit(&mut waits, &app, Stage::Ambient, waiter);
                }
            }
        }

        if let Some(build) = self.stage_command(&app, &snapshot, Stage::Build) {
            app.set_state(AppState::Building);
            pm_event("build", Some(&id), format!("begin cmd={:?}", build.command));
            let outcome = match self.launch(&app, &build, generation).await {
                Some(waiter) => Some(join_outcome(waiter.await)),
                None => None,
            };
            if !outcome.as_ref().is_some_and(ExitOutcome::success) {
                if let Some(o) = &outcome {
                    write_stderr(&app, format!("build exited: {o}")).await;
                }
                pm_warn(
                    "build",
                    Some(&id),
                    format!("failed outcome={}", outcome.map(|o| o.to_string()).unwrap_or_else(|| "not started".to_string())),
                );
                app.set_state(AppState::Failed);
                self.kill_ambient(&app).await;
                let _ = tx.send(false);
                drop(guard);
                return;
            }
            pm_event("build", Some(&id), "finished");
        }

        let mut launched_any = false;
        if let Some(test) = self.stage_command(&app, &snapshot, Stage::Test)
            && let Some(waiter) = self.launch(&app, &test, generation).await
        {
            app.set_state(AppState::Testing);
            launched_any = true;
            watch_exit(&mut waits, &app, Stage::Test, waiter);
        }
        if hard_reset
            && let Some(init) = self.stage_command(&app, &snapshot, Stage::Init)
            && let Some(waiter) = self.launch(&app, &init, generation).await
        {
            launched_any = true;
            watch_exit(&mut waits, &app, Stage::Init, waiter);
        }
        let mut started = false;
        if let Some(start) = self.stage_command(&app, &snapshot, Stage::Start)
            && let Some(waiter) = self.launch(&app, &start, generation).await
        {
            app.set_state(AppState::Running);
            started = true;
            watch_exit(&mut waits, &app, Stage::Start, waiter);
        }
        if !launched_any && !started {
            app.set_state(AppState::Idle);
        }

        self.emit(&app, PluginEventKind::AfterAppRestart);
        let _ = tx.send(started);
        drop(guard);
        pm_event("restart", Some(&id), format!("launched started={started}"));

        while let Some(res) = waits.join_next().await {
            if let Err(e) = res {
                pm_warn("restart", Some(&id), format!("exit watcher failed err={e}"));
            }
        }
    }

    fn stage_command(&self, app: &Application, snapshot: &CommandSet, stage: Stage) -> Option<StageCommand> {
        let cmd = snapshot.command(stage)?;
        self.inner
            .factory
            .parse(app.id(), stage, cmd, app.path(), app.stdout(), app.stderr())
    }

    /// Spawn and record a stage process. Spawn errors go to the stderr sink and yield `None`, as does
    /// a launch that lost a race with a kill or a delete.
    async fn launch(
        &self,
        app: &Application,
        cmd: &StageCommand,
        generation: u64,
    ) -> Option<JoinHandle<ExitOutcome>> {
        let Launched { process, waiter } = match cmd.spawn(&self.inner.tasks) {
            Ok(l) => l,
            Err(e) => {
                pm_warn(
                    "restart",
                    Some(app.id()),
                    format!("stage={} spawn_failed cmd={:?} err={e}", cmd.stage, cmd.command),
                );
                write_stderr(app, format!("{} failed to start: {e}", cmd.stage)).await;
                return None;
            }
        };
        let pid = process.pid;
        let rejected = {
            let mut rt = app.runtime();
            if rt.accepts_launch(generation) {
                rt.running.put(process);
                None
            } else if rt.retired {
                Some("app deleted")
            } else {
                Some("app killed")
            }
        };
        if let Some(reason) = rejected {
            // The new process leads its own session, so its group holds everything it started.
            if let Err(e) = kill_group(pid, Signal::SIGKILL) {
                pm_warn("restart", Some(app.id()), format!("stage={} pid={pid} kill_failed err={e}", cmd.stage));
            }
            pm_warn("restart", Some(app.id()), format!("stage={} pid={pid} killed: {reason}", cmd.stage));
            return None;
        }
        pm_event(
            "restart",
            Some(app.id()),
            format!("stage={} pid={pid} launched cmd={:?}", cmd.stage, cmd.command),
        );
        Some(waiter)
    }

    fn emit(&self, app: &Application, kind: PluginEventKind) {
        self.inner
            .hooks
            .emit(PluginEvent::app(kind, app.id(), app.path(), app.enabled_plugins()));
    }
}

/// The commands a restart runs: the current ones on a command reset (keeping the previous init
/// unless the restart is hard), otherwise the last committed snapshot.
pub fn effective_snapshot(
    current: &CommandSet,
    previous: &CommandSet,
    hard_reset: bool,
    command_reset: bool,
) -> CommandSet {
    if !command_reset {
        return previous.clone();
    }
    let mut next = current.clone();
    if !hard_reset {
        next.init = previous.init.clone();
    }
    next
}

/// Regular entries of the image scripts directory, sorted. A missing directory has no scripts.
pub fn discover_ambient_scripts(dir: &Path) -> Vec<PathBuf> {
    let Ok(rd) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    out.sort();
    out
}

fn victims(snap: &ProcessSnapshot, procs: Vec<StageProcess>) -> Vec<Victim> {
    procs
        .into_iter()
        .map(|process| {
            // A reaped pid may already belong to someone else.
            let tree = if process.has_exited() {
                None
            } else {
                snap.tree(process.pid)
            };
            Victim { process, tree }
        })
        .collect()
}

fn collect_kill_failures(app_id: &str, pid: i32, res: Result<()>, failures: &mut Vec<KillFailure>) {
    match res {
        Ok(()) => {}
        Err(Error::KillFailed { failures: f }) => failures.extend(f),
        Err(e) => pm_warn("kill", Some(app_id), format!("pid={pid} err={e}")),
    }
}

fn join_outcome(res: std::result::Result<ExitOutcome, JoinError>) -> ExitOutcome {
    res.unwrap_or_else(|e| ExitOutcome::WaitFailed(e.to_string()))
}

fn watch_exit(waits: &mut JoinSet<()>, app: &Arc<Application>, stage: Stage, waiter: JoinHandle<ExitOutcome>) {
    let app = Arc::clone(app);
    waits.spawn(async move {
        let outcome = join_outcome(waiter.await);
        pm_event("exit", Some(app.id()), format!("stage={stage} outcome={outcome}"));
        if !outcome.success() {
            write_stderr(&app, format!("{stage} exited: {outcome}")).await;
        }
    });
}

async fn write_stderr(app: &Application, line: String) {
    if let Err(e) = app.stderr().write_line(line).await {
        pm_warn("sink", Some(app.id()), format!("write_failed err={e}"));
    }
}
