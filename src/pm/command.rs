use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use nix::unistd::setsid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pm::app::{ExitOutcome, Stage, StageProcess};
use crate::pm::asyncutil::TaskTracker;
use crate::pm::events::pm_warn;
use crate::pm::output::OutputSink;

pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Turns command strings into launchable [`StageCommand`]s that run through the configured shell.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    shell: PathBuf,
}

impl Default for CommandFactory {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

impl CommandFactory {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// `None` for an empty command: the stage is a no-op.
    pub fn parse(
        &self,
        app_id: &str,
        stage: Stage,
        command: &str,
        dir: &Path,
        stdout: &Arc<OutputSink>,
        stderr: &Arc<OutputSink>,
    ) -> Option<StageCommand> {
        let command = command.trim();
        if command.is_empty() {
            return None;
        }
        Some(StageCommand {
            app_id: app_id.to_string(),
            stage,
            command: command.to_string(),
            shell: self.shell.clone(),
            dir: dir.to_path_buf(),
            stdout: Arc::clone(stdout),
            stderr: Arc::clone(stderr),
        })
    }

    /// An image script, executed by path from the scripts directory.
    pub fn script(
        &self,
        app_id: &str,
        script: &Path,
        stdout: &Arc<OutputSink>,
        stderr: &Arc<OutputSink>,
    ) -> Option<StageCommand> {
        let dir = script.parent().unwrap_or_else(|| Path::new("/"));
        self.parse(app_id, Stage::Ambient, &shell_quote(&script.to_string_lossy()), dir, stdout, stderr)
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A process descriptor bound to a working directory and the application's sinks.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub app_id: String,
    pub stage: Stage,
    pub command: String,
    shell: PathBuf,
    dir: PathBuf,
    stdout: Arc<OutputSink>,
    stderr: Arc<OutputSink>,
}

/// A started process: the ownership token plus the task that reaps it.
#[derive(Debug)]
pub struct Launched {
    pub process: StageProcess,
    /// Resolves after the process exited and its output has been drained into the sinks.
    pub waiter: JoinHandle<ExitOutcome>,
}

impl StageCommand {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start the process in its own session with stdout/stderr pumped into the sinks.
    pub fn spawn(&self, tasks: &TaskTracker) -> std::io::Result<Launched> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own session: the agent's terminal signals stay away from the pipeline.
        unsafe {
            cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let Some(pid) = child.id() else {
            return Err(std::io::Error::other(format!(
                "{} process exited before its pid could be read",
                self.stage
            )));
        };

        let mut pumps: Vec<JoinHandle<()>> = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(tasks.spawn(pump(out, Arc::clone(&self.stdout), self.app_id.clone(), self.stage)));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tasks.spawn(pump(err, Arc::clone(&self.stderr), self.app_id.clone(), self.stage)));
        }

        let (tx, rx) = watch::channel(None);
        let waiter = tasks.spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => outcome_from_status(status),
                Err(e) => ExitOutcome::WaitFailed(e.to_string()),
            };
            tx.send_replace(Some(outcome.clone()));
            for p in pumps {
                let _ = p.await;
            }
            outcome
        });

        Ok(Launched {
            process: StageProcess::new(self.stage, pid as i32, self.command.clone(), rx),
            waiter,
        })
    }
}

fn outcome_from_status(status: std::process::ExitStatus) -> ExitOutcome {
    use std::os::unix::process::ExitStatusExt as _;
    match (status.code(), status.signal()) {
        (Some(c), _) => ExitOutcome::Exited(c),
        (None, Some(s)) => ExitOutcome::Signaled(s),
        (None, None) => ExitOutcome::WaitFailed(format!("unknown exit status {status:?}")),
    }
}

async fn pump<R>(mut r: R, sink: Arc<OutputSink>, app_id: String, stage: Stage)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut reported = false;
    loop {
        let n = match r.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                pm_warn("sink", Some(&app_id), format!("stage={stage} read_failed err={e}"));
                break;
            }
        };
        // Keep draining after a sink failure so the process never blocks on a full pipe.
        if let Err(e) = sink.write_async(buf[..n].to_vec()).await
            && !reported
        {
            reported = true;
            pm_warn(
                "sink",
                Some(&app_id),
                format!("stage={stage} write_failed path={} err={e}", sink.path().display()),
            );
        }
    }
}
