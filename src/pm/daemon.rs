use crate::pm::app::{AppSpec, Application, CommandSet};
use crate::pm::config::MasterConfig;
use crate::pm::events::{pm_event, pm_warn, recent_events};
use crate::pm::network::{NetworkReconciler, SystemListeners};
use crate::pm::plugin::{LoggingHooks, PluginEvent, PluginEventKind, PluginHooks};
use crate::pm::registry::Registry;
use crate::pm::rpc::{Request, Response};
use crate::pm::supervisor::Supervisor;
use anyhow::Context as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::net::UnixListener as TokioUnixListener;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time as tokio_time;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Everything a request handler needs. Each component synchronizes itself.
#[derive(Debug)]
pub struct DaemonState {
    pub cfg: MasterConfig,
    pub registry: Registry,
    pub supervisor: Supervisor,
    pub network: NetworkReconciler,
    pub hooks: Arc<dyn PluginHooks>,
    pub shutting_down: AtomicBool,
}

impl DaemonState {
    pub fn new(cfg: MasterConfig, registry: Registry, hooks: Arc<dyn PluginHooks>) -> Self {
        let supervisor = Supervisor::new(cfg.supervisor_config(), Arc::clone(&hooks));
        let network = NetworkReconciler::new(supervisor.table().clone(), Arc::new(SystemListeners));
        Self {
            cfg,
            registry,
            supervisor,
            network,
            hooks,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn emit(&self, kind: PluginEventKind, app: &Application) {
        self.hooks
            .emit(PluginEvent::app(kind, app.id(), app.path(), app.enabled_plugins()));
    }

    fn save_registry(&self) {
        if let Err(e) = self.registry.save() {
            pm_warn(
                "registry",
                None,
                format!("save_failed path={} err={e}", self.registry.store_path().display()),
            );
        }
    }
}

pub async fn run_daemon_async(cfg: MasterConfig) -> anyhow::Result<()> {
    let registry = Registry::load(cfg.store_path(), &cfg.log_directory)
        .with_context(|| format!("load app snapshot {}", cfg.store_path().display()))?;

    let sock = cfg.sock.clone();
    prepare_socket(&sock)?;
    let listener = TokioUnixListener::bind(&sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;
    fs::set_permissions(&sock, fs::Permissions::from_mode(cfg.sock_mode))
        .with_context(|| format!("chmod {:o} {}", cfg.sock_mode, sock.display()))?;

    pm_event(
        "boot",
        None,
        format!(
            "rev={} build_time={} build_host={} apps={} lock_scope={:?}",
            crate::pm::build_info::git_rev(),
            crate::pm::build_info::build_time_raw(),
            crate::pm::build_info::build_host(),
            registry.len(),
            cfg.lock_scope
        ),
    );

    let state = Arc::new(DaemonState::new(cfg, registry, Arc::new(LoggingHooks)));

    start_signal_listener_async(Arc::clone(&state))?;

    // Saved applications come back with a full pipeline, one at a time.
    for app in state.registry.list() {
        match state.supervisor.restart(&app, true, true).await {
            Ok(sig) => {
                let started = sig.wait().await;
                pm_event("boot", Some(app.id()), format!("restored started={started}"));
            }
            Err(e) => pm_warn("boot", Some(app.id()), format!("restore_failed err={e}")),
        }
    }

    pm_event("rpc", None, format!("listening sock={}", sock.display()));

    while !state.shutting_down.load(Ordering::Relaxed) {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _addr)) => {
                        let st = Arc::clone(&state);
                        state.supervisor.tasks().spawn(async move {
                            if let Err(e) = handle_connection_async(st, stream).await {
                                pm_warn("rpc", None, format!("connection_error err={e:#}"));
                            }
                        });
                    }
                    Err(e) => {
                        pm_warn("rpc", None, format!("accept_error err={e}"));
                        tokio_time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            _ = tokio_time::sleep(Duration::from_millis(200)) => {
                // periodic wake so we can observe shutting_down without relying on accept.
            }
        }
    }

    pm_event("shutdown", None, "signal received; killing every pipeline");
    graceful_shutdown_async(&state).await;
    // Best-effort: remove socket file so clients fail fast until restarted.
    let _ = fs::remove_file(&sock);
    Ok(())
}

fn start_signal_listener_async(state: Arc<DaemonState>) -> anyhow::Result<()> {
    let mut term = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        state.shutting_down.store(true, Ordering::Relaxed);
    });
    Ok(())
}

async fn graceful_shutdown_async(state: &Arc<DaemonState>) {
    for app in state.registry.list() {
        app.retire();
        if let Err(e) = state.supervisor.kill(&app, true).await {
            pm_warn("shutdown", Some(app.id()), format!("kill_failed err={e}"));
        }
    }
    let drained = state.supervisor.tasks().wait_idle(SHUTDOWN_DRAIN).await;
    for app in state.registry.list() {
        if let Err(e) = app.close_sinks() {
            pm_warn("shutdown", Some(app.id()), format!("close_sinks_failed err={e}"));
        }
    }
    pm_event(
        "shutdown",
        None,
        format!(
            "done drained={drained} active_tasks={} total_tasks={} sock={}",
            state.supervisor.tasks().active_count(),
            state.supervisor.tasks().total_spawned(),
            state.cfg.sock.display()
        ),
    );
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!(
                "failed to create socket directory {}: {e}",
                parent.display()
            )
        })?;
    }

    if sock.exists() {
        // If something is already listening, fail. Otherwise remove stale socket.
        match UnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "pipemaster already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

async fn handle_connection_async(
    state: Arc<DaemonState>,
    stream: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut reader = TokioBufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }
    let mut stream = reader.into_inner();

    let resp = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(req) => dispatch_async(&state, req)
            .await
            // Full anyhow chain so clients can see the underlying cause.
            .unwrap_or_else(|e| Response::err(format!("{e:#}"))),
        Err(e) => Response::err(format!("bad request: {e}")),
    };
    let resp_line = serde_json::to_string(&resp)? + "\n";
    stream.write_all(resp_line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn dispatch_async(state: &Arc<DaemonState>, req: Request) -> anyhow::Result<Response> {
    match req {
        Request::Create { spec } => do_create(state, &spec),
        Request::Update { id, commands } => do_update(state, &id, commands),
        Request::Delete { id } => do_delete_async(state, &id).await,
        Request::Get { id } => do_get(state, &id),
        Request::List => Ok(do_list(state)),
        Request::Restart {
            id,
            hard_reset,
            command_reset,
        } => do_restart_async(state, &id, hard_reset, command_reset).await,
        Request::Kill { id, include_init } => do_kill_async(state, &id, include_init).await,
        Request::Network { id } => do_network_async(state, &id).await,
        Request::Events { id, n } => Ok(Response {
            ok: true,
            events: recent_events(id.as_deref(), n),
            ..Response::default()
        }),
        Request::Version => Ok(Response::ok(crate::pm::build_info::banner())),
    }
}

fn do_create(state: &Arc<DaemonState>, spec: &AppSpec) -> anyhow::Result<Response> {
    let app = state.registry.create(spec)?;
    state.save_registry();
    Ok(Response {
        ok: true,
        message: format!("created {}", app.id()),
        apps: vec![app.status()],
        ..Response::default()
    })
}

fn do_update(state: &Arc<DaemonState>, id: &str, commands: CommandSet) -> anyhow::Result<Response> {
    let app = state.registry.update_commands(id, commands)?;
    state.save_registry();
    Ok(Response {
        ok: true,
        message: format!("updated {id}; restart with command reset to apply"),
        apps: vec![app.status()],
        ..Response::default()
    })
}

async fn do_delete_async(state: &Arc<DaemonState>, id: &str) -> anyhow::Result<Response> {
    let app = state.registry.require(id)?;
    state.emit(PluginEventKind::BeforeAppDelete, &app);
    app.retire();
    let app = state.registry.remove(id)?;
    state.save_registry();

    let killed = state.supervisor.kill(&app, true).await;
    app.close_sinks()
        .with_context(|| format!("close sinks of {id}"))?;
    state.emit(PluginEventKind::AfterAppDelete, &app);
    killed.with_context(|| format!("kill pipeline of {id}"))?;
    Ok(Response::ok(format!("deleted {id}")))
}

fn do_get(state: &Arc<DaemonState>, id: &str) -> anyhow::Result<Response> {
    let app = state.registry.require(id)?;
    Ok(Response {
        ok: true,
        apps: vec![app.status()],
        ..Response::default()
    })
}

fn do_list(state: &Arc<DaemonState>) -> Response {
    Response {
        ok: true,
        apps: state.registry.list().iter().map(|a| a.status()).collect(),
        ..Response::default()
    }
}

async fn do_restart_async(
    state: &Arc<DaemonState>,
    id: &str,
    hard_reset: bool,
    command_reset: bool,
) -> anyhow::Result<Response> {
    let app = state.registry.require(id)?;
    let started = state
        .supervisor
        .restart(&app, hard_reset, command_reset)
        .await
        .with_context(|| format!("restart {id}"))?
        .wait()
        .await;
    Ok(Response {
        ok: started,
        message: if started {
            format!("restarted {id}")
        } else {
            format!("restart of {id} did not start (state={}); see {}", app.state(), app.stderr().path().display())
        },
        apps: vec![app.status()],
        ..Response::default()
    })
}

async fn do_kill_async(state: &Arc<DaemonState>, id: &str, include_init: bool) -> anyhow::Result<Response> {
    let app = state.registry.require(id)?;
    state
        .supervisor
        .kill(&app, include_init)
        .await
        .with_context(|| format!("kill {id}"))?;
    Ok(Response {
        ok: true,
        message: format!("killed {id}"),
        apps: vec![app.status()],
        ..Response::default()
    })
}

async fn do_network_async(state: &Arc<DaemonState>, id: &str) -> anyhow::Result<Response> {
    let app = state.registry.require(id)?;
    let st = Arc::clone(state);
    let net = tokio::task::spawn_blocking(move || {
        let all = st.registry.list();
        st.network.classify(&app, &all)
    })
    .await
    .map_err(|e| anyhow::anyhow!("join error: {e}"))?
    .with_context(|| format!("network of {id}"))?;
    Ok(Response {
        ok: true,
        network: Some(net),
        ..Response::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::plugin::testing::RecordingHooks;

    fn state(dir: &Path) -> (Arc<DaemonState>, Arc<RecordingHooks>) {
        let cfg = MasterConfig {
            sock: dir.join("pm.sock"),
            state_directory: dir.join("state"),
            log_directory: dir.join("logs"),
            ..MasterConfig::default()
        };
        let registry = Registry::new(cfg.store_path(), &cfg.log_directory);
        let hooks = Arc::new(RecordingHooks::default());
        (Arc::new(DaemonState::new(cfg, registry, hooks.clone())), hooks)
    }

    fn spec(dir: &Path, id: &str, start: &str) -> AppSpec {
        AppSpec {
            id: id.to_string(),
            path: dir.join("apps").join(id).display().to_string(),
            commands: CommandSet {
                start: start.to_string(),
                ..CommandSet::default()
            },
            enabled_plugins: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_restart_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (st, hooks) = state(dir.path());

        let r = dispatch_async(&st, Request::Create { spec: spec(dir.path(), "web", "sleep 30") })
            .await
            .unwrap();
        assert!(r.ok);
        assert!(st.cfg.store_path().exists());

        let r = dispatch_async(
            &st,
            Request::Restart {
                id: "web".to_string(),
                hard_reset: true,
                command_reset: true,
            },
        )
        .await
        .unwrap();
        assert!(r.ok, "{}", r.message);
        let pid = r.apps[0].processes[0].pid;
        assert!(st.supervisor.table().is_alive(pid));

        let r = dispatch_async(&st, Request::Delete { id: "web".to_string() }).await.unwrap();
        assert!(r.ok);
        assert!(!st.supervisor.table().is_alive(pid));
        assert!(st.registry.get("web").is_none());
        assert!(dispatch_async(&st, Request::Get { id: "web".to_string() }).await.is_err());
        assert_eq!(
            hooks.kinds(),
            vec![
                PluginEventKind::BeforeAppRestart,
                PluginEventKind::AfterAppRestart,
                PluginEventKind::BeforeAppDelete,
                PluginEventKind::AfterAppDelete,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_restart_is_not_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (st, _) = state(dir.path());
        let mut s = spec(dir.path(), "broken", "sleep 30");
        s.commands.build = "exit 1".to_string();
        dispatch_async(&st, Request::Create { spec: s }).await.unwrap();

        let r = dispatch_async(
            &st,
            Request::Restart {
                id: "broken".to_string(),
                hard_reset: true,
                command_reset: true,
            },
        )
        .await
        .unwrap();
        assert!(!r.ok);
        assert!(r.message.contains("state=failed"), "{}", r.message);
    }

    #[test]
    fn stale_socket_is_replaced_but_live_one_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("run/pm.sock");
        prepare_socket(&sock).unwrap();

        let live = std::os::unix::net::UnixListener::bind(&sock).unwrap();
        assert!(prepare_socket(&sock).is_err());
        drop(live);
        // The file outlives the listener: it is now stale.
        prepare_socket(&sock).unwrap();
        assert!(!sock.exists());
    }
}
