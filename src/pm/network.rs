use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pm::app::Application;
use crate::pm::error::{Error, Result};
use crate::pm::events::pm_event;
use crate::pm::proctree::{ProcessSnapshot, ProcessTable};

/// One listening socket on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Listener {
    pub pid: i32,
    pub process_name: String,
    pub addr: SocketAddr,
}

/// Where listening sockets come from. The system source reads them from the OS.
pub trait ListenerSource: Send + Sync + std::fmt::Debug {
    fn listeners(&self) -> Result<Vec<Listener>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemListeners;

impl ListenerSource for SystemListeners {
    fn listeners(&self) -> Result<Vec<Listener>> {
        let all = listeners::get_all().map_err(|e| Error::ListenersUnavailable(e.to_string()))?;
        let mut out: Vec<Listener> = all
            .into_iter()
            .map(|l| Listener {
                pid: l.process.pid as i32,
                process_name: l.process.name,
                addr: l.socket,
            })
            .collect();
        out.sort_by_key(|l| (l.addr.port(), l.pid));
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Listeners held by a process in the application's trees.
    pub owned: Vec<Listener>,
    /// Listeners no known application owns.
    pub unowned: Vec<Listener>,
}

#[derive(Debug, Clone)]
pub struct NetworkReconciler {
    table: ProcessTable,
    source: Arc<dyn ListenerSource>,
}

impl NetworkReconciler {
    pub fn new(table: ProcessTable, source: Arc<dyn ListenerSource>) -> Self {
        Self { table, source }
    }

    /// Split the host's listeners into those owned by `app` and those owned by nobody. Listeners of
    /// the other applications in `all` are dropped. Blocking: reads the process table once.
    pub fn classify(&self, app: &Application, all: &[Arc<Application>]) -> Result<Classification> {
        let snap = self.table.snapshot()?;
        let own = app_pids(&snap, app);
        let listeners = self.source.listeners()?;
        let others: HashSet<i32> = all
            .iter()
            .filter(|a| a.id() != app.id())
            .flat_map(|a| app_pids(&snap, a))
            .collect();

        let mut out = Classification::default();
        for l in listeners {
            if own.contains(&l.pid) {
                out.owned.push(l);
            } else if !others.contains(&l.pid) {
                out.unowned.push(l);
            }
        }
        pm_event(
            "network",
            Some(app.id()),
            format!("owned={} unowned={}", out.owned.len(), out.unowned.len()),
        );
        Ok(out)
    }
}

/// Union of the trees rooted at every live process of the application, init included.
fn app_pids(snap: &ProcessSnapshot, app: &Application) -> HashSet<i32> {
    let roots = app.runtime().running.live_pids(true);
    roots
        .into_iter()
        .filter_map(|pid| snap.tree(pid))
        .flat_map(|t| t.pids())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::app::{AppSpec, ExitOutcome, Stage, StageProcess};
    use std::fs;
    use std::path::Path;
    use tokio::sync::watch;

    #[derive(Debug)]
    struct FixedListeners(Vec<Listener>);

    impl ListenerSource for FixedListeners {
        fn listeners(&self) -> Result<Vec<Listener>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct BrokenListeners;

    impl ListenerSource for BrokenListeners {
        fn listeners(&self) -> Result<Vec<Listener>> {
            Err(Error::ListenersUnavailable("permission denied".to_string()))
        }
    }

    fn listener(pid: i32, port: u16) -> Listener {
        Listener {
            pid,
            process_name: format!("p{pid}"),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    fn fake_proc(dir: &Path, entries: &[(i32, i32)]) {
        for (pid, ppid) in entries {
            let p = dir.join(pid.to_string());
            fs::create_dir_all(&p).unwrap();
            fs::write(p.join("stat"), format!("{pid} (x) S {ppid} 0 0\n")).unwrap();
        }
    }

    fn app_with(dir: &Path, id: &str, procs: &[(Stage, i32, bool)]) -> Arc<Application> {
        let spec = AppSpec {
            id: id.to_string(),
            path: dir.join(id).display().to_string(),
            ..AppSpec::default()
        };
        let app = Application::create(&spec, &dir.join("logs")).unwrap();
        for (stage, pid, exited) in procs {
            let (tx, rx) = watch::channel(None);
            if *exited {
                tx.send_replace(Some(ExitOutcome::Exited(0)));
            }
            app.runtime()
                .running
                .put(StageProcess::new(*stage, *pid, "x".to_string(), rx));
        }
        Arc::new(app)
    }

    #[test]
    fn splits_owned_foreign_and_unowned() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        fake_proc(
            &proc_root,
            &[(1, 0), (100, 1), (101, 100), (110, 1), (200, 1), (201, 200), (300, 1), (400, 1)],
        );
        let a = app_with(dir.path(), "a", &[(Stage::Start, 100, false), (Stage::Init, 110, false)]);
        let b = app_with(dir.path(), "b", &[(Stage::Start, 200, false), (Stage::Build, 400, true)]);
        let all = vec![Arc::clone(&a), Arc::clone(&b)];

        let source = FixedListeners(vec![
            listener(101, 8080),
            listener(110, 8081),
            listener(201, 9090),
            listener(300, 5432),
            listener(400, 6379),
        ]);
        let net = NetworkReconciler::new(ProcessTable::with_root(&proc_root), Arc::new(source));

        let c = net.classify(&a, &all).unwrap();
        let owned: Vec<u16> = c.owned.iter().map(|l| l.addr.port()).collect();
        let unowned: Vec<u16> = c.unowned.iter().map(|l| l.addr.port()).collect();
        assert_eq!(owned, vec![8080, 8081]);
        // 400 belonged to b's build, which has exited: nobody owns it now.
        assert_eq!(unowned, vec![5432, 6379]);

        let c = net.classify(&b, &all).unwrap();
        let owned: Vec<u16> = c.owned.iter().map(|l| l.addr.port()).collect();
        assert_eq!(owned, vec![9090]);
    }

    #[test]
    fn listener_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        fake_proc(&proc_root, &[(1, 0)]);
        let a = app_with(dir.path(), "a", &[]);
        let net = NetworkReconciler::new(ProcessTable::with_root(&proc_root), Arc::new(BrokenListeners));
        assert!(matches!(
            net.classify(&a, std::slice::from_ref(&a)),
            Err(Error::ListenersUnavailable(_))
        ));

        let net = NetworkReconciler::new(ProcessTable::with_root(dir.path().join("none")), Arc::new(BrokenListeners));
        assert!(matches!(
            net.classify(&a, &[]),
            Err(Error::ProcessTableUnreadable { .. })
        ));
    }
}
