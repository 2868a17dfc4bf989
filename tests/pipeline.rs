use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipemaster::pm::app::{AppSpec, AppState, Application, CommandSet, Stage};
use pipemaster::pm::output::OutputSink;
use pipemaster::pm::plugin::LoggingHooks;
use pipemaster::pm::proctree::ProcessTable;
use pipemaster::pm::supervisor::{LockScope, Supervisor, SupervisorConfig};

fn app(dir: &Path, id: &str, commands: CommandSet) -> Arc<Application> {
    let spec = AppSpec {
        id: id.to_string(),
        path: dir.join("apps").join(id).display().to_string(),
        commands,
        enabled_plugins: vec![],
    };
    Arc::new(Application::create(&spec, &dir.join("logs")).unwrap())
}

fn supervisor(scope: LockScope) -> Supervisor {
    Supervisor::new(
        SupervisorConfig {
            lock_scope: scope,
            ..SupervisorConfig::default()
        },
        Arc::new(LoggingHooks),
    )
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    f()
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_build_blocks_start() {
    let dir = tempfile::tempdir().unwrap();
    let a = app(
        dir.path(),
        "gated",
        CommandSet {
            build: "exit 1".to_string(),
            start: "sleep 30".to_string(),
            ..CommandSet::default()
        },
    );
    let sup = supervisor(LockScope::Global);

    let started = sup.restart(&a, true, true).await.unwrap().wait().await;
    assert!(!started);
    assert_eq!(a.state(), AppState::Failed);
    assert!(a.pid(Stage::Start).is_none());
    let err = fs::read_to_string(a.stderr().path()).unwrap();
    assert!(err.contains("build exited: exit status 1"), "stderr was {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_reaches_forked_children() {
    let dir = tempfile::tempdir().unwrap();
    let a = app(
        dir.path(),
        "forky",
        CommandSet {
            start: "sleep 30 & sleep 30 & wait".to_string(),
            ..CommandSet::default()
        },
    );
    let sup = supervisor(LockScope::Global);
    let table = ProcessTable::new();

    assert!(sup.restart(&a, true, true).await.unwrap().wait().await);
    let root = a.pid(Stage::Start).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        table
            .build_tree(root)
            .unwrap()
            .is_some_and(|t| t.children.len() == 2)
    }));
    let pids = table.build_tree(root).unwrap().unwrap().pids();
    assert_eq!(pids.len(), 3);

    sup.kill(&a, true).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || pids.iter().all(|p| !table.is_alive(*p))));
    assert!(a.pid(Stage::Start).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_restart_keeps_init_running() {
    let dir = tempfile::tempdir().unwrap();
    let a = app(
        dir.path(),
        "soft",
        CommandSet {
            init: "sleep 30".to_string(),
            start: "sleep 30".to_string(),
            ..CommandSet::default()
        },
    );
    let sup = supervisor(LockScope::Global);
    let table = ProcessTable::new();

    assert!(sup.restart(&a, true, true).await.unwrap().wait().await);
    let init = a.pid(Stage::Init).unwrap();
    let start = a.pid(Stage::Start).unwrap();

    // A new init command is not picked up by a soft restart, even with a command reset.
    a.set_commands(CommandSet {
        init: "sleep 31".to_string(),
        start: "sleep 32".to_string(),
        ..CommandSet::default()
    });
    assert!(sup.restart(&a, false, true).await.unwrap().wait().await);

    assert_eq!(a.pid(Stage::Init), Some(init));
    assert!(table.is_alive(init));
    let snapshot = a.snapshot();
    assert_eq!(snapshot.init, "sleep 30");
    assert_eq!(snapshot.start, "sleep 32");
    let new_start = a.pid(Stage::Start).unwrap();
    assert_ne!(new_start, start);
    assert!(wait_until(Duration::from_secs(5), || !table.is_alive(start)));

    // A hard restart replaces init too.
    assert!(sup.restart(&a, true, true).await.unwrap().wait().await);
    assert_ne!(a.pid(Stage::Init), Some(init));
    assert_eq!(a.snapshot().init, "sleep 31");
    assert!(wait_until(Duration::from_secs(5), || !table.is_alive(init)));

    sup.kill(&a, true).await.unwrap();
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn background_leftovers_die_with_their_stage() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("leftover.pid");
    let a = app(
        dir.path(),
        "leftover",
        CommandSet {
            start: format!("sleep 417 & echo $! > '{}'", pidfile.display()),
            ..CommandSet::default()
        },
    );
    let sup = supervisor(LockScope::Global);
    let table = ProcessTable::new();

    assert!(sup.restart(&a, true, true).await.unwrap().wait().await);
    let root = a.pid(Stage::Start).unwrap();
    assert!(wait_until(Duration::from_secs(5), || read_pid(&pidfile).is_some()));
    let first = read_pid(&pidfile).unwrap();
    // The shell is gone; its background sleep now hangs off another parent.
    assert!(wait_until(Duration::from_secs(5), || !table.is_alive(root)));
    assert!(table.is_alive(first));

    assert!(sup.restart(&a, false, false).await.unwrap().wait().await);
    assert!(wait_until(Duration::from_secs(5), || !table.is_alive(first)));
    assert!(wait_until(Duration::from_secs(5), || {
        read_pid(&pidfile).is_some_and(|p| p != first)
    }));
    let second = read_pid(&pidfile).unwrap();
    assert!(table.is_alive(second));

    sup.kill(&a, true).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || !table.is_alive(second)));
}

async fn race_two_builds(scope: LockScope) -> Vec<String> {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace.log");
    fs::write(&trace, "").unwrap();
    let build = |name: &str| {
        format!(
            "echo {name}-begin >> '{t}'; sleep 0.5; echo {name}-end >> '{t}'",
            t = trace.display()
        )
    };
    let a = app(
        dir.path(),
        "a",
        CommandSet {
            build: build("a"),
            start: "true".to_string(),
            ..CommandSet::default()
        },
    );
    let b = app(
        dir.path(),
        "b",
        CommandSet {
            build: build("b"),
            start: "true".to_string(),
            ..CommandSet::default()
        },
    );
    let sup = supervisor(scope);

    let (ra, rb) = tokio::join!(
        async { sup.restart(&a, true, true).await.unwrap().wait().await },
        async { sup.restart(&b, true, true).await.unwrap().wait().await },
    );
    assert!(ra && rb);
    fs::read_to_string(&trace)
        .unwrap()
        .lines()
        .map(|s| s.to_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn global_lock_serializes_teardown_to_launch() {
    let lines = race_two_builds(LockScope::Global).await;
    assert_eq!(lines.len(), 4, "{lines:?}");
    let first = lines[0].trim_end_matches("-begin").to_string();
    let second = if first == "a" { "b" } else { "a" };
    assert_eq!(
        lines,
        vec![
            format!("{first}-begin"),
            format!("{first}-end"),
            format!("{second}-begin"),
            format!("{second}-end"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn per_app_lock_lets_builds_overlap() {
    let lines = race_two_builds(LockScope::PerApp).await;
    assert_eq!(lines.len(), 4, "{lines:?}");
    assert!(lines[0].ends_with("-begin") && lines[1].ends_with("-begin"), "{lines:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn sink_keeps_every_byte_from_concurrent_stages() {
    let dir = tempfile::tempdir().unwrap();
    let writer = |tag: &str| format!("i=0; while [ $i -lt 300 ]; do echo {tag}-$i; i=$((i+1)); done");
    let a = app(
        dir.path(),
        "chatty",
        CommandSet {
            test: writer("test"),
            start: writer("start"),
            ..CommandSet::default()
        },
    );
    let sup = supervisor(LockScope::Global);

    // Direct writers on the same sink, racing the two stage processes.
    let sink: Arc<OutputSink> = Arc::clone(a.stdout());
    let direct: Vec<_> = (0..4)
        .map(|w| {
            let sink = Arc::clone(&sink);
            std::thread::spawn(move || {
                let mut n = 0;
                for i in 0..100 {
                    n += sink.write(format!("direct{w}-{i}\n").as_bytes()).unwrap();
                }
                n
            })
        })
        .collect();

    assert!(sup.restart(&a, true, true).await.unwrap().wait().await);
    let direct_bytes: usize = direct.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(sup.tasks().wait_idle(Duration::from_secs(10)).await);

    let stage_bytes: usize = ["test", "start"]
        .iter()
        .flat_map(|tag| (0..300).map(move |i| format!("{tag}-{i}\n").len()))
        .sum();
    let text = fs::read_to_string(a.stdout().path()).unwrap();
    assert_eq!(text.len(), direct_bytes + stage_bytes);
    assert_eq!(text.matches('\n').count(), 400 + 600);
    assert_eq!(fs::read_to_string(a.stderr().path()).unwrap(), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn start_signal_does_not_wait_for_long_running_start() {
    let dir = tempfile::tempdir().unwrap();
    let a = app(
        dir.path(),
        "e2e",
        CommandSet {
            build: "true".to_string(),
            start: "sleep 5".to_string(),
            ..CommandSet::default()
        },
    );
    let sup = supervisor(LockScope::Global);
    let table = ProcessTable::new();

    let t0 = Instant::now();
    let signal = sup.restart(&a, true, true).await.unwrap();
    let started = tokio::time::timeout(Duration::from_secs(2), signal.wait())
        .await
        .expect("result signal within 2s");
    assert!(started);
    assert!(t0.elapsed() < Duration::from_secs(2));
    assert_eq!(a.state(), AppState::Running);

    let pid = a.pid(Stage::Start).unwrap();
    assert!(table.is_alive(pid));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!table.is_alive(pid));
    assert_eq!(fs::read_to_string(a.stderr().path()).unwrap(), "");
}
