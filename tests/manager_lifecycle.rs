//! Integration tests for the manager: load/spawn convergence, scaling,
//! priority ordering, termination ladders and draining.
//!
//! These tests drive real OS processes (`/bin/sleep`, `sh -c ...`), so
//! every wait is wrapped in a timeout to keep failures loud and fast.

use std::time::Duration;

use procvisor::wire::ScaleOp;
use procvisor::{
    Delivery, EventKind, Manager, ManagerConfig, ManagerHandle, Pattern, ProcessSpec,
    SubscribeOptions, Subscription,
};
use tokio::time::{sleep, timeout};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

/// SIGTERM is 15 on every platform this crate supports.
const SIGTERM: i32 = 15;

fn test_config() -> ManagerConfig {
    ManagerConfig {
        forced_kill_grace: Duration::from_millis(500),
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Spawns an activated manager. `RUST_LOG` controls test logging.
async fn start_manager() -> ManagerHandle {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (handle, _join) = Manager::spawn(test_config());
    handle.start_all().await.expect("start_all should succeed");
    handle
}

/// A spec that stays alive until told otherwise.
fn sleeper(name: &str, replicas: u32) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "/bin/sleep 60");
    spec.numprocesses = replicas;
    spec.graceful_timeout = Some(5.0);
    spec
}

/// Receives deliveries until `pred` matches, panicking on timeout.
async fn wait_for(sub: &Subscription, pred: impl Fn(&Delivery) -> bool) -> Delivery {
    timeout(WAIT, async {
        loop {
            match sub.recv().await {
                Ok(d) if pred(&d) => return d,
                Ok(_) => continue,
                Err(procvisor::Error::BackpressureDropped { .. }) => continue,
                Err(e) => panic!("subscription died: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Polls until the template reports `n` running pids.
async fn wait_for_pids(handle: &ManagerHandle, qname: &str, n: usize) -> Vec<u64> {
    timeout(WAIT, async {
        loop {
            let pids = handle.pids(qname).await.expect("pids query");
            if pids.len() == n {
                return pids;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{qname} never reached {n} pids"))
}

// ============================================================================
// Load + convergence
// ============================================================================

#[tokio::test]
async fn load_spawns_to_replica_count() {
    let handle = start_manager().await;
    let spawns = handle.subscribe(Pattern::new("proc.w.spawn"), SubscribeOptions::default());

    let qname = handle.load("app", sleeper("w", 2)).await.expect("load");
    assert_eq!(qname, "app.w");

    let first = wait_for(&spawns, |d| d.event.kind == EventKind::Spawn).await;
    assert_eq!(first.event.name.as_deref(), Some("app.w"));
    wait_for(&spawns, |d| d.event.kind == EventKind::Spawn).await;

    let pids = wait_for_pids(&handle, &qname, 2).await;
    assert_eq!(pids.len(), 2);

    let info = handle.info(&qname).await.expect("info");
    assert!(info.active);
    assert_eq!(info.running, 2);
    assert_eq!(info.max_processes, 2);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn duplicate_load_conflicts() {
    let handle = start_manager().await;
    handle.load("app", sleeper("dup", 1)).await.expect("first load");
    let err = handle.load("app", sleeper("dup", 1)).await.unwrap_err();
    assert!(matches!(err, procvisor::Error::AlreadyExists { .. }));
    // Same name in another session is fine.
    handle.load("other", sleeper("dup", 1)).await.expect("other session");
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn internal_pids_are_monotonic_and_never_reused() {
    let handle = start_manager().await;
    let spawns = handle.subscribe(Pattern::new("spawn"), SubscribeOptions::default());

    handle.load("app", sleeper("m1", 2)).await.expect("load m1");
    let a = wait_for(&spawns, |_| true).await.event.pid.unwrap();
    let b = wait_for(&spawns, |_| true).await.event.pid.unwrap();

    handle.unload("app.m1").await.expect("unload");
    handle.load("app", sleeper("m2", 1)).await.expect("load m2");
    let c = wait_for(&spawns, |_| true).await.event.pid.unwrap();

    assert!(a < b, "pids must increase: {a} {b}");
    assert!(b < c, "pids must not be reused after unload: {b} {c}");

    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Scaling
// ============================================================================

#[tokio::test]
async fn scale_down_terminates_newest_first() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("w", 2)).await.expect("load");
    let before = wait_for_pids(&handle, &qname, 2).await;
    let oldest = before[0];

    let n = handle
        .scale(&qname, ScaleOp::Delta(-1))
        .await
        .expect("scale down");
    assert_eq!(n, 1);

    let after = wait_for_pids(&handle, &qname, 1).await;
    assert_eq!(after, vec![oldest], "the older instance must survive");

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn scale_up_then_down_is_a_noop_on_numprocesses() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("w", 1)).await.expect("load");
    wait_for_pids(&handle, &qname, 1).await;

    let up = handle.scale(&qname, ScaleOp::Delta(2)).await.expect("up");
    assert_eq!(up, 3);
    let down = handle.scale(&qname, ScaleOp::Delta(-2)).await.expect("down");
    assert_eq!(down, 1);
    wait_for_pids(&handle, &qname, 1).await;

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn absolute_scale_sets_the_count() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("w", 1)).await.expect("load");
    let n = handle
        .scale(&qname, ScaleOp::Absolute(3))
        .await
        .expect("scale");
    assert_eq!(n, 3);
    wait_for_pids(&handle, &qname, 3).await;
    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Priority ordering
// ============================================================================

#[tokio::test]
async fn batch_start_honors_priority_order() {
    // Load BEFORE activation: templates register but do not spawn.
    let (handle, _join) = Manager::spawn(test_config());
    let spawns = handle.subscribe(Pattern::new("spawn"), SubscribeOptions::default());

    let mut a = sleeper("a", 1);
    a.priority = 1;
    let mut b = sleeper("b", 1);
    b.priority = 0;
    handle.load("default", a).await.expect("load a");
    handle.load("default", b).await.expect("load b");

    handle.start_all().await.expect("start_all");

    let first = wait_for(&spawns, |_| true).await;
    let second = wait_for(&spawns, |_| true).await;
    assert_eq!(first.event.name.as_deref(), Some("default.b"));
    assert_eq!(second.event.name.as_deref(), Some("default.a"));

    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Stop / termination ladder
// ============================================================================

#[tokio::test]
async fn stop_is_idempotent_and_silent_the_second_time() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("w", 1)).await.expect("load");
    wait_for_pids(&handle, &qname, 1).await;

    let stops = handle.subscribe(Pattern::new("stop"), SubscribeOptions::default());
    handle.stop(&qname).await.expect("first stop");
    wait_for(&stops, |d| d.event.kind == EventKind::Stop).await;
    wait_for_pids(&handle, &qname, 0).await;
    assert!(!handle.job_state(&qname).await.expect("state"));

    handle.stop(&qname).await.expect("second stop");
    sleep(Duration::from_millis(200)).await;
    assert!(
        stops.try_recv().is_none(),
        "a second stop must not emit events"
    );

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cooperative_process_exits_gracefully() {
    let handle = start_manager().await;
    let mut spec = sleeper("nice", 1);
    spec.graceful_timeout = Some(5.0);
    let qname = handle.load("app", spec).await.expect("load");
    let pids = wait_for_pids(&handle, &qname, 1).await;

    let exits = handle.subscribe(Pattern::new("proc.nice.exit"), SubscribeOptions::default());
    handle.stop_pid(pids[0]).await.expect("stop pid");

    let exit = wait_for(&exits, |d| d.event.kind == EventKind::Exit).await;
    assert_eq!(exit.event.reaped, Some(procvisor::Reaped::Graceful));
    assert_eq!(exit.event.term_signal, Some(SIGTERM));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn stubborn_process_is_forced_within_the_ladder() {
    let handle = start_manager().await;
    let mut spec = ProcessSpec::new("slow", "sh");
    spec.args = procvisor::jobs::ArgSpec::List(vec![
        "-c".into(),
        "trap '' TERM; while true; do sleep 1; done".into(),
    ]);
    // The script calls the external `sleep`; give it the real PATH.
    spec.os_env = true;
    spec.numprocesses = 1;
    spec.graceful_timeout = Some(0.5);
    let qname = handle.load("app", spec).await.expect("load");
    let pids = wait_for_pids(&handle, &qname, 1).await;

    let exits = handle.subscribe(Pattern::new("proc.slow.exit"), SubscribeOptions::default());
    let t0 = std::time::Instant::now();
    handle.stop_pid(pids[0]).await.expect("stop pid");

    let exit = wait_for(&exits, |d| d.event.kind == EventKind::Exit).await;
    assert_eq!(exit.event.reaped, Some(procvisor::Reaped::Forced));
    assert!(
        t0.elapsed() < Duration::from_secs(2),
        "escalation took {:?}",
        t0.elapsed()
    );

    handle.stop(&qname).await.expect("stop template");
    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Signals
// ============================================================================

#[tokio::test]
async fn user_signal_kills_and_supervision_respawns() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("sig", 1)).await.expect("load");
    let before = wait_for_pids(&handle, &qname, 1).await;

    let spawns = handle.subscribe(Pattern::new("proc.sig.spawn"), SubscribeOptions::default());
    handle
        .signal_job(&qname, SIGTERM)
        .await
        .expect("signal");

    // The killed instance is replaced: a fresh spawn with a newer pid.
    let respawn = wait_for(&spawns, |d| d.event.pid > Some(before[0])).await;
    assert!(respawn.event.pid.unwrap() > before[0]);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn signal_to_terminated_pid_is_a_noop() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("gone", 1)).await.expect("load");
    let pids = wait_for_pids(&handle, &qname, 1).await;

    handle.stop(&qname).await.expect("stop");
    wait_for_pids(&handle, &qname, 0).await;

    // The pid index drops the instance after exit; signaling is either
    // NotFound or a silent no-op, never a delivery to a reused OS pid.
    match handle.signal_pid(pids[0], SIGTERM) {
        Ok(()) | Err(procvisor::Error::NotFound { .. }) => {}
        Err(e) => panic!("unexpected error: {e}"),
    }

    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Unload / drain / commit
// ============================================================================

#[tokio::test]
async fn unload_drains_then_restores_registry_state() {
    let handle = start_manager().await;
    let jobs_before = handle.jobs().await.expect("jobs");

    let qname = handle.load("app", sleeper("tmp", 2)).await.expect("load");
    wait_for_pids(&handle, &qname, 2).await;

    handle.unload(&qname).await.expect("unload");
    timeout(WAIT, async {
        loop {
            if handle.jobs().await.expect("jobs") == jobs_before {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("registry never returned to prior state");

    // The name is free again.
    handle.load("app", sleeper("tmp", 1)).await.expect("reload");
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn commit_spawns_one_off_outside_supervision() {
    let handle = start_manager().await;
    let mut spec = sleeper("base", 1);
    spec.graceful_timeout = Some(1.0);
    let qname = handle.load("app", spec).await.expect("load");
    let supervised = wait_for_pids(&handle, &qname, 1).await;

    let exits = handle.subscribe(Pattern::new("exit"), SubscribeOptions::default());
    let oneoff = handle.commit(&qname, None, None).await.expect("commit");
    assert!(!supervised.contains(&oneoff));

    // Supervised pid list is untouched by the one-off.
    assert_eq!(handle.pids(&qname).await.expect("pids"), supervised);

    // Killing the one-off must NOT trigger a replacement spawn.
    handle.stop_pid(oneoff).await.expect("stop one-off");
    wait_for(&exits, |d| d.event.pid == Some(oneoff)).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.pids(&qname).await.expect("pids"), supervised);

    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Reload / update
// ============================================================================

#[tokio::test]
async fn reload_replaces_all_instances() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("r", 2)).await.expect("load");
    let before = wait_for_pids(&handle, &qname, 2).await;

    handle.reload(&qname).await.expect("reload");

    timeout(WAIT, async {
        loop {
            let now = handle.pids(&qname).await.expect("pids");
            if now.len() == 2 && now.iter().all(|p| !before.contains(p)) {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("reload never produced two fresh instances");

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn update_with_material_change_respawns() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("u", 1)).await.expect("load");
    let before = wait_for_pids(&handle, &qname, 1).await;

    let mut changed = sleeper("u", 1);
    changed.cmd = "/bin/sleep 61".into();
    handle.update(&qname, changed).await.expect("update");

    timeout(WAIT, async {
        loop {
            let now = handle.pids(&qname).await.expect("pids");
            if now.len() == 1 && now[0] != before[0] {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("material update never respawned");

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn update_of_trivia_keeps_instances() {
    let handle = start_manager().await;
    let qname = handle.load("app", sleeper("t", 1)).await.expect("load");
    let before = wait_for_pids(&handle, &qname, 1).await;

    let mut trivia = sleeper("t", 2);
    trivia.priority = 7;
    handle.update(&qname, trivia).await.expect("update");

    let after = wait_for_pids(&handle, &qname, 2).await;
    assert!(after.contains(&before[0]), "existing instance must survive");

    handle.shutdown().await.expect("shutdown");
}

