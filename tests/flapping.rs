//! Integration tests for crash-rate handling: trip, deferred retries,
//! give-up, and spawn-failure accounting.

use std::time::Duration;

use procvisor::{
    Delivery, EventKind, FlappingPolicy, Manager, ManagerConfig, ManagerHandle, Pattern,
    ProcessSpec, SubscribeOptions, Subscription,
};
use tokio::time::{sleep, timeout};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

async fn start_manager() -> ManagerHandle {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (handle, _join) = Manager::spawn(ManagerConfig::default());
    handle.start_all().await.expect("start_all should succeed");
    handle
}

/// A template that dies instantly, with fast retry timing.
fn crasher(name: &str, attempts: u32, retry_in: f64, max_retry: u32) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "/bin/false");
    spec.numprocesses = 1;
    spec.flapping = Some(FlappingPolicy {
        attempts,
        window: 10.0,
        retry_in,
        max_retry,
    });
    spec
}

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

// ============================================================================
// Trip and give up
// ============================================================================

#[tokio::test]
async fn flapping_trips_then_stops_the_template() {
    let handle = start_manager().await;
    let events = handle.subscribe(
        Pattern::new("."),
        SubscribeOptions {
            capacity: Some(4096),
            ..Default::default()
        },
    );

    // Three crashes in the window trip the detector; each of the two
    // deferred retries respawns one instance whose crash consumes the
    // retry, then the template is stopped for good.
    let qname = handle
        .load("app", crasher("crash", 3, 0.2, 2))
        .await
        .expect("load");

    let mut exits = 0;
    let mut flaps = 0;
    let stopped = timeout(WAIT, async {
        loop {
            let d = match events.recv().await {
                Ok(d) => d,
                Err(_) => continue,
            };
            match d.event.kind {
                EventKind::Exit => exits += 1,
                EventKind::Flap => flaps += 1,
                EventKind::StoppedFlapping => return d,
                _ => {}
            }
        }
    })
    .await
    .expect("never saw stopped_flapping");

    assert_eq!(stopped.event.name.as_deref(), Some(qname.as_str()));
    // attempts exits to trip + one per consumed retry: 3 + 2.
    assert_eq!(exits, 5, "expected 3 trip exits + 2 retry exits, saw {exits}");
    assert_eq!(flaps, 2, "one flap event per deferred retry");

    // The template reads as stopped and spawns nothing further.
    assert!(!handle.job_state(&qname).await.expect("state"));
    sleep(Duration::from_millis(300)).await;
    assert!(handle.pids(&qname).await.expect("pids").is_empty());

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn one_stopped_flapping_per_trip_cycle() {
    let handle = start_manager().await;
    let stopped = handle.subscribe(Pattern::new("stopped_flapping"), SubscribeOptions::default());

    let qname = handle
        .load("app", crasher("once", 2, 0.1, 0))
        .await
        .expect("load");

    wait_for(&stopped, |d| d.event.kind == EventKind::StoppedFlapping).await;
    sleep(Duration::from_millis(300)).await;
    assert!(
        stopped.try_recv().is_none(),
        "stopped_flapping must fire exactly once per cycle"
    );
    assert!(!handle.job_state(&qname).await.expect("state"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn restart_after_giveup_gets_a_fresh_window() {
    let handle = start_manager().await;
    let stopped = handle.subscribe(Pattern::new("stopped_flapping"), SubscribeOptions::default());

    let qname = handle
        .load("app", crasher("again", 2, 0.1, 0))
        .await
        .expect("load");
    wait_for(&stopped, |_| true).await;

    // Explicit start resets the window; the template trips again
    // rather than being stuck half-counted.
    handle.start(&qname).await.expect("restart");
    wait_for(&stopped, |_| true).await;

    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Spawn failures
// ============================================================================

#[tokio::test]
async fn spawn_failures_feed_the_detector() {
    let handle = start_manager().await;
    let events = handle.subscribe(
        Pattern::new("."),
        SubscribeOptions {
            capacity: Some(4096),
            ..Default::default()
        },
    );

    let mut spec = ProcessSpec::new("ghost", "/definitely/not/a/binary");
    spec.numprocesses = 1;
    spec.flapping = Some(FlappingPolicy {
        attempts: 2,
        window: 10.0,
        retry_in: 0.1,
        max_retry: 0,
    });
    let qname = handle.load("app", spec).await.expect("load");

    let mut spawn_errors = 0;
    timeout(WAIT, async {
        loop {
            let d = match events.recv().await {
                Ok(d) => d,
                Err(_) => continue,
            };
            match d.event.kind {
                EventKind::SpawnError => spawn_errors += 1,
                EventKind::StoppedFlapping => return,
                _ => {}
            }
        }
    })
    .await
    .expect("spawn failures never tripped the detector");

    assert!(spawn_errors >= 2);
    assert!(!handle.job_state(&qname).await.expect("state"));

    handle.shutdown().await.expect("shutdown");
}
