//! Integration tests for stdio multiplexing: stdin round-trips, chunk
//! fan-out, stderr merging, backlog replay and heartbeats.

use std::time::Duration;

use procvisor::jobs::ArgSpec;
use procvisor::{
    Delivery, EventKind, Manager, ManagerConfig, ManagerHandle, Pattern, ProcessSpec,
    SubscribeOptions, Subscription,
};
use tokio::time::{sleep, timeout};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

async fn start_manager() -> ManagerHandle {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (handle, _join) = Manager::spawn(ManagerConfig::default());
    handle.start_all().await.expect("start_all should succeed");
    handle
}

/// `/bin/cat` with stdin and one output label: echoes what we write.
fn cat_spec(name: &str) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "/bin/cat");
    spec.redirect_input = true;
    spec.redirect_output = vec!["out".into()];
    spec.graceful_timeout = Some(1.0);
    spec
}

fn shell_spec(name: &str, script: &str) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "sh");
    spec.args = ArgSpec::List(vec!["-c".into(), script.into()]);
    // Scripts call external binaries; give them the real PATH.
    spec.os_env = true;
    spec.graceful_timeout = Some(1.0);
    spec
}

async fn first_pid(handle: &ManagerHandle, qname: &str) -> u64 {
    timeout(WAIT, async {
        loop {
            let pids = handle.pids(qname).await.expect("pids");
            if let Some(pid) = pids.first() {
                return *pid;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("instance never appeared")
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
    .expect("timed out waiting for delivery")
}

/// Accumulates chunk payloads from a stream subscription until `needle`
/// shows up in the collected bytes.
async fn collect_until(sub: &Subscription, needle: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    timeout(WAIT, async {
        loop {
            let d = match sub.recv().await {
                Ok(d) => d,
                Err(procvisor::Error::BackpressureDropped { .. }) => continue,
                Err(e) => panic!("subscription died: {e}"),
            };
            if d.event.kind != EventKind::StreamChunk {
                continue;
            }
            if let Some(data) = &d.event.data {
                collected.extend_from_slice(data);
            }
            if collected
                .windows(needle.len())
                .any(|w| w == needle)
            {
                return;
            }
        }
    })
    .await
    .expect("needle never arrived on the stream");
    collected
}

// ============================================================================
// Stdin round-trip
// ============================================================================

#[tokio::test]
async fn stdin_round_trips_through_cat() {
    let handle = start_manager().await;
    let qname = handle.load("app", cat_spec("echo")).await.expect("load");
    let pid = first_pid(&handle, &qname).await;

    let stream = handle
        .subscribe_stream(pid, "out", SubscribeOptions::default())
        .expect("subscribe stream");

    handle
        .write_stdin(pid, b"hello\n".to_vec())
        .await
        .expect("write stdin");

    let data = collect_until(&stream, b"hello\n").await;
    assert!(data.ends_with(b"hello\n"));

    // The backlog kept the recent output for late subscribers.
    let backlog = handle.stream_backlog(pid, "out").expect("backlog");
    assert!(backlog.windows(6).any(|w| w == b"hello\n"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn concurrent_writers_do_not_interleave_chunks() {
    let handle = start_manager().await;
    let qname = handle.load("app", cat_spec("multi")).await.expect("load");
    let pid = first_pid(&handle, &qname).await;

    let stream = handle
        .subscribe_stream(pid, "out", SubscribeOptions::default())
        .expect("subscribe stream");

    // Two tasks hammer stdin with distinct markers; each queued chunk
    // must surface intact.
    let h1 = handle.clone();
    let h2 = handle.clone();
    let a = tokio::spawn(async move {
        for _ in 0..20 {
            h1.write_stdin(pid, b"<AAAA>".to_vec()).await.expect("write a");
        }
    });
    let b = tokio::spawn(async move {
        for _ in 0..20 {
            h2.write_stdin(pid, b"<BBBB>".to_vec()).await.expect("write b");
        }
    });
    a.await.unwrap();
    b.await.unwrap();
    handle.write_stdin(pid, b"<END>".to_vec()).await.expect("end");

    let data = collect_until(&stream, b"<END>").await;
    let text = String::from_utf8_lossy(&data);
    // Scan every marker: no torn tokens like "<AA<BBBB>AA>".
    let mut rest = text.as_ref();
    while let Some(start) = rest.find('<') {
        let token = &rest[start..];
        assert!(
            token.starts_with("<AAAA>") || token.starts_with("<BBBB>") || token.starts_with("<END>"),
            "interleaved write detected: {text}"
        );
        rest = &token[1..];
    }

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn stdin_without_redirect_is_invalid_state() {
    let handle = start_manager().await;
    let qname = handle
        .load("app", shell_spec("silent", "sleep 60"))
        .await
        .expect("load");
    let pid = first_pid(&handle, &qname).await;

    let err = handle.write_stdin(pid, b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, procvisor::Error::InvalidState { .. }));

    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Output fan-out
// ============================================================================

#[tokio::test]
async fn stdout_and_stderr_route_to_their_labels() {
    let handle = start_manager().await;
    let mut spec = shell_spec("split", "echo to-out; echo to-err 1>&2; sleep 60");
    spec.redirect_output = vec!["o".into(), "e".into()];
    let qname = handle.load("app", spec).await.expect("load");
    let pid = first_pid(&handle, &qname).await;

    let out = handle
        .subscribe_stream(pid, "o", SubscribeOptions::default())
        .expect("subscribe o");
    let err = handle
        .subscribe_stream(pid, "e", SubscribeOptions::default())
        .expect("subscribe e");

    let out_chunk = wait_for(&out, |d| d.event.kind == EventKind::StreamChunk).await;
    assert_eq!(out_chunk.event.label.as_deref(), Some("o"));
    assert!(out_chunk.event.data.as_deref().unwrap().starts_with(b"to-out"));

    let err_chunk = wait_for(&err, |d| d.event.kind == EventKind::StreamChunk).await;
    assert_eq!(err_chunk.event.label.as_deref(), Some("e"));
    assert!(err_chunk.event.data.as_deref().unwrap().starts_with(b"to-err"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn repeated_label_merges_stderr_into_stdout() {
    let handle = start_manager().await;
    let mut spec = shell_spec("merged", "echo one; echo two 1>&2; sleep 60");
    spec.redirect_output = vec!["both".into(), "both".into()];
    let qname = handle.load("app", spec).await.expect("load");
    let pid = first_pid(&handle, &qname).await;

    let stream = handle
        .subscribe_stream(pid, "both", SubscribeOptions::default())
        .expect("subscribe merged");

    // Both lines arrive on the single merged topic.
    let mut seen = Vec::new();
    timeout(WAIT, async {
        loop {
            let d = match stream.recv().await {
                Ok(d) => d,
                Err(_) => continue,
            };
            if let Some(data) = &d.event.data {
                seen.extend_from_slice(data);
            }
            let text = String::from_utf8_lossy(&seen);
            if text.contains("one") && text.contains("two") {
                return;
            }
        }
    })
    .await
    .expect("merged stream never carried both lines");

    // Unknown labels still 404.
    assert!(handle
        .subscribe_stream(pid, "other", SubscribeOptions::default())
        .is_err());

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unknown_stream_label_is_not_found() {
    let handle = start_manager().await;
    let qname = handle.load("app", cat_spec("lbl")).await.expect("load");
    let pid = first_pid(&handle, &qname).await;

    assert!(matches!(
        handle.subscribe_stream(pid, "nope", SubscribeOptions::default()),
        Err(procvisor::Error::NotFound { .. })
    ));
    assert!(matches!(
        handle.stream_backlog(pid, "nope"),
        Err(procvisor::Error::NotFound { .. })
    ));

    handle.shutdown().await.expect("shutdown");
}

// ============================================================================
// Heartbeats and ordering
// ============================================================================

#[tokio::test]
async fn idle_stream_emits_heartbeats_when_requested() {
    let handle = start_manager().await;
    let qname = handle
        .load("app", shell_spec("quiet", "sleep 60"))
        .await
        .expect("load");
    let pid = first_pid(&handle, &qname).await;

    let sub = handle.subscribe(
        Pattern::new(format!("stream.{pid}.")),
        SubscribeOptions {
            heartbeat: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );

    let d = timeout(WAIT, sub.recv()).await.expect("recv").expect("delivery");
    assert_eq!(d.event.kind, EventKind::Heartbeat);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn chunks_preserve_write_order_per_subscriber() {
    let handle = start_manager().await;
    let qname = handle.load("app", cat_spec("order")).await.expect("load");
    let pid = first_pid(&handle, &qname).await;

    let stream = handle
        .subscribe_stream(pid, "out", SubscribeOptions::default())
        .expect("subscribe");

    for i in 0..10u8 {
        handle
            .write_stdin(pid, format!("line-{i};").into_bytes())
            .await
            .expect("write");
    }

    let data = collect_until(&stream, b"line-9;").await;
    let text = String::from_utf8_lossy(&data);
    let positions: Vec<usize> = (0..10)
        .map(|i| text.find(&format!("line-{i};")).expect("line present"))
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "chunks arrived out of order: {text}");

    handle.shutdown().await.expect("shutdown");
}
