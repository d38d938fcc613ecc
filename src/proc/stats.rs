//! # Per-instance resource statistics.
//!
//! [`ProcStats`] is one sample of OS-level resource usage for a child
//! process and its descendants. The sampler task runs at a fixed
//! cadence while the instance is alive, but only touches the OS when
//! someone is listening: sampling is gated on a live subscription to
//! the instance's (`stats.<pid>`) or the template's (`stats.<name>`)
//! stats topic.

use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::events::{job_stats_topic, stats_topic, Event, EventEmitter, EventKind};

/// One resource usage sample.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ProcStats {
    /// CPU usage percentage since the previous sample.
    pub cpu: f32,
    /// Resident memory as a percentage of total system memory.
    pub mem: f32,
    /// Resident set size in bytes.
    pub rss: u64,
    /// Virtual memory size in bytes.
    pub vsz: u64,
    /// Cumulative CPU time in milliseconds.
    pub cpu_time: u64,
    /// Number of direct child processes.
    pub children: u32,
    /// Aggregate resident memory of direct children, in bytes.
    pub children_rss: u64,
    /// Aggregate CPU percentage of direct children.
    pub children_cpu: f32,
}

/// Reads one sample for `os_pid` from a refreshed [`System`].
fn sample(system: &mut System, os_pid: u32) -> Option<ProcStats> {
    // A full refresh is required for CPU percentages to be computed.
    system.refresh_all();

    let pid = Pid::from_u32(os_pid);
    let target = system.process(pid)?;

    let total_memory = system.total_memory();
    let rss = target.memory();
    let mem = if total_memory > 0 {
        (rss as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let mut children = 0u32;
    let mut children_rss = 0u64;
    let mut children_cpu = 0.0f32;
    for p in system.processes().values() {
        if p.parent() == Some(pid) {
            children += 1;
            children_rss += p.memory();
            children_cpu += p.cpu_usage();
        }
    }

    Some(ProcStats {
        cpu: target.cpu_usage(),
        mem,
        rss,
        vsz: target.virtual_memory(),
        cpu_time: target.accumulated_cpu_time(),
        children,
        children_rss,
        children_cpu,
    })
}

/// One-shot sample for read views (`GET .../stats`). CPU reads near
/// zero without a baseline refresh; memory figures are exact.
pub(crate) fn sample_once(os_pid: u32) -> Option<ProcStats> {
    let mut system = System::new();
    sample(&mut system, os_pid)
}

/// Spawns the gated sampler task for one instance.
///
/// Publishes each sample on `stats.<pid>` and `stats.<qname>` until
/// the token is cancelled.
pub(crate) fn spawn_sampler(
    emitter: EventEmitter,
    interval: Duration,
    pid: u64,
    os_pid: u32,
    qname: String,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let pid_topic = stats_topic(pid);
        let job_topic = job_stats_topic(&qname);
        let mut system = System::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // No listeners: skip the OS work entirely.
            if !emitter.has_subscribers(&pid_topic) && !emitter.has_subscribers(&job_topic) {
                continue;
            }

            let Some(stats) = sample(&mut system, os_pid) else {
                trace!(pid, os_pid, "stats sample missed, process gone");
                continue;
            };

            let event = Event::now(EventKind::Stat)
                .with_name(&qname)
                .with_pid(pid)
                .with_os_pid(os_pid)
                .with_stats(stats);
            emitter.publish(pid_topic.clone(), event.clone());
            emitter.publish(job_topic.clone(), event);
        }
    });
}
