//! # Lifecycle and telemetry events published by the core.
//!
//! The [`EventKind`] enum classifies events across three categories:
//! - **Template events**: create, start, stop, restart, update, delete
//! - **Instance events**: spawn, spawn_error, reap, exit, stop_pid
//! - **Telemetry events**: stat samples, stream chunks, flapping, heartbeats
//!
//! The [`Event`] struct carries the discriminant plus optional metadata
//! (qualified name, internal pid, OS pid, exit status, chunk data, stats).
//! Events serialize to the flat wire form external adapters relay:
//!
//! ```json
//! {"event": "spawn", "name": "app.w", "pid": 3, "os_pid": 4021}
//! ```
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically, so subscribers can re-order events received across
//! async boundaries. `seq` and the wall-clock timestamp are not part of
//! the wire payload.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use serde::{Serialize, Serializer};

use crate::events::pattern::Topic;
use crate::proc::stats::ProcStats;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// How a terminated instance was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaped {
    /// The process exited on its own.
    Normal,
    /// The process exited after a graceful stop request.
    Graceful,
    /// The kill escalation path was taken.
    Forced,
}

impl Reaped {
    /// Returns the stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reaped::Normal => "normal",
            Reaped::Graceful => "graceful",
            Reaped::Forced => "forced",
        }
    }
}

/// Classification of core events. Wire names are the canonical topic
/// names external adapters subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // === Template lifecycle ===
    /// A template was registered.
    Create,
    /// A template started launching instances.
    Start,
    /// All instances of a template are being stopped.
    Stop,
    /// All instances of a template are being restarted.
    Restart,
    /// A template spec or replica count was updated.
    Update,
    /// A template was unloaded.
    Delete,

    // === Instance lifecycle ===
    /// A new instance was spawned.
    Spawn,
    /// An exec/fork failure occurred while spawning.
    SpawnError,
    /// An instance is being reaped on scale-down.
    Reap,
    /// An instance exited.
    Exit,
    /// A single instance was stopped by pid.
    StopPid,

    // === Flapping ===
    /// The crash-rate detector tripped; spawns are deferred.
    Flap,
    /// Deferred retries were exhausted; the template is stopped.
    StoppedFlapping,

    // === Telemetry ===
    /// A resource stats sample.
    Stat,
    /// A raw stdio chunk.
    #[serde(rename = "stream")]
    StreamChunk,
    /// Zero-payload keepalive synthesized for idle subscriptions.
    Heartbeat,
}

impl EventKind {
    /// Returns the canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Restart => "restart",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Spawn => "spawn",
            EventKind::SpawnError => "spawn_error",
            EventKind::Reap => "reap",
            EventKind::Exit => "exit",
            EventKind::StopPid => "stop_pid",
            EventKind::Flap => "flap",
            EventKind::StoppedFlapping => "stopped_flapping",
            EventKind::Stat => "stat",
            EventKind::StreamChunk => "stream",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

/// Core event with optional metadata.
///
/// Fields not relevant to the event kind stay `None` and are omitted
/// from the wire payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    #[serde(skip)]
    pub seq: u64,
    /// Wall-clock timestamp (logging only, may go backwards).
    #[serde(skip)]
    pub at: SystemTime,
    /// The kind of event; serializes as the `event` payload field.
    #[serde(rename = "event")]
    pub kind: EventKind,
    /// Qualified template name (`session.name`), if applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Manager-internal pid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u64>,
    /// Backing OS pid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_pid: Option<u32>,
    /// Exit status, once terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// Terminating signal, if the process died on one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term_signal: Option<i32>,
    /// Reap classification for exit events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaped: Option<Reaped>,
    /// Stream label for chunk events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Raw chunk bytes for stream events.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_lossy_bytes"
    )]
    pub data: Option<Vec<u8>>,
    /// Resource sample for stat events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ProcStats>,
    /// Retry delay in seconds for flapping events.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_secs"
    )]
    pub delay: Option<Duration>,
    /// Error message, if the event represents a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Creates a new event of the given kind with the next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            name: None,
            pid: None,
            os_pid: None,
            exit_status: None,
            term_signal: None,
            reaped: None,
            label: None,
            data: None,
            stats: None,
            delay: None,
            error: None,
        }
    }

    /// Attaches the qualified template name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attaches the internal pid.
    pub fn with_pid(mut self, pid: u64) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches the OS pid.
    pub fn with_os_pid(mut self, os_pid: u32) -> Self {
        self.os_pid = Some(os_pid);
        self
    }

    /// Attaches exit status, terminating signal and reap classification.
    pub fn with_exit(
        mut self,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
        reaped: Reaped,
    ) -> Self {
        self.exit_status = exit_status;
        self.term_signal = term_signal;
        self.reaped = Some(reaped);
        self
    }

    /// Attaches a stream label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attaches raw chunk bytes.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches a resource sample.
    pub fn with_stats(mut self, stats: ProcStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Attaches a retry delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }
}

/// Canonical topic for a template-scoped event: `proc.<name>.<kind>`.
///
/// `name` is the unqualified template name; the payload carries the
/// qualified form.
pub fn job_topic(name: &str, kind: EventKind) -> Topic {
    Topic::new(format!("proc.{}.{}", name, kind.as_str()))
}

/// Canonical topic for a stream chunk: `stream.<pid>.<label>`.
pub fn stream_topic(pid: u64, label: &str) -> Topic {
    Topic::new(format!("stream.{pid}.{label}"))
}

/// Canonical topic for instance stat samples: `stats.<pid>`.
pub fn stats_topic(pid: u64) -> Topic {
    Topic::new(format!("stats.{pid}"))
}

/// Canonical topic for template stat samples: `stats.<qname>`.
pub fn job_stats_topic(qname: &str) -> Topic {
    Topic::new(format!("stats.{qname}"))
}

fn serialize_lossy_bytes<S: Serializer>(
    data: &Option<Vec<u8>>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match data {
        Some(bytes) => s.serialize_str(&String::from_utf8_lossy(bytes)),
        None => s.serialize_none(),
    }
}

fn serialize_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_f64(d.as_secs_f64()),
        None => s.serialize_none(),
    }
}
