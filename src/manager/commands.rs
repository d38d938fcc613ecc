//! # Commands crossing the thread-safe manager boundary.
//!
//! External callers (HTTP adapters, CLIs, plugins) run on arbitrary
//! threads; registry state is owned by the manager loop. Every mutation
//! and registry read travels as a [`Command`] over the loop's channel,
//! with a oneshot reply where the caller expects an answer.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Error;
use crate::jobs::ProcessSpec;
use crate::wire::{JobInfo, JobStats, ScaleOp};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// One request to the manager loop.
pub(crate) enum Command {
    /// Register a template; spawns immediately when the manager is
    /// active and `start` is set.
    Load {
        session: String,
        spec: ProcessSpec,
        start: bool,
        reply: Reply<String>,
    },
    /// Replace a template's spec; material changes respawn instances.
    Update {
        qname: String,
        spec: ProcessSpec,
        reply: Reply<()>,
    },
    /// Drain and remove a template.
    Unload { qname: String, reply: Reply<()> },
    /// Adjust the desired replica count; replies with the new value.
    Scale {
        qname: String,
        op: ScaleOp,
        reply: Reply<u32>,
    },
    /// Activate a template and converge to its spec count.
    StartJob { qname: String, reply: Reply<()> },
    /// Deactivate a template and terminate its instances.
    StopJob { qname: String, reply: Reply<()> },
    /// Stop all instances, then start fresh ones after termination.
    ReloadJob { qname: String, reply: Reply<()> },
    /// Batch-activate every template in ascending priority order.
    StartAll { reply: Reply<()> },
    /// Respawn every template's instances, ascending priority order.
    RestartAll { reply: Reply<()> },
    /// Deliver a signal to every instance of a template.
    SignalJob {
        qname: String,
        signum: i32,
        reply: Reply<()>,
    },
    /// Stop a single instance by pid.
    StopPid { pid: u64, reply: Reply<()> },
    /// One-off unsupervised spawn; replies with the internal pid.
    Commit {
        qname: String,
        env: Option<HashMap<String, String>>,
        graceful: Option<Duration>,
        reply: Reply<u64>,
    },
    /// Template plus running info.
    JobInfo { qname: String, reply: Reply<JobInfo> },
    /// Aggregate resource stats for a template.
    JobStats { qname: String, reply: Reply<JobStats> },
    /// Internal pids of a template's live instances.
    JobPids { qname: String, reply: Reply<Vec<u64>> },
    /// Wire state of a template: active or stopped.
    JobState { qname: String, reply: Reply<bool> },
    /// All qualified names, grouped session order.
    ListJobs { reply: Reply<Vec<String>> },
    /// All session ids.
    ListSessions { reply: Reply<Vec<String>> },
    /// Qualified names registered under one session.
    SessionJobs {
        session: String,
        reply: Reply<Vec<String>>,
    },
    /// Flapping retry timer fired for a parked template.
    FlapRetry { qname: String },
    /// Drain every template (reverse priority order) and stop the loop.
    Shutdown { reply: Reply<()> },
}
