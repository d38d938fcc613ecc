//! # Runtime state of a registered template.
//!
//! [`ProcessTemplate`] pairs a [`ProcessSpec`] with everything the
//! manager tracks about it at runtime: the desired replica count, the
//! running instances in spawn order, stop/drain/park flags and the
//! flapping window.
//!
//! ## Rules
//! - Mutated only by the manager loop; never shared across threads.
//! - `running` keeps spawn order so scale-down can pick the newest
//!   instance first.
//! - Instances being replaced (update/reload) keep their slot until
//!   they exit, which delays replacement spawns until termination.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::jobs::flapping::{FlappingVerdict, FlappingWindow};
use crate::jobs::spec::ProcessSpec;

/// A registered template and its runtime supervision state.
pub struct ProcessTemplate {
    spec: Arc<ProcessSpec>,
    session: String,
    qname: String,
    /// Registration order, tie-breaker inside a priority bucket.
    reg_seq: u64,
    /// Desired replica count; starts at `spec.numprocesses`, moved by
    /// scale, reset by start/reload.
    desired: u32,
    /// Explicitly stopped (stop call, flapping give-up).
    stopped: bool,
    /// Unload in progress; the template disappears after the drain.
    draining: bool,
    /// Flapping trip pending its retry timer.
    parked: bool,
    /// Supervised pids in spawn order, oldest first.
    running: Vec<u64>,
    /// Pids terminating for replacement; they hold their slot until
    /// exit so new spawns wait for the old process to go away.
    replacing: HashSet<u64>,
    /// Unsupervised one-off pids (commit), drained with the template.
    oneoffs: HashSet<u64>,
    flapping: Option<FlappingWindow>,
}

impl ProcessTemplate {
    pub fn new(session: &str, spec: ProcessSpec, reg_seq: u64) -> Self {
        let qname = format!("{}.{}", session, spec.name);
        let desired = spec.numprocesses;
        let flapping = spec.flapping.map(FlappingWindow::new);
        Self {
            spec: Arc::new(spec),
            session: session.to_string(),
            qname,
            reg_seq,
            desired,
            stopped: false,
            draining: false,
            parked: false,
            running: Vec::new(),
            replacing: HashSet::new(),
            oneoffs: HashSet::new(),
            flapping,
        }
    }

    // ---- identity ----

    pub fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Unqualified template name (used in topic paths).
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Qualified `session.name` (used in payloads).
    pub fn qname(&self) -> &str {
        &self.qname
    }

    pub fn reg_seq(&self) -> u64 {
        self.reg_seq
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    // ---- desired count ----

    pub fn desired(&self) -> u32 {
        self.desired
    }

    /// Adjusts the desired count by a signed delta, clamped at zero.
    /// Returns the new value.
    pub fn adjust_desired(&mut self, delta: i64) -> u32 {
        let next = (self.desired as i64 + delta).max(0);
        self.desired = next as u32;
        self.desired
    }

    pub fn set_desired(&mut self, n: u32) -> u32 {
        self.desired = n;
        self.desired
    }

    /// Resets the desired count to the spec value (start/reload path).
    pub fn reset_desired(&mut self) {
        self.desired = self.spec.numprocesses;
        if let Some(fw) = &mut self.flapping {
            fw.reset();
        }
    }

    // ---- flags ----

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    pub fn draining(&self) -> bool {
        self.draining
    }

    pub fn set_draining(&mut self) {
        self.draining = true;
        self.stopped = true;
    }

    pub fn parked(&self) -> bool {
        self.parked
    }

    pub fn set_parked(&mut self, parked: bool) {
        self.parked = parked;
    }

    /// True when the reconciler may spawn for this template.
    pub fn may_spawn(&self) -> bool {
        !self.stopped && !self.draining && !self.parked
    }

    /// Wire state: 1 while the template actively supervises, else 0.
    pub fn active(&self) -> bool {
        !self.stopped && !self.parked
    }

    // ---- running set ----

    pub fn running(&self) -> &[u64] {
        &self.running
    }

    pub fn push_running(&mut self, pid: u64) {
        self.running.push(pid);
    }

    /// Removes a pid from the running set. Returns true if present.
    pub fn remove_running(&mut self, pid: u64) -> bool {
        self.replacing.remove(&pid);
        let before = self.running.len();
        self.running.retain(|p| *p != pid);
        self.running.len() != before
    }

    /// Picks the newest instance not already being replaced, for
    /// LIFO scale-down.
    pub fn newest_removable(&self) -> Option<u64> {
        self.running
            .iter()
            .rev()
            .find(|pid| !self.replacing.contains(pid))
            .copied()
    }

    /// Marks a pid as terminating-for-replacement; it keeps its slot
    /// until exit.
    pub fn mark_replacing(&mut self, pid: u64) {
        self.replacing.insert(pid);
    }

    // ---- one-offs ----

    pub fn push_oneoff(&mut self, pid: u64) {
        self.oneoffs.insert(pid);
    }

    pub fn remove_oneoff(&mut self, pid: u64) -> bool {
        self.oneoffs.remove(&pid)
    }

    pub fn oneoffs(&self) -> impl Iterator<Item = u64> + '_ {
        self.oneoffs.iter().copied()
    }

    /// True when nothing supervised or one-off remains alive.
    pub fn idle(&self) -> bool {
        self.running.is_empty() && self.oneoffs.is_empty()
    }

    // ---- spec replacement ----

    /// Installs a new spec (update path). The desired count follows the
    /// new spec; the flapping window is rebuilt when the policy changed.
    pub fn replace_spec(&mut self, spec: ProcessSpec) {
        let policy_changed = self.spec.flapping != spec.flapping;
        self.desired = spec.numprocesses;
        if policy_changed {
            self.flapping = spec.flapping.map(FlappingWindow::new);
        }
        self.spec = Arc::new(spec);
    }

    // ---- flapping ----

    /// Feeds one unexpected exit into the flapping window, if a policy
    /// is configured.
    pub fn record_unexpected_exit(
        &mut self,
        uptime: Duration,
        now: Instant,
    ) -> Option<FlappingVerdict> {
        self.flapping.as_mut().map(|fw| fw.record_exit(uptime, now))
    }
}
