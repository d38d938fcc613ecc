//! # Crash-rate ("flapping") detection.
//!
//! [`FlappingPolicy`] is the per-template policy carried by the spec,
//! wire form `[attempts, window, retry_in, max_retry]`. [`FlappingWindow`]
//! is the runtime sliding-window counter the manager consults on every
//! unexpected exit.
//!
//! ## Rules
//! - `attempts` unexpected exits within `window` seconds trip the
//!   detector.
//! - On trip the template is parked; spawns resume after `retry_in`
//!   seconds, at most `max_retry` times per trip cycle.
//! - When retries are exhausted the template is stopped for good
//!   (`stopped_flapping`).
//! - An instance that stays alive longer than `window` resets the
//!   failure counter.
//! - A full trip cycle therefore sees `attempts` exits to trip plus one
//!   further exit per consumed retry: `attempts + max_retry` exits
//!   before the template stops.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per-template crash-rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(u32, f64, f64, u32)", into = "(u32, f64, f64, u32)")]
pub struct FlappingPolicy {
    /// Unexpected exits tolerated within the window.
    pub attempts: u32,
    /// Window length in seconds.
    pub window: f64,
    /// Delay before a deferred retry, in seconds.
    pub retry_in: f64,
    /// Deferred retries before the template is stopped.
    pub max_retry: u32,
}

impl Default for FlappingPolicy {
    /// Returns the policy used when the spec enables flapping without
    /// parameters: 2 attempts in 1 s, retry after 7 s, 5 retries.
    fn default() -> Self {
        Self {
            attempts: 2,
            window: 1.0,
            retry_in: 7.0,
            max_retry: 5,
        }
    }
}

impl From<(u32, f64, f64, u32)> for FlappingPolicy {
    fn from((attempts, window, retry_in, max_retry): (u32, f64, f64, u32)) -> Self {
        Self {
            attempts,
            window,
            retry_in,
            max_retry,
        }
    }
}

impl From<FlappingPolicy> for (u32, f64, f64, u32) {
    fn from(p: FlappingPolicy) -> Self {
        (p.attempts, p.window, p.retry_in, p.max_retry)
    }
}

impl FlappingPolicy {
    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window.max(0.0))
    }

    /// Retry delay as a duration.
    pub fn retry_in(&self) -> Duration {
        Duration::from_secs_f64(self.retry_in.max(0.0))
    }
}

/// Outcome of recording an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlappingVerdict {
    /// Below the threshold; keep respawning normally.
    Ok,
    /// The detector tripped; park the template and retry after the
    /// delay.
    Retry { delay: Duration },
    /// Retries exhausted; stop the template and emit `stopped_flapping`.
    GiveUp,
}

/// Runtime sliding-window state for one template.
#[derive(Debug)]
pub struct FlappingWindow {
    policy: FlappingPolicy,
    /// Timestamps of recent unexpected exits, newest last.
    history: VecDeque<Instant>,
    /// Deferred retries consumed in the current trip cycle.
    retries: u32,
}

impl FlappingWindow {
    /// Creates an empty window for the given policy.
    pub fn new(policy: FlappingPolicy) -> Self {
        Self {
            policy,
            history: VecDeque::with_capacity(policy.attempts as usize),
            retries: 0,
        }
    }

    /// The policy this window enforces.
    pub fn policy(&self) -> &FlappingPolicy {
        &self.policy
    }

    /// Clears the exit history and the retry count.
    pub fn reset(&mut self) {
        self.history.clear();
        self.retries = 0;
    }

    /// Records an unexpected exit of an instance that lived for
    /// `uptime`, and decides what the manager should do.
    pub fn record_exit(&mut self, uptime: Duration, now: Instant) -> FlappingVerdict {
        // A long-lived run proves the template healthy again.
        if uptime >= self.policy.window() {
            self.reset();
        }

        self.history.push_back(now);
        while self.history.len() > self.policy.attempts as usize {
            self.history.pop_front();
        }

        if (self.history.len() as u32) < self.policy.attempts {
            return FlappingVerdict::Ok;
        }

        let span = match (self.history.front(), self.history.back()) {
            (Some(first), Some(last)) => last.duration_since(*first),
            _ => return FlappingVerdict::Ok,
        };
        if span > self.policy.window() {
            // The burst spread past the window; start counting afresh.
            self.history.clear();
            return FlappingVerdict::Ok;
        }

        if self.retries < self.policy.max_retry {
            self.retries += 1;
            FlappingVerdict::Retry {
                delay: self.policy.retry_in(),
            }
        } else {
            self.reset();
            FlappingVerdict::GiveUp
        }
    }
}
