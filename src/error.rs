//! # Error types surfaced by the supervision core.
//!
//! A single [`Error`] enum covers every fault an API caller can observe
//! synchronously. Asynchronous faults (spawn failures, flapping trips,
//! forced kills) are published as events instead; the originating call
//! returns `Ok` when it only scheduled the operation.
//!
//! `as_label` returns a short stable snake_case tag for logs and metrics.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the supervision core.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Template, instance, or stream unknown.
    #[error("'{name}' not found")]
    NotFound {
        /// The missing qualified name, pid, or stream label.
        name: String,
    },

    /// Duplicate template load within a session.
    #[error("job '{name}' already exists")]
    AlreadyExists {
        /// The duplicate qualified name.
        name: String,
    },

    /// Spec validation failure.
    #[error("invalid spec field '{field}': {reason}")]
    InvalidSpec {
        /// The offending field.
        field: &'static str,
        reason: String,
    },

    /// Operation illegal in the current state (e.g. stdin write to a
    /// template without `redirect_input`).
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    /// OS-level exec/fork failure.
    #[error("spawn failed (errno {errno}): {reason}")]
    Spawn {
        /// Raw OS errno, 0 when unknown.
        errno: i32,
        reason: String,
    },

    /// Graceful timer elapsed; the kill escalation path was taken.
    #[error("graceful timeout {timeout:?} exceeded for pid {pid}")]
    TerminateTimeout { pid: u64, timeout: Duration },

    /// The template is in retry or stopped-flapping state.
    #[error("job '{name}' is flapping")]
    Flapping { name: String },

    /// Subscriber queue overflowed under a drop policy; `dropped` events
    /// were discarded since the last successful receive.
    #[error("{dropped} event(s) dropped on subscriber queue overflow")]
    BackpressureDropped { dropped: u64 },

    /// A non-blocking stdin write found the queue full.
    #[error("stdin queue full, write would block")]
    WouldBlock,

    /// The subscription was closed (unsubscribed, disconnected by
    /// overflow policy, or the emitter shut down).
    #[error("subscription closed")]
    SubscriptionClosed,

    /// Unparseable signal name or number.
    #[error("invalid signal '{value}'")]
    InvalidSignal { value: String },

    /// Unparseable scale operation (expected `+N`, `-N`, `=N` or an int).
    #[error("invalid scale operation '{value}'")]
    InvalidScaleOp { value: String },

    /// The manager loop has shut down and no longer accepts commands.
    #[error("manager closed")]
    ManagerClosed,
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::InvalidSpec { .. } => "invalid_spec",
            Error::InvalidState { .. } => "invalid_state",
            Error::Spawn { .. } => "spawn_error",
            Error::TerminateTimeout { .. } => "terminate_timeout",
            Error::Flapping { .. } => "flapping",
            Error::BackpressureDropped { .. } => "backpressure_dropped",
            Error::WouldBlock => "would_block",
            Error::SubscriptionClosed => "subscription_closed",
            Error::InvalidSignal { .. } => "invalid_signal",
            Error::InvalidScaleOp { .. } => "invalid_scale_op",
            Error::ManagerClosed => "manager_closed",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Spawn {
            errno: e.raw_os_error().unwrap_or(0),
            reason: e.to_string(),
        }
    }
}
