//! # Global manager configuration.
//!
//! [`ManagerConfig`] centralizes the tunables of the supervision core:
//! channel depths, default timeouts, the kill escalation grace, stream
//! buffer sizes, and the stats sampling cadence.

use std::time::Duration;

/// Configuration for the manager loop and the resources it creates.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Depth of the command channel between handles and the loop.
    pub command_queue: usize,
    /// Default per-subscription event queue capacity.
    pub subscription_queue: usize,
    /// Graceful shutdown timeout applied when a spec omits one.
    pub graceful_timeout: Duration,
    /// Extra wait after SIGKILL before an instance is forcibly released.
    pub forced_kill_grace: Duration,
    /// Cadence of the per-instance resource stats sampler.
    pub stats_interval: Duration,
    /// Per-stream ring buffer capacity in bytes (recent output backlog).
    pub stream_backlog: usize,
    /// Depth of the per-instance stdin write queue, in chunks.
    pub stdin_queue: usize,
    /// Grace period for draining instances on manager shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    /// Provides a default configuration:
    /// - `command_queue = 256`
    /// - `subscription_queue = 1024`
    /// - `graceful_timeout = 30s`
    /// - `forced_kill_grace = 2s`
    /// - `stats_interval = 100ms`
    /// - `stream_backlog = 64 KiB`
    /// - `stdin_queue = 64`
    /// - `shutdown_grace = 30s`
    fn default() -> Self {
        Self {
            command_queue: 256,
            subscription_queue: 1024,
            graceful_timeout: Duration::from_secs(30),
            forced_kill_grace: Duration::from_secs(2),
            stats_interval: Duration::from_millis(100),
            stream_backlog: 64 * 1024,
            stdin_queue: 64,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}
