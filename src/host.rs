//! # ApplicationHost: auxiliary long-lived collaborators.
//!
//! External transports and integrations (HTTP server, webhook
//! dispatcher, plugins) attach to the core as [`Application`]s. The
//! host keeps them oblivious to each other and to the manager's
//! internals:
//!
//! - apps start **after** the manager loop is live,
//! - apps stop **before** the manager tears instances down,
//! - a failing `start` marks the app failed but never aborts startup.
//!
//! ## Rules
//! - The host only sees the [`Application`] capability, never concrete
//!   types.
//! - Stop order is the reverse of start order.
//! - Panics inside an app's `start`/`stop`/`restart` are caught and
//!   isolated: the app is marked failed, the host and the manager keep
//!   running.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::Error;
use crate::manager::ManagerHandle;

/// A long-lived collaborator attached to the supervision core.
///
/// Implementations receive a [`ManagerHandle`] on start and talk to the
/// core exclusively through it.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Starts the app against a live manager.
    async fn start(&self, manager: ManagerHandle) -> Result<(), Error>;

    /// Stops the app. Must be idempotent.
    async fn stop(&self);

    /// Restarts the app in place. The default implementation does
    /// nothing; apps with restartable state override it.
    async fn restart(&self) {}

    /// Returns the app name for logging.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Lifecycle state of one hosted app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Stopped,
    Running,
    Failed,
}

struct AppEntry {
    app: Arc<dyn Application>,
    state: AppState,
}

/// Hosts a set of [`Application`]s around a manager's lifecycle.
#[derive(Default)]
pub struct ApplicationHost {
    apps: Vec<AppEntry>,
}

impl ApplicationHost {
    pub fn new() -> Self {
        Self { apps: Vec::new() }
    }

    /// Registers an app. Registration order is start order.
    pub fn register(&mut self, app: Arc<dyn Application>) {
        self.apps.push(AppEntry {
            app,
            state: AppState::Stopped,
        });
    }

    /// Starts every registered app. A failure or panic marks that app
    /// failed and moves on.
    pub async fn start_all(&mut self, manager: &ManagerHandle) {
        for entry in &mut self.apps {
            let fut = entry.app.start(manager.clone());
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {
                    info!(app = entry.app.name(), "application started");
                    entry.state = AppState::Running;
                }
                Ok(Err(e)) => {
                    warn!(
                        app = entry.app.name(),
                        error = %e,
                        "application failed to start"
                    );
                    entry.state = AppState::Failed;
                }
                Err(panic) => {
                    warn!(
                        app = entry.app.name(),
                        "application panicked on start: {panic:?}"
                    );
                    entry.state = AppState::Failed;
                }
            }
        }
    }

    /// Stops running apps in reverse start order. Call before tearing
    /// the manager down.
    pub async fn stop_all(&mut self) {
        for entry in self.apps.iter_mut().rev() {
            if entry.state == AppState::Running {
                let fut = entry.app.stop();
                if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    warn!(app = entry.app.name(), "application panicked on stop");
                    entry.state = AppState::Failed;
                } else {
                    entry.state = AppState::Stopped;
                    info!(app = entry.app.name(), "application stopped");
                }
            }
        }
    }

    /// Restarts running apps in start order.
    pub async fn restart_all(&mut self) {
        for entry in &mut self.apps {
            if entry.state == AppState::Running {
                let fut = entry.app.restart();
                if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    warn!(app = entry.app.name(), "application panicked on restart");
                    entry.state = AppState::Failed;
                }
            }
        }
    }

    /// Current app states, in registration order.
    pub fn states(&self) -> Vec<(&'static str, AppState)> {
        self.apps.iter().map(|e| (e.app.name(), e.state)).collect()
    }
}

/// Waits for a termination signal.
///
/// Embedding binaries typically drive `host.stop_all()` and
/// `manager.shutdown()` when this completes.
///
/// **Unix:** `SIGINT`, `SIGTERM`, `SIGQUIT`. **Elsewhere:** Ctrl-C.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
