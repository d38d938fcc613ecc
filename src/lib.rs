//! # procvisor
//!
//! **Procvisor** is the process supervision core of a job management
//! node: it launches, monitors, restarts, scales and shuts down OS
//! processes, exposes their standard I/O as multiplexed event streams,
//! enforces crash-rate policies, and publishes lifecycle and telemetry
//! events to subscribers.
//!
//! Transports (HTTP, websockets, CLIs) live outside this crate and
//! consume its public operations and event feeds through
//! [`ManagerHandle`].
//!
//! ## Features
//!
//! | Area            | Description                                             | Key types                                 |
//! |-----------------|---------------------------------------------------------|-------------------------------------------|
//! | **Templates**   | Declarative job specs with replica counts and policies. | [`ProcessSpec`], [`FlappingPolicy`]       |
//! | **Supervision** | Registry, priority scheduling, convergence, draining.   | [`Manager`], [`ManagerHandle`]            |
//! | **Instances**   | Child state machines with kill escalation and stats.    | [`InstanceHandle`], [`InstanceState`]     |
//! | **Streams**     | Stdio fan-out/fan-in with bounded backlog.              | [`StreamMux`]                             |
//! | **Events**      | Topic-tree pub/sub with wildcard patterns.              | [`EventEmitter`], [`Subscription`]        |
//! | **Hosting**     | Lifecycle hooks for external collaborators.             | [`Application`], [`ApplicationHost`]      |
//! | **Wire**        | Stable payload contracts for adapters.                  | [`wire`]                                  |
//!
//! ```no_run
//! use procvisor::{Manager, ManagerConfig, ProcessSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (handle, join) = Manager::spawn(ManagerConfig::default());
//!     handle.start_all().await?;
//!
//!     // Two replicas of a worker, grouped under the "app" session.
//!     let mut spec = ProcessSpec::new("worker", "/usr/bin/env");
//!     spec.numprocesses = 2;
//!     let qname = handle.load("app", spec).await?;
//!
//!     println!("running: {:?}", handle.pids(&qname).await?);
//!
//!     handle.shutdown().await?;
//!     join.await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod config;
mod error;
mod host;

pub mod events;
pub mod jobs;
pub mod proc;
pub mod wire;

mod manager;

// ---- Public re-exports ----

pub use config::ManagerConfig;
pub use error::Error;
pub use events::{
    Delivery, Event, EventEmitter, EventKind, OverflowPolicy, Pattern, Reaped,
    SubscribeOptions, Subscription, Topic,
};
pub use host::{wait_for_shutdown_signal, AppState, Application, ApplicationHost};
pub use jobs::{FlappingPolicy, ProcessSpec, ProcessTemplate};
pub use manager::{Manager, ManagerHandle};
pub use proc::{InstanceHandle, InstanceState, ProcStats, StreamMux};
