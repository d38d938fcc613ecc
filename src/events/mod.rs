//! Lifecycle events: topics, payloads, and the pub/sub hub.
//!
//! ## Contents
//! - [`Topic`], [`Pattern`] dot-path topics and wildcard subscriptions
//! - [`Event`], [`EventKind`], [`Reaped`] payload model and wire names
//! - [`EventEmitter`], [`Subscription`] bounded fan-out with overflow
//!   policies and heartbeats
//!
//! ## Quick reference
//! - **Publishers**: the manager loop (template lifecycle), instance
//!   actors (spawn/exit), stream muxes (chunks), stats samplers.
//! - **Consumers**: external adapters via [`Subscription`] handles
//!   obtained through the manager.

mod emitter;
mod event;
mod pattern;

pub use emitter::{
    Delivery, EventEmitter, OverflowPolicy, SubscribeOptions, Subscription,
};
pub use event::{
    job_stats_topic, job_topic, stats_topic, stream_topic, Event, EventKind, Reaped,
};
pub use pattern::{Pattern, Topic};
