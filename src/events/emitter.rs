//! # EventEmitter: topic-tree pub/sub with bounded subscriptions.
//!
//! [`EventEmitter`] fans every published event out to the subscriptions
//! whose [`Pattern`] matches the event's [`Topic`], **without awaiting**
//! any consumer.
//!
//! ## What it guarantees
//! - `publish()` returns immediately; a slow subscriber never blocks it.
//! - Per-subscriber FIFO: events are received in publish order.
//! - Unsubscribe is synchronous: once `close()` (or drop) returns, no
//!   further event is enqueued for that subscription.
//!
//! ## What it does **not** guarantee
//! - No ordering across different subscribers.
//! - No delivery to subscribers that overflow: the per-subscription
//!   [`OverflowPolicy`] decides whether to drop the oldest event, drop
//!   the newest, or disconnect the subscription entirely.
//!
//! ## Diagram
//! ```text
//!    publish(topic, event)
//!        │                    (Arc-clone per matching subscription)
//!        ├─────────────► [queue S1] ─► Subscription::recv()
//!        ├─────────────► [queue S2] ─► Subscription::recv()
//!        └─────────────► [queue SN] ─► Subscription::recv()
//! ```
//!
//! Consumers that request a heartbeat interval receive a zero-payload
//! [`EventKind::Heartbeat`] event from `recv()` whenever no real event
//! arrives within the interval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

use crate::error::Error;
use crate::events::event::{Event, EventKind};
use crate::events::pattern::{Pattern, Topic};

/// What to do when a subscription's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room (default).
    #[default]
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
    /// Close the subscription.
    Disconnect,
}

/// Per-subscription settings.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue capacity; `None` uses the emitter default.
    pub capacity: Option<usize>,
    /// Overflow behavior.
    pub policy: OverflowPolicy,
    /// Optional keepalive cadence for idle subscriptions.
    pub heartbeat: Option<Duration>,
}

/// One delivered event together with the full topic it was published on.
///
/// Wildcard subscribers need the topic to tell apart the events they
/// matched (`stream.3.out` vs `stream.4.out`).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub event: Arc<Event>,
}

struct SubQueue {
    buf: VecDeque<Delivery>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Events discarded since the last successful receive.
    dropped: u64,
    closed: bool,
}

struct SubShared {
    id: u64,
    pattern: Pattern,
    heartbeat: Option<Duration>,
    queue: Mutex<SubQueue>,
    notify: Notify,
}

impl SubShared {
    /// Enqueues one delivery. Returns `false` if the subscription must
    /// be disconnected (overflow with [`OverflowPolicy::Disconnect`]).
    fn push(&self, delivery: Delivery) -> bool {
        let mut q = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if q.closed {
            return true;
        }
        if q.buf.len() >= q.capacity {
            match q.policy {
                OverflowPolicy::DropOldest => {
                    q.buf.pop_front();
                    q.dropped += 1;
                    q.buf.push_back(delivery);
                }
                OverflowPolicy::DropNewest => {
                    q.dropped += 1;
                }
                OverflowPolicy::Disconnect => {
                    q.closed = true;
                    q.buf.clear();
                    drop(q);
                    self.notify.notify_waiters();
                    return false;
                }
            }
            warn!(
                subscription = self.id,
                pattern = %self.pattern,
                "subscriber queue overflow, event dropped"
            );
        } else {
            q.buf.push_back(delivery);
        }
        drop(q);
        self.notify.notify_one();
        true
    }

    fn close(&self) {
        let mut q = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        q.closed = true;
        q.buf.clear();
        drop(q);
        self.notify.notify_waiters();
    }
}

struct Inner {
    subs: Mutex<Vec<Arc<SubShared>>>,
    next_id: AtomicU64,
    default_capacity: usize,
}

impl Inner {
    fn remove(&self, id: u64) {
        let mut subs = match self.subs.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| s.id != id);
    }
}

/// Topic-tree publish/subscribe hub.
///
/// Cloning is cheap; all clones share the same subscription registry.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<Inner>,
}

impl EventEmitter {
    /// Creates an emitter whose subscriptions default to the given queue
    /// capacity.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                default_capacity: default_capacity.max(1),
            }),
        }
    }

    /// Publishes an event on a topic.
    ///
    /// The event is Arc-shared across all matching subscriptions. This
    /// never blocks: full queues apply their overflow policy instead.
    pub fn publish(&self, topic: Topic, event: Event) {
        let event = Arc::new(event);
        let mut disconnected = Vec::new();
        {
            let subs = match self.inner.subs.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            for sub in subs.iter() {
                if !sub.pattern.matches(&topic) {
                    continue;
                }
                let delivery = Delivery {
                    topic: topic.clone(),
                    event: Arc::clone(&event),
                };
                if !sub.push(delivery) {
                    disconnected.push(sub.id);
                }
            }
        }
        for id in disconnected {
            warn!(subscription = id, "subscriber disconnected on overflow");
            self.inner.remove(id);
        }
    }

    /// Registers a subscription for the given pattern.
    pub fn subscribe(&self, pattern: Pattern, opts: SubscribeOptions) -> Subscription {
        let shared = Arc::new(SubShared {
            id: self.inner.next_id.fetch_add(1, AtomicOrdering::Relaxed),
            pattern,
            heartbeat: opts.heartbeat,
            queue: Mutex::new(SubQueue {
                buf: VecDeque::new(),
                capacity: opts.capacity.unwrap_or(self.inner.default_capacity).max(1),
                policy: opts.policy,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });
        {
            let mut subs = match self.inner.subs.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            subs.push(Arc::clone(&shared));
        }
        Subscription {
            shared,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Returns true if at least one live subscription matches the topic.
    ///
    /// Used to gate work that is pointless without consumers, e.g. the
    /// per-instance stats sampler.
    pub fn has_subscribers(&self, topic: &Topic) -> bool {
        let subs = match self.inner.subs.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.iter().any(|s| {
            s.pattern.matches(topic)
                && !s.queue.lock().map(|q| q.closed).unwrap_or(true)
        })
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        match self.inner.subs.lock() {
            Ok(s) => s.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Closes every subscription. Consumers observe
    /// [`Error::SubscriptionClosed`] on their next receive.
    pub fn close(&self) {
        let subs: Vec<Arc<SubShared>> = {
            let mut guard = match self.inner.subs.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain(..).collect()
        };
        for sub in subs {
            sub.close();
        }
    }
}

/// Consumer half of a subscription.
///
/// Dropping the subscription unsubscribes synchronously.
pub struct Subscription {
    shared: Arc<SubShared>,
    emitter: Weak<Inner>,
}

impl Subscription {
    /// The subscription's unique id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The pattern this subscription was registered with.
    pub fn pattern(&self) -> &Pattern {
        &self.shared.pattern
    }

    /// Receives the next delivery.
    ///
    /// - Returns `Err(BackpressureDropped)` once after overflow drops,
    ///   then resumes delivering queued events.
    /// - Returns `Err(SubscriptionClosed)` after `close()` or emitter
    ///   shutdown.
    /// - With a heartbeat interval configured, yields a synthesized
    ///   [`EventKind::Heartbeat`] delivery when idle for the interval.
    pub async fn recv(&self) -> Result<Delivery, Error> {
        loop {
            {
                let mut q = match self.shared.queue.lock() {
                    Ok(q) => q,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if q.dropped > 0 {
                    let dropped = q.dropped;
                    q.dropped = 0;
                    return Err(Error::BackpressureDropped { dropped });
                }
                if let Some(delivery) = q.buf.pop_front() {
                    return Ok(delivery);
                }
                if q.closed {
                    return Err(Error::SubscriptionClosed);
                }
            }

            match self.shared.heartbeat {
                Some(interval) => {
                    if timeout(interval, self.shared.notify.notified())
                        .await
                        .is_err()
                    {
                        return Ok(Delivery {
                            topic: Topic::new("heartbeat"),
                            event: Arc::new(Event::now(EventKind::Heartbeat)),
                        });
                    }
                }
                None => self.shared.notify.notified().await,
            }
        }
    }

    /// Non-blocking receive. Returns `None` when the queue is empty and
    /// the subscription is still live.
    pub fn try_recv(&self) -> Option<Result<Delivery, Error>> {
        let mut q = match self.shared.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if q.dropped > 0 {
            let dropped = q.dropped;
            q.dropped = 0;
            return Some(Err(Error::BackpressureDropped { dropped }));
        }
        if let Some(delivery) = q.buf.pop_front() {
            return Some(Ok(delivery));
        }
        if q.closed {
            return Some(Err(Error::SubscriptionClosed));
        }
        None
    }

    /// Unsubscribes. Synchronous: no event is enqueued after this
    /// returns.
    pub fn close(&self) {
        self.shared.close();
        if let Some(inner) = self.emitter.upgrade() {
            inner.remove(self.shared.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
