//! A rate-limited work queue.
//!
//! The queue follows the semantics controllers commonly rely on:
//!
//! - An item that is already queued is not queued twice.
//! - An item is delivered to at most one worker at a time. If it is added
//!   again while a worker holds it, it is redelivered once the worker is done.
//! - Items that share a [`Item::Key`] are never in flight at the same time, so
//!   different kinds of work for the same object are serialized in the order
//!   they were queued.
//! - Rate-limited adds are delayed by a per-item exponential backoff, bounded by
//!   a queue-wide token bucket.
//!
//! Shutting the queue down is terminal: pending and future calls to
//! [`WorkQueue::get`] return `None`, while deliveries already handed out may
//! complete.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod rate_limit;
pub mod worker;


pub use self::{metrics::QueueMetrics, rate_limit::RateLimit};
use self::rate_limit::RateLimiter;
use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    hash::Hash,
    ops::Deref,
    sync::{Arc, Weak},
};
use tokio::{
    sync::Notify,
    time::{self, Duration},
};

/// An element of a [`WorkQueue`].
pub trait Item: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Identifies the object an item operates on. At most one item per key is
    /// in flight.
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

pub struct WorkQueue<T: Item> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: RateLimiter<T>,
    metrics: QueueMetrics,
}

/// An item handed to a worker.
///
/// The item is marked done when the delivery is dropped, releasing it (and its
/// key) for redelivery.
pub struct Delivery<T: Item> {
    queue: Arc<WorkQueue<T>>,
    item: T,
}

struct State<T: Item> {
    queue: VecDeque<T>,

    /// Items that need processing, whether queued or waiting for an in-flight
    /// delivery of the same item to complete.
    dirty: HashSet<T>,

    /// Items currently held by workers.
    processing: HashSet<T>,

    /// Keys of the items currently held by workers.
    active: HashSet<T::Key>,

    shutting_down: bool,
}

// === impl WorkQueue ===

impl<T: Item> WorkQueue<T> {
    pub fn new(limit: RateLimit, metrics: QueueMetrics) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                active: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: RateLimiter::new(limit),
            metrics,
        })
    }

    /// Queues an item for processing.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        self.metrics.adds.inc();

        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        self.metrics.depth.set(state.queue.len() as i64);
        drop(state);

        self.notify.notify_waiters();
    }

    /// Queues an item once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            return self.add(item);
        }

        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(queue) = Weak::upgrade(&queue) {
                queue.add(item);
            }
        });
    }

    /// Queues an item after the delay dictated by the rate limiter.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        tracing::trace!(%item, ?delay, "Rate limited");
        if self.limiter.num_requeues(&item) > 1 {
            self.metrics.retries.inc();
        }
        self.add_after(item, delay);
    }

    /// Clears an item's rate-limiting history.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    /// Returns the number of rate-limited adds since the item was last
    /// forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Waits for the next item that is eligible for processing.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(self: &Arc<Self>) -> Option<Delivery<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.pop_eligible() {
                    self.metrics.depth.set(state.queue.len() as i64);
                    return Some(Delivery {
                        queue: self.clone(),
                        item,
                    });
                }
            }

            notified.await;
        }
    }

    /// The number of items waiting to be delivered.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops delivering items. Rate-limited and delayed adds that have not yet
    /// fired are discarded.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        state.active.remove(&item.key());
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.metrics.depth.set(state.queue.len() as i64);
        }
        drop(state);

        // Completing an item may unblock other items with the same key.
        self.notify.notify_waiters();
    }
}

// === impl State ===

impl<T: Item> State<T> {
    fn pop_eligible(&mut self) -> Option<T> {
        let idx = self
            .queue
            .iter()
            .position(|item| !self.active.contains(&item.key()))?;
        let item = self.queue.remove(idx)?;
        self.dirty.remove(&item);
        self.active.insert(item.key());
        self.processing.insert(item.clone());
        Some(item)
    }
}

// === impl Delivery ===

impl<T: Item> Delivery<T> {
    pub fn item(&self) -> &T {
        &self.item
    }
}

impl<T: Item> Deref for Delivery<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Item> fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Delivery").field(&self.item).finish()
    }
}

impl<T: Item> Drop for Delivery<T> {
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}
