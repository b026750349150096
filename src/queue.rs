//! Deduplicating, rate-limited work queue.
//!
//! The queue holds identities, never payloads. An identity is in at most one of
//! three places at a time:
//!
//! - waiting in `queue` (and marked `dirty`)
//! - being processed by a worker (`processing`)
//! - being processed *and* marked `dirty` because it changed again while the
//!   worker was busy; it goes back on `queue` when the worker calls [`WorkQueue::done`]
//!
//! This gives at-most-one-outstanding-per-identity: duplicate adds coalesce and
//! no identity is ever handed to two workers concurrently.
//!
//! Delayed adds ([`WorkQueue::add_after`], [`WorkQueue::add_rate_limited`]) are
//! parked in a background task backed by [`DelayQueue`]; when several delays are
//! requested for the same identity the earliest wins.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::poll_fn;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, trace};

use crate::retry::RateLimiter;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Work queue with coalescing, per-item backoff and cooperative shutdown.
///
/// Cloned via `Arc`; every worker shares the same instance.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    delayed: mpsc::UnboundedSender<(K, Duration)>,
}

impl<K> WorkQueue<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    /// Create a queue using `limiter` for [`add_rate_limited`](Self::add_rate_limited).
    ///
    /// Must be called from within a Tokio runtime: the delayed-add task is
    /// spawned here and exits once the queue is dropped.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
            delayed: tx,
        });
        tokio::spawn(run_delayed(Arc::downgrade(&queue), rx));
        queue
    }

    /// Enqueue `item` unless it is already waiting.
    ///
    /// If the item is currently being processed it is marked dirty and
    /// re-queued when the worker calls [`done`](Self::done). No-op after shutdown.
    pub fn add(&self, item: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.name, ?item, "item in flight, deferring");
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shutting down. The caller owns the
    /// returned item until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before checking state so a concurrent shut_down is not missed
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `item` finished.
    pub fn done(&self, item: &K) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear backoff history for `item`.
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    /// Re-add `item` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.limiter.when(&item);
        debug!(
            queue = %self.name,
            ?item,
            delay_ms = delay.as_millis() as u64,
            "requeueing with backoff"
        );
        self.add_after(item, delay);
    }

    /// Add `item` once `delay` has elapsed.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        // Receiver only goes away together with the queue
        let _ = self.delayed.send((item, delay));
    }

    /// Times `item` has been rate limited since it was last forgotten.
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items; every blocked and future [`get`](Self::get) returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            debug!(
                queue = %self.name,
                abandoned = state.queue.len(),
                in_flight = state.processing.len(),
                "queue shutting down"
            );
        }
        self.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

async fn run_delayed<K>(queue: Weak<WorkQueue<K>>, mut rx: mpsc::UnboundedReceiver<(K, Duration)>)
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    let mut pending: DelayQueue<K> = DelayQueue::new();
    let mut deadlines: HashMap<K, (Key, Instant)> = HashMap::new();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some((item, delay)) = msg else { break };
                let ready_at = Instant::now() + delay;
                match deadlines.get_mut(&item) {
                    Some((_, at)) if *at <= ready_at => {}
                    Some((key, at)) => {
                        pending.reset_at(key, ready_at);
                        *at = ready_at;
                    }
                    None => {
                        let key = pending.insert_at(item.clone(), ready_at);
                        deadlines.insert(item, (key, ready_at));
                    }
                }
            }
            Some(expired) = poll_fn(|cx| pending.poll_expired(cx)), if !pending.is_empty() => {
                let item = expired.into_inner();
                deadlines.remove(&item);
                match queue.upgrade() {
                    Some(queue) => queue.add(item),
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::ItemExponentialLimiter;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        WorkQueue::new(
            "test",
            ItemExponentialLimiter::new(Duration::from_millis(100), Duration::from_secs(10)),
        )
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add("flux/a");
        q.add("flux/a");
        q.add("flux/b");

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("flux/a"));
        assert_eq!(q.get().await, Some("flux/b"));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn item_is_never_handed_out_twice_concurrently() {
        let q = queue();
        q.add("flux/a");
        let item = q.get().await.expect("item");

        // changed again while a worker holds it
        q.add("flux/a");
        q.add("flux/a");
        assert!(q.is_empty());
        assert!(
            tokio::time::timeout(Duration::from_secs(1), q.get())
                .await
                .is_err(),
            "in-flight item must not be handed to a second worker"
        );

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("flux/a"));
    }

    #[tokio::test]
    async fn done_without_readd_leaves_queue_empty() {
        let q = queue();
        q.add("flux/a");
        let item = q.get().await.expect("item");
        q.done(&item);

        assert!(q.is_empty());
        q.add("flux/a");
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn blocked_get_wakes_on_add() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;

        q.add("flux/a");
        assert_eq!(waiter.await.expect("join"), Some("flux/a"));
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_workers() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.expect("join"), None);
        }
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn add_after_shutdown_is_ignored() {
        let q = queue();
        q.shut_down();
        q.add("flux/a");

        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_abandons_waiting_items() {
        let q = queue();
        q.add("flux/a");
        q.shut_down();

        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_item_reappears_after_backoff() {
        let q = queue();
        let start = Instant::now();

        q.add_rate_limited("flux/a");
        assert!(q.is_empty());

        assert_eq!(q.get().await, Some("flux/a"));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(q.num_requeues(&"flux/a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_forgotten() {
        let q = queue();

        q.add_rate_limited("flux/a");
        let item = q.get().await.expect("first retry");
        q.done(&item);

        let start = Instant::now();
        q.add_rate_limited("flux/a");
        q.get().await.expect("second retry");
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(q.num_requeues(&"flux/a"), 2);

        q.forget(&"flux/a");
        assert_eq!(q.num_requeues(&"flux/a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_delayed_add_wins() {
        let q = queue();
        let start = Instant::now();

        q.add_after("flux/a", Duration::from_secs(5));
        q.add_after("flux/a", Duration::from_millis(50));

        assert_eq!(q.get().await, Some("flux/a"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(5));

        q.done(&"flux/a");
        assert!(
            tokio::time::timeout(Duration::from_secs(10), q.get())
                .await
                .is_err(),
            "superseded delay must not fire"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_adds_immediately() {
        let q = queue();
        q.add_after("flux/a", Duration::ZERO);
        assert_eq!(q.len(), 1);
    }
}
