use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    spawn,
    sync::{Mutex, Notify},
    time::{Duration, sleep},
};

/// Initial per-key retry delay.
pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound for the per-key retry delay.
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Failure bookkeeping of one key.
struct Failures {
    requeues: u32,
    backoff: ExponentialBackoff,
}

/// Per-key exponential backoff: the n-th consecutive failure of a key waits
/// `base_delay * 2^n`, capped at `max_delay`.
pub(crate) struct RateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<String, Failures>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Default::default(),
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Record one more failure of `key` and return how long to wait before
    /// handing it out again.
    pub async fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().await;
        let entry = failures
            .entry(key.to_string())
            .or_insert_with(|| Failures {
                requeues: 0,
                backoff: self.new_backoff(),
            });
        entry.requeues = entry.requeues.saturating_add(1);
        entry
            .backoff
            .next_backoff()
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .await
            .get(key)
            .map_or(0, |f| f.requeues)
    }

    pub async fn forget(&self, key: &str) {
        self.failures.lock().await.remove(key);
    }
}

#[derive(Default)]
struct QueueState {
    /// Keys ready to be handed out, in FIFO order.
    queue: VecDeque<String>,
    /// Keys which need processing, queued or parked behind an in-flight run.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
}

/// Deduplicating, rate limited FIFO of reconciliation keys (`namespace/name`).
///
/// A key is handed to at most one worker at a time. Adding a key which is
/// already pending is a no-op, adding a key which is being processed parks it
/// until the worker calls [`WorkQueue::done`].
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    shutting_down: AtomicBool,
    notify: Notify,
    rate_limiter: RateLimiter,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RateLimiter::default())
    }
}

impl WorkQueue {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            state: Default::default(),
            shutting_down: AtomicBool::new(false),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    pub async fn add(&self, key: String) {
        let mut state = self.state.lock().await;
        if self.is_shutting_down() {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: String, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        spawn(async move {
            sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Re-add `key` after its backoff delay, counting one more failure.
    pub async fn add_rate_limited(self: &Arc<Self>, key: String) {
        let delay = self.rate_limiter.when(key.as_str()).await;
        debug!("requeue {} in {:?}", key, delay);
        self.add_after(key, delay);
    }

    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.rate_limiter.num_requeues(key).await
    }

    /// Stop tracking failures of `key`.
    pub async fn forget(&self, key: &str) {
        self.rate_limiter.forget(key).await
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if self.is_shutting_down() {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight marker of `key`, requeueing it if it was added
    /// while being processed.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !self.is_shutting_down() {
            state.queue.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop handing out keys. Workers blocked in [`WorkQueue::get`] return
    /// `None`, keys added afterwards are ignored.
    pub async fn shut_down(&self) {
        let _state = self.state.lock().await;
        self.shutting_down.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
