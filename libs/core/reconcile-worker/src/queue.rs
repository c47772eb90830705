//! De-duplicating work queue with delayed requeue.
//!
//! A key is in at most one of three places: ready (queued), delayed (waiting
//! for a deadline) or processing. Adding a key that is already ready is a
//! no-op; adding a key that is being processed marks it dirty so it is queued
//! again once the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct State<K> {
    ready: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    delayed: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn enqueue(&mut self, key: K) {
        if !self.dirty.insert(key.clone()) {
            return;
        }
        self.delayed.remove(&key);
        if !self.processing.contains(&key) {
            self.ready.push_back(key);
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<K> = self
            .delayed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            self.delayed.remove(&key);
            self.enqueue(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

/// Work queue shared between event sources and the controller's workers.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing reconciliation now.
    pub fn add(&self, key: K) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.enqueue(key);
        }
        self.notify.notify_one();
    }

    /// Mark `key` as needing reconciliation after `delay`.
    ///
    /// If the key is already waiting, the earlier deadline wins. A key that is
    /// already ready stays ready.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            let deadline = Instant::now() + delay;
            state
                .delayed
                .entry(key)
                .and_modify(|existing| {
                    if deadline < *existing {
                        *existing = deadline;
                    }
                })
                .or_insert(deadline);
        }
        self.notify.notify_one();
    }

    /// Wait for the next ready key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }

                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                state.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key handed out by [`WorkQueue::get`].
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };

        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys. Blocked [`WorkQueue::get`] calls return `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready to be handed out right now.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting for a requeue deadline.
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_deduplicates_ready_keys() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_requeued_on_done() {
        let queue = WorkQueue::new();
        queue.add("a");

        let key = queue.get().await.unwrap();
        queue.add("a");
        // Not handed out again while still being processed
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = WorkQueue::new();
        queue.add(1u32);
        let key = queue.get().await.unwrap();
        queue.done(&key);

        assert!(queue.is_empty());
        assert_eq!(queue.delayed_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_deadline() {
        let queue = WorkQueue::new();
        let start = Instant::now();
        queue.add_after("later", Duration::from_secs(10));

        assert!(queue.is_empty());
        assert_eq!(queue.delayed_len(), 1);

        assert_eq!(queue.get().await, Some("later"));
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_deadline() {
        let queue = WorkQueue::new();
        let start = Instant::now();
        queue.add_after("k", Duration::from_secs(60));
        queue.add_after("k", Duration::from_secs(5));
        queue.add_after("k", Duration::from_secs(30));

        assert_eq!(queue.delayed_len(), 1);
        assert_eq!(queue.get().await, Some("k"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_add_supersedes_delayed() {
        let queue = WorkQueue::new();
        queue.add_after("k", Duration::from_secs(60));
        queue.add("k");

        assert_eq!(queue.delayed_len(), 0);
        assert_eq!(queue.get().await, Some("k"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getters() {
        let queue: Arc<WorkQueue<&'static str>> = Arc::new(WorkQueue::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.shut_down();

        assert_eq!(waiter.await.unwrap(), None);
        queue.add("ignored");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_getter_receives_new_key() {
        let queue: Arc<WorkQueue<u64>> = Arc::new(WorkQueue::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add(42);

        assert_eq!(waiter.await.unwrap(), Some(42));
    }
}
