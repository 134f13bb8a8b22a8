//! Small shared primitives: one-shot latch, bounded recent-id set.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::core::MessageId;

/// One-shot gate: `wait` blocks until some thread calls `signal`.
///
/// Used to hold early callers until context initialization completes and to
/// park the joining thread until its own `NodeAddedFinished` arrives.
pub struct Latch {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut done = self.state.lock().expect("latch lock poisoned");
        *done = true;
        self.cv.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.lock().expect("latch lock poisoned")
    }

    pub fn wait(&self) {
        let mut done = self.state.lock().expect("latch lock poisoned");
        while !*done {
            done = self.cv.wait(done).expect("latch lock poisoned");
        }
    }

    /// Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.state.lock().expect("latch lock poisoned");
        while !*done {
            let (guard, result) = self
                .cv
                .wait_timeout(done, timeout)
                .expect("latch lock poisoned");
            done = guard;
            if result.timed_out() {
                return *done;
            }
        }
        true
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded set of recently observed message ids, oldest evicted first.
///
/// Replayed ensure-delivery messages hit this set and are forwarded without
/// being re-applied, which keeps event application idempotent.
pub struct RecentIds {
    cap: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentIds {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            order: VecDeque::with_capacity(cap),
            seen: HashSet::with_capacity(cap),
        }
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    /// Returns `true` when the id was not seen before.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        if self.order.len() == self.cap
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn latch_releases_waiters() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        latch.signal();
        waiter.join().unwrap();
        assert!(latch.is_signaled());
    }

    #[test]
    fn latch_wait_timeout_expires() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.signal();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn recent_ids_deduplicate() {
        let mut ids = RecentIds::new(8);
        let id = MessageId::random();
        assert!(ids.insert(id));
        assert!(!ids.insert(id));
        assert!(ids.contains(id));
    }

    #[test]
    fn recent_ids_evict_oldest() {
        let mut ids = RecentIds::new(2);
        let first = MessageId::random();
        ids.insert(first);
        ids.insert(MessageId::random());
        ids.insert(MessageId::random());
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(first));
    }
}
