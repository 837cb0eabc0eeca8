use std::collections::VecDeque;

use fanout_utils::log_assert;
use parking_lot::{Condvar, Mutex};

/// One unit of test work, plus the number of attempts made at it so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub test: T,
    pub tries: u32,
}

impl<T> WorkItem<T> {
    pub fn new(test: T) -> Self {
        Self { test, tries: 0 }
    }

    pub fn with_tries(test: T, tries: u32) -> Self {
        Self { test, tries }
    }
}

#[derive(Debug)]
struct Inner<T> {
    pending: VecDeque<WorkItem<T>>,
    /// Items handed out by [WorkQueue::remove_next] that have not been marked completed yet.
    in_flight: usize,
    /// Set by [WorkQueue::close]; no more items are handed out.
    closed: bool,
}

/// Thread-safe bag of pending work.
///
/// Besides the pending items, the queue tracks how many items are currently being worked on, so
/// that [WorkQueue::len] reaches zero only once there is nothing pending and nothing in flight.
/// Every successful [WorkQueue::remove_next] must be paired with exactly one
/// [WorkQueue::test_completed], after the item has been re-added (for a retry) or finalized.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    /// Signalled whenever an item is added or an in-flight item is completed.
    changed: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(tests: impl IntoIterator<Item = T>) -> Self {
        Self::from_items(tests.into_iter().map(WorkItem::new))
    }

    pub fn from_items(items: impl IntoIterator<Item = WorkItem<T>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: items.into_iter().collect(),
                in_flight: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Enqueues an item, either fresh work or a retry of a previously removed item.
    pub fn add(&self, item: WorkItem<T>) {
        self.inner.lock().pending.push_back(item);
        self.changed.notify_all();
    }

    /// Pops the next item to work on, or `None` if nothing is pending right now.
    /// Never waits for work to appear.
    pub fn remove_next(&self) -> Option<WorkItem<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let item = inner.pending.pop_front()?;
        inner.in_flight += 1;
        Some(item)
    }

    /// Marks one previously removed item as done with.
    pub fn test_completed(&self) {
        let mut inner = self.inner.lock();
        log_assert!(
            inner.in_flight > 0,
            "test_completed called more times than items were removed"
        );
        inner.in_flight = inner.in_flight.saturating_sub(1);
        drop(inner);
        self.changed.notify_all();
    }

    /// Pops the next item, waiting while nothing is pending but other items are still in flight
    /// (and so may come back as retries). Returns `None` once the queue is drained or closed.
    pub fn wait_next(&self) -> Option<WorkItem<T>> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(item) = inner.pending.pop_front() {
                inner.in_flight += 1;
                return Some(item);
            }
            if inner.in_flight == 0 {
                return None;
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Outstanding work: pending items plus items in flight.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + inner.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Stops handing out items, and wakes every waiter. Pending items stay in the queue, and
    /// items may still be added and completed.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Yields items until the queue is drained, see [WorkQueue::wait_next]. Safe to drive from
    /// many threads at once; each item is handed to exactly one caller, who must mark it
    /// completed.
    pub fn iter(&self) -> impl Iterator<Item = WorkItem<T>> + '_ {
        std::iter::from_fn(move || self.wait_next())
    }
}

impl<T: Clone> WorkQueue<T> {
    /// Snapshot of the tests that are still pending.
    pub fn pending_tests(&self) -> Vec<T> {
        let inner = self.inner.lock();
        inner.pending.iter().map(|item| item.test.clone()).collect()
    }

    /// A fresh, independent queue holding the same pending items and no in-flight work.
    pub fn replicate(&self) -> Self {
        let inner = self.inner.lock();
        Self::from_items(inner.pending.iter().cloned())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use fanout_run_n_times::n_times;
    use ntest::timeout;
    use rand::seq::SliceRandom;

    use super::{WorkItem, WorkQueue};

    #[test]
    fn len_counts_in_flight_work() {
        let queue = WorkQueue::new(["a", "b"]);
        assert_eq!(queue.len(), 2);

        let a = queue.remove_next().unwrap();
        assert_eq!(a.test, "a");
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.len(), 2);

        queue.test_completed();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn retried_item_keeps_queue_non_empty() {
        let queue = WorkQueue::new(["a"]);
        let a = queue.remove_next().unwrap();
        assert!(queue.remove_next().is_none());
        assert!(!queue.is_empty());

        queue.add(WorkItem::with_tries(a.test, 1));
        queue.test_completed();
        assert_eq!(queue.len(), 1);

        let retry = queue.remove_next().unwrap();
        assert_eq!(retry.tries, 1);
        queue.test_completed();
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_next_on_empty_queue() {
        let queue: WorkQueue<String> = WorkQueue::new([]);
        assert!(queue.remove_next().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn iter_drains_pending() {
        let queue = WorkQueue::new(1..=3);
        let tests: Vec<_> = queue
            .iter()
            .map(|item| {
                queue.test_completed();
                item.test
            })
            .collect();
        assert_eq!(tests, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    #[timeout(5000)]
    fn wait_next_picks_up_items_put_back_by_others() {
        let queue = Arc::new(WorkQueue::new(["a"]));
        let held = queue.remove_next().unwrap();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_next().map(|item| item.test))
        };

        thread::sleep(Duration::from_millis(50));
        queue.add(held);
        queue.test_completed();

        assert_eq!(waiter.join().unwrap(), Some("a"));
    }

    #[test]
    #[timeout(5000)]
    fn wait_next_returns_none_once_drained() {
        let queue = Arc::new(WorkQueue::new(["a"]));
        let _held = queue.remove_next().unwrap();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_next())
        };

        thread::sleep(Duration::from_millis(50));
        queue.test_completed();

        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    #[timeout(5000)]
    fn close_wakes_waiters_and_keeps_pending_items() {
        let queue = Arc::new(WorkQueue::new(["a", "b"]));
        let _held = queue.remove_next().unwrap();
        let _held = queue.remove_next().unwrap();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_next())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(waiter.join().unwrap().is_none());

        queue.add(WorkItem::with_tries("a", 1));
        queue.test_completed();
        assert!(queue.is_closed());
        assert!(queue.remove_next().is_none());
        assert_eq!(queue.pending_tests(), vec!["a"]);
        assert_eq!(queue.in_flight(), 1);
    }

    #[test]
    fn replicate_is_independent() {
        let queue = WorkQueue::new(["a", "b"]);
        let copy = queue.replicate();

        let _ = queue.remove_next().unwrap();
        queue.test_completed();

        assert_eq!(queue.pending_tests(), vec!["b"]);
        assert_eq!(copy.pending_tests(), vec!["a", "b"]);
        assert_eq!(copy.in_flight(), 0);
    }

    #[test]
    #[n_times(50)]
    fn fuzz_concurrent_drain() {
        let num_tests = 1_000;
        let num_threads = 8;
        let max_tries = 2;

        let mut tests: Vec<usize> = (0..num_tests).collect();
        tests.shuffle(&mut rand::thread_rng());

        let queue = Arc::new(WorkQueue::new(tests));
        let finalized = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let queue = queue.clone();
                let finalized = finalized.clone();
                thread::spawn(move || {
                    while !queue.is_empty() {
                        let item = match queue.remove_next() {
                            Some(item) => item,
                            None => {
                                thread::yield_now();
                                continue;
                            }
                        };
                        // Odd tests get retried until they run out of tries.
                        if item.test % 2 == 1 && item.tries < max_tries {
                            queue.add(WorkItem::with_tries(item.test, item.tries + 1));
                        } else {
                            finalized.fetch_add(1, Ordering::SeqCst);
                        }
                        queue.test_completed();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(queue.is_empty());
        assert_eq!(finalized.load(Ordering::SeqCst), num_tests);
    }
}
