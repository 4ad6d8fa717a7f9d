//! A plain FIFO guarded by a mutex and condvar, for deferred items whose
//! producers and consumers need no ordering beyond FIFO (the SLIP writer's
//! send queue, drain-request bookkeeping).

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

pub struct MpscBlockingQueue<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> Default for MpscBlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MpscBlockingQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), not_empty: Condvar::new() }
    }

    pub fn push(&self, item: T) {
        let mut q = self.queue.lock().unwrap();
        let was_empty = q.is_empty();
        q.push_back(item);
        if was_empty {
            self.not_empty.notify_all();
        }
    }

    /// Blocks until an element is available, then removes and returns it.
    ///
    /// This collapses the original `front()` + `pop()` pair into one call:
    /// nothing outside this module ever needs to peek without consuming.
    pub fn pop_wait(&self) -> T
    where
        T: Clone,
    {
        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(item) = q.pop_front() {
                return item;
            }
            q = self.not_empty.wait(q).unwrap();
        }
    }

    /// As [`Self::pop_wait`], but gives up after `timeout` and returns `None`.
    pub fn pop_wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            let (guard, result) = self.not_empty.wait_timeout(q, timeout).unwrap();
            q = guard;
            if result.timed_out() {
                return q.pop_front();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn pop_wait_blocks_until_pushed() {
        let q = Arc::new(MpscBlockingQueue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop_wait());
        thread::sleep(Duration::from_millis(20));
        q.push(42u32);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn pop_wait_timeout_expires() {
        let q: MpscBlockingQueue<u32> = MpscBlockingQueue::new();
        let result = q.pop_wait_timeout(Duration::from_millis(20));
        assert_eq!(result, None);
    }

    #[test]
    fn fifo_order_preserved() {
        let q = MpscBlockingQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop_wait(), 1);
        assert_eq!(q.pop_wait(), 2);
        assert_eq!(q.pop_wait(), 3);
    }
}
