//! The writer-side queue: "an outbound SpscChunkQueue... a blocking queue
//! variant (in this design collapsed with the SPSC queue) for the writer
//! worker." Layers a condvar purely for wakeup on top of the lock-free
//! [`SpscChunkQueue`] so the SPSC push/pop discipline (and its lock-free
//! fast path) is preserved end to end, while the writer thread can still
//! block in `front()` instead of spinning.

use std::sync::{Condvar, Mutex};

use bridge_queue::{Chunk, SpscChunkQueue};

/// Single-producer (the netif output callback, on the stack's TCP/IP thread)
/// / single-consumer (the writer thread) queue of outbound frames.
pub(crate) struct BlockingSpscQueue {
    inner: SpscChunkQueue,
    // Guards nothing by itself; held only while waiting on/notifying `cv`.
    wake: Mutex<()>,
    cv: Condvar,
}

impl BlockingSpscQueue {
    pub(crate) fn new() -> Self {
        Self { inner: SpscChunkQueue::new(), wake: Mutex::new(()), cv: Condvar::new() }
    }

    /// Producer-only.
    pub(crate) fn push(&self, chunk: Chunk) {
        self.inner.push(chunk);
        // The lock is only ever held across `wait`, so this never blocks on
        // a writer that is mid-drain; it exists solely to avoid a missed
        // wakeup between the consumer's empty-check and its `wait` call.
        let _guard = self.wake.lock().unwrap();
        self.cv.notify_one();
    }

    /// Consumer-only. Blocks until a chunk is available, then pops it.
    /// `detach`'s zero-length wake-up chunk is returned like any other;
    /// callers distinguish it by `Chunk::is_empty`.
    pub(crate) fn pop_wait(&self) -> Chunk {
        loop {
            if let Some(chunk) = self.inner.pop() {
                return chunk;
            }
            let guard = self.wake.lock().unwrap();
            if !self.inner.is_empty() {
                continue;
            }
            drop(self.cv.wait(guard).unwrap());
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Non-blocking pop, for draining whatever never made it to the device
    /// once detach has already stopped the writer thread.
    pub(crate) fn try_pop(&self) -> Option<Chunk> {
        self.inner.pop()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn pop_wait_blocks_until_pushed() {
        let q = Arc::new(BlockingSpscQueue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop_wait());
        thread::sleep(Duration::from_millis(20));
        q.push(Chunk::new(b"hello"));
        assert_eq!(handle.join().unwrap().as_slice(), b"hello");
    }

    #[test]
    fn wake_up_marker_round_trips() {
        let q = BlockingSpscQueue::new();
        q.push(Chunk::wake_up());
        assert!(q.pop_wait().is_empty());
    }
}
