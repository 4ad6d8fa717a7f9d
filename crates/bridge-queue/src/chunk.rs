//! Lock-free single-producer/single-consumer queue of owned byte buffers.
//!
//! A Michael-style linked list with a permanent sentinel at the head. Exactly
//! one thread may call [`SpscChunkQueue::push`] and exactly one (possibly a
//! different thread) may call `pop`/`first`/`empty`, for the lifetime of the
//! queue; this is a discipline the type does not enforce at runtime.

use std::sync::atomic::{AtomicPtr, Ordering};

/// An immutable, heap-owned byte buffer with a fixed length.
///
/// A zero-length chunk is a legal wake-up marker: it carries no payload and
/// exists only to make a blocked consumer re-check its exit condition.
#[derive(Debug, Clone)]
pub struct Chunk {
    bytes: Box<[u8]>,
}

impl Chunk {
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self { bytes: data.into() }
    }

    /// A zero-length wake-up marker.
    #[must_use]
    pub fn wake_up() -> Self {
        Self { bytes: Box::new([]) }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

struct Node {
    /// `None` until the producer publishes into this node and moves the
    /// sentinel forward; the consumer must never read a node the tail has
    /// not yet advanced past.
    chunk: Option<Chunk>,
    next: AtomicPtr<Node>,
}

impl Node {
    fn sentinel() -> *mut Node {
        Box::into_raw(Box::new(Node { chunk: None, next: AtomicPtr::new(std::ptr::null_mut()) }))
    }
}

/// Single-producer/single-consumer lock-free queue of [`Chunk`]s.
///
/// The payload of a `push` is published-before the tail pointer advances
/// (`Ordering::Release`) and observed-after the head pointer advances
/// (`Ordering::Acquire`) by the consumer, which is the only synchronization
/// this type needs: no other thread ever touches `head`/`tail` concurrently.
pub struct SpscChunkQueue {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
}

// Safety: exactly one producer thread touches `tail`/the current tail node,
// and exactly one consumer thread touches `head`; the two coordinate only
// through the atomics below, so the queue itself is Send+Sync for handing
// the two ends to their respective threads.
unsafe impl Send for SpscChunkQueue {}
unsafe impl Sync for SpscChunkQueue {}

impl Default for SpscChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SpscChunkQueue {
    #[must_use]
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self { head: AtomicPtr::new(sentinel), tail: AtomicPtr::new(sentinel) }
    }

    /// Producer-only. Publishes `chunk` into the current tail node, links a
    /// fresh sentinel after it, and advances `tail`.
    pub fn push(&self, chunk: Chunk) {
        let new_sentinel = Node::sentinel();
        // Safety: only the single producer thread ever dereferences `tail`,
        // and it always points at a live node (the consumer frees nodes only
        // after `head` has moved past them).
        let tail = self.tail.load(Ordering::Relaxed);
        unsafe {
            (*tail).chunk = Some(chunk);
            (*tail).next.store(new_sentinel, Ordering::Release);
        }
        self.tail.store(new_sentinel, Ordering::Release);
    }

    /// Consumer-only. Removes and returns the head chunk, or `None` if the
    /// queue is empty.
    pub fn pop(&self) -> Option<Chunk> {
        let head = self.head.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        let chunk = unsafe { (*head).chunk.take() };
        self.head.store(next, Ordering::Release);
        // Safety: `head` is only ever read by the consumer, and no reader can
        // still hold a reference to the old sentinel once we've advanced past
        // it (the producer never looks backwards from `tail`).
        unsafe { drop(Box::from_raw(head)) };
        chunk
    }

    /// Consumer-only. Non-destructive peek at the head chunk.
    #[must_use]
    pub fn first(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        !next.is_null()
    }

    /// Consumer-only.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.first()
    }
}

impl Drop for SpscChunkQueue {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // Safety: we own the queue exclusively at drop time.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn push_then_pop_yields_identical_buffer() {
        let q = SpscChunkQueue::new();
        assert!(q.is_empty());
        q.push(Chunk::new(b"hello"));
        assert!(!q.is_empty());
        let c = q.pop().unwrap();
        assert_eq!(c.as_slice(), b"hello");
        assert!(q.is_empty());
        assert!(q.pop().is_none());
    }

    #[test]
    fn wake_up_marker_is_zero_length_and_pops() {
        let q = SpscChunkQueue::new();
        q.push(Chunk::wake_up());
        let c = q.pop().unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn fifo_order_across_threads() {
        let q = Arc::new(SpscChunkQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..10_000u32 {
                    q.push(Chunk::new(&i.to_le_bytes()));
                }
            })
        };

        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            if let Some(c) = q.pop() {
                received.push(u32::from_le_bytes(c.as_slice().try_into().unwrap()));
            }
        }
        producer.join().unwrap();

        for (i, v) in received.into_iter().enumerate() {
            assert_eq!(v, i as u32);
        }
    }
}
