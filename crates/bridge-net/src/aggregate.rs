//! Accumulates stack-delivered receive buffers and serves partial reads with
//! a cursor, grounded on the original `NetbufWrapper`/`recvbuf_` handling in
//! `NetconnSocket::recv`.

use std::sync::Mutex;

/// A chain of byte segments as handed back by one `Netconn::recv` call.
///
/// Stands in for the stack's own `pbuf`/`netbuf` chain: the core only ever
/// needs to walk it segment by segment and concatenate chains, never
/// allocate or free individual pbufs.
#[derive(Debug, Default, Clone)]
pub struct NetbufChain {
    segments: Vec<Box<[u8]>>,
}

impl NetbufChain {
    #[must_use]
    pub fn single(data: impl Into<Box<[u8]>>) -> Self {
        let data = data.into();
        if data.is_empty() { Self::default() } else { Self { segments: vec![data] } }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Appends `other`'s segments after this chain's, mirroring the stack's
    /// own `netbuf_chain` primitive.
    pub fn append(&mut self, mut other: Self) {
        self.segments.append(&mut other.segments);
    }
}

#[derive(Default)]
struct AggregateState {
    chain: NetbufChain,
    segment_index: usize,
    byte_offset: usize,
}

impl AggregateState {
    fn remaining(&self) -> usize {
        if self.segment_index >= self.chain.segments.len() {
            return 0;
        }
        let mut total = self.chain.segments[self.segment_index].len() - self.byte_offset;
        for seg in &self.chain.segments[self.segment_index + 1..] {
            total += seg.len();
        }
        total
    }

    fn take(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() && self.segment_index < self.chain.segments.len() {
            let seg = &self.chain.segments[self.segment_index];
            let available = seg.len() - self.byte_offset;
            let want = (dst.len() - copied).min(available);
            dst[copied..copied + want]
                .copy_from_slice(&seg[self.byte_offset..self.byte_offset + want]);
            copied += want;
            self.byte_offset += want;
            if self.byte_offset == seg.len() {
                self.segment_index += 1;
                self.byte_offset = 0;
            }
        }
        if self.segment_index >= self.chain.segments.len() {
            // Chain fully drained; release it so the aggregate goes back to empty.
            self.chain = NetbufChain::default();
            self.segment_index = 0;
            self.byte_offset = 0;
        }
        copied
    }
}

/// Thread-safe wrapper serialising all access under one mutex, matching the
/// "all methods are serialised under the aggregator's mutex" invariant.
pub struct NetbufAggregator {
    state: Mutex<AggregateState>,
}

impl Default for NetbufAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetbufAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::new(AggregateState::default()) }
    }

    /// Adopts `chain` if currently empty, else appends it to the existing
    /// chain (the cursor still addresses the same logical byte).
    pub fn set(&self, chain: NetbufChain) {
        let mut state = self.state.lock().unwrap();
        if state.chain.is_empty() {
            state.chain = chain;
            state.segment_index = 0;
            state.byte_offset = 0;
        } else {
            state.chain.append(chain);
        }
    }

    /// Copies up to `dst.len()` bytes starting at the cursor. Never blocks.
    pub fn take(&self, dst: &mut [u8]) -> usize {
        self.state.lock().unwrap().take(dst)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().remaining()
    }
}
