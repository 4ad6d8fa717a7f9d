//! The writer thread: dequeues outbound frames and partial-writes them to
//! the device fd, tracking a per-write id the watchdog polls and draining
//! one-shot "queue empty" notifications. Grounded on
//! `SlipInterface::writerThreadLoop`.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering},
    Arc, Mutex,
};

use bridge_host::Host;
use bridge_queue::Chunk;
use bridge_utils::NativeError;
use tracing::{debug, warn};

use crate::{pcap::PcapWriter, queue::BlockingSpscQueue, signal::ThreadHandle};

/// Sentinel meaning "not currently mid-write"; the watchdog only tracks
/// stuck writes while this is non-negative.
const IDLE: i64 = -1;
const WRAP_AT: i64 = i32::MAX as i64;

/// State shared between the writer thread and whoever drives `detach` /
/// requests a drain notification. Cheap to poll from the stack thread.
pub(crate) struct WriterShared {
    queue: BlockingSpscQueue,
    fd: AtomicI32,
    stop_write: AtomicBool,
    /// `IDLE` when the writer isn't blocked inside a single `write(2)` call;
    /// otherwise the id published for the write currently in flight.
    current_write_id: AtomicI64,
    next_drain_id: AtomicI64,
    pending_drains: Mutex<Vec<u64>>,
    stop_on_write_error: bool,
}

impl WriterShared {
    pub(crate) fn new(fd: i32, stop_on_write_error: bool) -> Arc<Self> {
        Arc::new(Self {
            queue: BlockingSpscQueue::new(),
            fd: AtomicI32::new(fd),
            stop_write: AtomicBool::new(false),
            current_write_id: AtomicI64::new(IDLE),
            next_drain_id: AtomicI64::new(0),
            pending_drains: Mutex::new(Vec::new()),
            stop_on_write_error,
        })
    }

    pub(crate) fn enqueue(&self, chunk: Chunk) {
        self.queue.push(chunk);
    }

    pub(crate) fn request_stop(&self) {
        self.stop_write.store(true, Ordering::SeqCst);
        self.queue.push(Chunk::wake_up());
    }

    /// Returns a monotonically increasing id; the writer delivers
    /// `onBufferEmpty(id)` once it next observes the outbound queue empty.
    pub(crate) fn request_drain_notification(&self) -> u64 {
        let id = self.next_drain_id.fetch_add(1, Ordering::SeqCst) as u64;
        self.pending_drains.lock().unwrap().push(id);
        id
    }

    /// Read by the watchdog; `None` means no write currently in flight.
    pub(crate) fn current_write_sample(&self) -> Option<i64> {
        match self.current_write_id.load(Ordering::SeqCst) {
            IDLE => None,
            id => Some(id),
        }
    }

    /// Non-blocking drain of whatever is left in the outbound queue; used by
    /// `detach` after the writer thread has already stopped consuming it.
    pub(crate) fn drain_remaining(&self) {
        while self.queue.try_pop().is_some() {}
    }

    #[cfg(test)]
    pub(crate) fn set_write_sample_for_test(&self, sample: Option<i64>) {
        self.current_write_id.store(sample.unwrap_or(IDLE), Ordering::SeqCst);
    }
}

pub(crate) fn run(
    shared: Arc<WriterShared>,
    host: Host,
    pcap: Option<Arc<Mutex<PcapWriter>>>,
    handle: Arc<ThreadHandle>,
) {
    handle.publish_self();
    host.attach_current_thread();

    let mut next_write_id: i64 = 0;

    loop {
        let chunk = shared.queue.pop_wait();

        if shared.stop_write.load(Ordering::SeqCst) && chunk.is_empty() {
            debug!("writer: stop_write observed on wake-up chunk");
            break;
        }
        if chunk.is_empty() {
            continue;
        }

        if let Some(pcap) = &pcap {
            if let Err(e) = pcap.lock().unwrap().write_packet(chunk.as_slice(), pcap_timestamp()) {
                warn!(error = %e, "pcap write failed");
            }
        }

        let write_id = next_write_id;
        next_write_id = if next_write_id >= WRAP_AT { 0 } else { next_write_id + 1 };

        let ok = write_all(&shared, write_id, chunk.as_slice());
        shared.current_write_id.store(IDLE, Ordering::SeqCst);

        if !ok {
            if shared.stop_on_write_error {
                host.on_native_error(NativeError::UsbWrite);
                shared.fd.store(-1, Ordering::SeqCst);
                break;
            }
            debug!("writer: discarding chunk after write error (stop_on_write_error=false)");
        }

        drain_pending_if_empty(&shared, &host);
    }

    drain_pending_unconditionally(&shared, &host);
    handle.mark_stopped();
    handle.wait_for_termination_signal();
}

/// Writes `data` in full, retrying on `EINTR` and short writes, publishing
/// `write_id` before each underlying `write(2)` so the watchdog sees
/// progress (or its absence) at write granularity.
fn write_all(shared: &WriterShared, write_id: i64, data: &[u8]) -> bool {
    let mut offset = 0;
    while offset < data.len() {
        let fd = shared.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return false;
        }
        shared.current_write_id.store(write_id, Ordering::SeqCst);

        // SAFETY: `data[offset..]` is a valid slice for its length and `fd`
        // is owned by the link for the writer thread's lifetime.
        let n = unsafe {
            libc::write(fd, data[offset..].as_ptr().cast(), data.len() - offset)
        };

        if n > 0 {
            offset += n as usize;
            continue;
        }

        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        warn!(error = %err, "writer: device write failed");
        return false;
    }
    true
}

fn drain_pending_if_empty(shared: &WriterShared, host: &Host) {
    if !shared.queue.is_empty() {
        return;
    }
    drain_pending_unconditionally(shared, host);
}

fn drain_pending_unconditionally(shared: &WriterShared, host: &Host) {
    let ids: Vec<u64> = std::mem::take(&mut *shared.pending_drains.lock().unwrap());
    for id in ids {
        host.on_buffer_empty(id);
    }
}

fn pcap_timestamp() -> std::time::SystemTime {
    std::time::SystemTime::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_request_ids_are_monotonic() {
        let shared = WriterShared::new(-1, true);
        let a = shared.request_drain_notification();
        let b = shared.request_drain_notification();
        assert!(b > a);
    }
}
