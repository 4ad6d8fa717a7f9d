//! The boundary a [`SlipLink`](bridge_link::SlipLink) (or a `Socket`'s
//! accept-time TLS failure path) reports through, independent of whatever
//! runtime embeds this crate.
//!
//! Grounded on `tcpip_jni.cpp`'s `AttachCurrentThread`/`GetEnv` dance: a
//! writer or reader thread must attach itself to the host once before its
//! first callback, and look up a fresh environment handle per call
//! thereafter. A plain Rust host has no such step, so [`NativeHost`] makes it
//! a no-op; an embedding that does need one (e.g. a JNI bridge) implements
//! [`HostRuntime`] itself.

use std::sync::Arc;

use bridge_utils::NativeError;
use tracing::{info, warn};

/// Lets a background thread cheaply attach/detach itself to the host runtime
/// before invoking callbacks.
pub trait HostRuntime: Send + Sync {
    fn attach_current_thread(&self);
    fn detach_current_thread(&self);
    /// `false` means callbacks from the current thread must be dropped, not
    /// queued: mirrors `GetEnv` returning null for an unattached thread.
    fn is_attached(&self) -> bool;
}

/// The three typed callbacks a `SlipLink` delivers to its host.
pub trait HostCallbacks: Send + Sync {
    /// A complete inbound SLIP frame is ready for decoding one layer up.
    fn on_slip_packet_ready(&self, buffer: &[u8]);
    /// An out-of-band native failure (stuck write, write error with
    /// `stop_on_write_error` set).
    fn on_native_error(&self, error: NativeError);
    /// The outbound queue drained past a previously-requested watermark.
    fn on_buffer_empty(&self, id: u64);
}

/// A host pairing: the runtime attach/detach hooks plus the typed callback
/// sink, reference-counted the way the host is expected to hold exactly one
/// global reference per callback for the lifetime of the owning object.
#[derive(Clone)]
pub struct Host {
    runtime: Arc<dyn HostRuntime>,
    callbacks: Arc<dyn HostCallbacks>,
}

impl Host {
    #[must_use]
    pub fn new(runtime: Arc<dyn HostRuntime>, callbacks: Arc<dyn HostCallbacks>) -> Self {
        Self { runtime, callbacks }
    }

    pub fn attach_current_thread(&self) {
        self.runtime.attach_current_thread();
    }

    pub fn detach_current_thread(&self) {
        self.runtime.detach_current_thread();
    }

    /// Delivers a callback only if the current thread is attached, matching
    /// the original's `GetEnv` null check before every JNI call.
    pub fn on_slip_packet_ready(&self, buffer: &[u8]) {
        if self.runtime.is_attached() {
            self.callbacks.on_slip_packet_ready(buffer);
        }
    }

    pub fn on_native_error(&self, error: NativeError) {
        if self.runtime.is_attached() {
            self.callbacks.on_native_error(error);
        }
    }

    pub fn on_buffer_empty(&self, id: u64) {
        if self.runtime.is_attached() {
            self.callbacks.on_buffer_empty(id);
        }
    }
}

/// A [`HostRuntime`] for hosts with no thread-attachment step of their own
/// (anything that isn't bridging into a VM with its own thread model).
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHost;

impl HostRuntime for NativeHost {
    fn attach_current_thread(&self) {}
    fn detach_current_thread(&self) {}
    fn is_attached(&self) -> bool {
        true
    }
}

/// A [`HostCallbacks`] that only logs, useful as a default and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

impl HostCallbacks for LoggingCallbacks {
    fn on_slip_packet_ready(&self, buffer: &[u8]) {
        info!(len = buffer.len(), "slip packet ready");
    }

    fn on_native_error(&self, error: NativeError) {
        warn!(%error, "native error reported to host");
    }

    fn on_buffer_empty(&self, id: u64) {
        info!(id, "write queue drained");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[derive(Default)]
    struct CountingCallbacks {
        packets: AtomicUsize,
        errors: AtomicUsize,
        drains: AtomicUsize,
    }

    impl HostCallbacks for CountingCallbacks {
        fn on_slip_packet_ready(&self, _buffer: &[u8]) {
            self.packets.fetch_add(1, Ordering::Relaxed);
        }
        fn on_native_error(&self, _error: NativeError) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        fn on_buffer_empty(&self, _id: u64) {
            self.drains.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct AttachGate {
        attached: std::sync::atomic::AtomicBool,
    }

    impl HostRuntime for AttachGate {
        fn attach_current_thread(&self) {
            self.attached.store(true, Ordering::SeqCst);
        }
        fn detach_current_thread(&self) {
            self.attached.store(false, Ordering::SeqCst);
        }
        fn is_attached(&self) -> bool {
            self.attached.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn callbacks_dropped_until_attached() {
        let counting = Arc::new(CountingCallbacks::default());
        let gate = Arc::new(AttachGate::default());
        let host = Host::new(gate.clone(), counting.clone());

        host.on_slip_packet_ready(b"ignored");
        assert_eq!(counting.packets.load(Ordering::SeqCst), 0);

        host.attach_current_thread();
        host.on_slip_packet_ready(b"delivered");
        host.on_native_error(NativeError::UsbStuck);
        host.on_buffer_empty(7);

        assert_eq!(counting.packets.load(Ordering::SeqCst), 1);
        assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
        assert_eq!(counting.drains.load(Ordering::SeqCst), 1);
    }
}
