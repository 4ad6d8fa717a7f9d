//! `SlipLink`: attaches a SLIP netif to the stack over a blocking device fd,
//! owning the reader/writer threads, the stuck-write watchdog, and the
//! orderly signal-based detach sequence. Grounded on
//! `SlipInterface::{attachInterface, detachInterface}`.

use std::{
    net::Ipv4Addr,
    os::unix::io::RawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bridge_host::Host;
use bridge_net::{SlipNetif, SlipOutputSink, StackRuntime};
use bridge_queue::Chunk;
use bridge_utils::{SlipConfig, StackError};
use tracing::{debug, info, warn};

use crate::{
    pcap::PcapWriter,
    reader,
    signal::{self, ThreadHandle},
    watchdog::Watchdog,
    writer::{self, WriterShared},
};

/// Forwards the netif's SLIP-encoded output into the writer's queue; the
/// producer side of the outbound queue the design note describes.
struct OutputForwarder {
    writer: Arc<WriterShared>,
}

impl SlipOutputSink for OutputForwarder {
    fn on_frame(&self, frame: &[u8]) {
        self.writer.enqueue(Chunk::new(frame));
    }
}

struct ThreadSlot {
    handle: Arc<ThreadHandle>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// One SLIP attachment: a netif, a device fd, the reader/writer threads, and
/// the watchdog. `detach` is idempotent; dropping an attached link detaches
/// it.
pub struct SlipLink {
    netif: Arc<Mutex<Option<Arc<dyn SlipNetif>>>>,
    runtime: Arc<dyn StackRuntime>,
    writer_shared: Arc<WriterShared>,
    watchdog: Arc<Watchdog>,
    stop_read: Arc<AtomicBool>,
    reader: ThreadSlot,
    writer: ThreadSlot,
    signal_interval: Duration,
    writer_defer_stop: Duration,
}

impl SlipLink {
    /// Registers `netif` with the stack, brings it up with `local`/`netmask`,
    /// and (if `fd >= 0`) spawns the reader and writer threads plus the
    /// watchdog timer.
    pub fn attach(
        netif: Arc<dyn SlipNetif>,
        fd: RawFd,
        local: Ipv4Addr,
        netmask: Ipv4Addr,
        runtime: Arc<dyn StackRuntime>,
        host: Host,
        config: &SlipConfig,
        pcap_prefix: Option<PathBuf>,
    ) -> Result<Arc<Self>, StackError> {
        let writer_shared = WriterShared::new(fd, config.stop_on_write_error);
        let forwarder = Arc::new(OutputForwarder { writer: Arc::clone(&writer_shared) });
        netif.set_output_sink(forwarder as Arc<dyn SlipOutputSink>);

        {
            let netif = Arc::clone(&netif);
            runtime.schedule_blocking(Box::new(move || {
                if let Err(e) = netif.bring_up(local, netmask) {
                    warn!(error = ?e, "failed to bring up slip netif");
                }
            }));
        }

        let watchdog = Watchdog::new(
            Arc::clone(&writer_shared),
            host.clone(),
            Arc::clone(&runtime),
            config.watchdog.poll_interval,
            config.watchdog.stuck_threshold_secs,
        );

        let link = Arc::new(Self {
            netif: Arc::new(Mutex::new(Some(netif))),
            runtime,
            writer_shared: Arc::clone(&writer_shared),
            watchdog: Arc::clone(&watchdog),
            stop_read: Arc::new(AtomicBool::new(false)),
            reader: ThreadSlot { handle: ThreadHandle::new("slip-reader"), join: Mutex::new(None) },
            writer: ThreadSlot { handle: ThreadHandle::new("slip-writer"), join: Mutex::new(None) },
            signal_interval: config.signal.interval,
            writer_defer_stop: config.signal.writer_defer_stop,
        });

        if fd >= 0 {
            if !signal::ensure_sighup_handler() {
                warn!("proceeding without SIGHUP cancellation; detach may block on a stuck read/write");
            }

            let pcap = match pcap_prefix {
                Some(prefix) => {
                    let writer = PcapWriter::open(prefix).map_err(|e| {
                        warn!(error = %e, "failed to open pcap capture file");
                        StackError::Val
                    })?;
                    Some(Arc::new(Mutex::new(writer)))
                }
                None => None,
            };

            let reader_netif = Arc::clone(&link.netif);
            let reader_stop = Arc::clone(&link.stop_read);
            let reader_handle = Arc::clone(&link.reader.handle);
            let join = thread::spawn(move || reader::run(fd, reader_netif, reader_stop, reader_handle));
            *link.reader.join.lock().unwrap() = Some(join);

            let writer_handle = Arc::clone(&link.writer.handle);
            let writer_shared2 = Arc::clone(&writer_shared);
            let join = thread::spawn(move || writer::run(writer_shared2, host, pcap, writer_handle));
            *link.writer.join.lock().unwrap() = Some(join);

            watchdog.arm();
        }

        Ok(link)
    }

    /// Stops the reader/writer threads (signalling through the SIGHUP
    /// protocol if they don't stop within their defer windows), cancels the
    /// watchdog, brings the netif down, and drains whatever never reached
    /// the device. Safe to call more than once.
    pub fn detach(&self) {
        self.stop_read.store(true, Ordering::SeqCst);
        self.watchdog.cancel();
        self.writer_shared.request_stop();

        if let Some(join) = self.reader.join.lock().unwrap().take() {
            self.reader.handle.terminate(self.signal_interval, Duration::ZERO, join);
        }
        if let Some(join) = self.writer.join.lock().unwrap().take() {
            self.writer.handle.terminate(self.signal_interval, self.writer_defer_stop, join);
        }

        let netif = self.netif.lock().unwrap().take();
        if let Some(netif) = netif {
            let runtime = Arc::clone(&self.runtime);
            runtime.schedule_blocking(Box::new(move || netif.bring_down()));
        }

        self.writer_shared.drain_remaining();
        info!("slip link detached");
    }
}

impl Drop for SlipLink {
    fn drop(&mut self) {
        debug!("slip link dropped; ensuring detach ran");
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        sync::{
            atomic::{AtomicBool as StdAtomicBool, Ordering as StdOrdering},
            Mutex as StdMutex,
        },
        time::Duration as StdDuration,
    };

    use bridge_host::{Host, HostCallbacks, NativeHost};
    use bridge_net::{EventSink, Netconn, Protocol};
    use bridge_utils::{NativeError, StackError};

    use super::*;

    struct TestNetif {
        sink: StdMutex<Option<Arc<dyn SlipOutputSink>>>,
        received: StdMutex<Vec<u8>>,
        up: StdAtomicBool,
        down: StdAtomicBool,
    }

    impl TestNetif {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sink: StdMutex::new(None),
                received: StdMutex::new(Vec::new()),
                up: StdAtomicBool::new(false),
                down: StdAtomicBool::new(false),
            })
        }
    }

    impl SlipNetif for TestNetif {
        fn set_output_sink(&self, sink: Arc<dyn SlipOutputSink>) {
            *self.sink.lock().unwrap() = Some(sink);
        }
        fn input(&self, bytes: &[u8]) -> Result<(), StackError> {
            self.received.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
        fn bring_up(&self, _local: Ipv4Addr, _netmask: Ipv4Addr) -> Result<(), StackError> {
            self.up.store(true, StdOrdering::SeqCst);
            Ok(())
        }
        fn bring_down(&self) {
            self.down.store(true, StdOrdering::SeqCst);
        }
    }

    struct SyncRuntime;

    impl StackRuntime for SyncRuntime {
        fn tcpip_init(&self) {}
        fn new_netconn(
            &self,
            _protocol: Protocol,
            _sink: Arc<dyn EventSink>,
        ) -> Result<Box<dyn Netconn>, StackError> {
            unimplemented!("not exercised by this test")
        }
        fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
            f();
        }
        fn schedule_blocking(&self, f: Box<dyn FnOnce() + Send>) {
            f();
        }
        fn set_timeout(
            &self,
            _after: StdDuration,
            _f: Box<dyn FnOnce() + Send>,
        ) -> bridge_net::TimerId {
            bridge_net::TimerId(0)
        }
        fn cancel_timeout(&self, _id: bridge_net::TimerId) {}
        fn reset_active_tcp(&self) {}
    }

    #[derive(Default)]
    struct CountingCallbacks {
        errors: std::sync::atomic::AtomicUsize,
    }

    impl HostCallbacks for CountingCallbacks {
        fn on_slip_packet_ready(&self, _buffer: &[u8]) {}
        fn on_native_error(&self, _error: NativeError) {
            self.errors.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn on_buffer_empty(&self, _id: u64) {}
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        // SAFETY: `fds` is a valid two-element array; a `SOCK_STREAM` unix
        // socketpair gives a bidirectional fd standing in for the character
        // device, unlike a one-directional pipe.
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn fast_config() -> SlipConfig {
        let mut config = SlipConfig::default();
        config.signal.interval = StdDuration::from_millis(10);
        config.signal.writer_defer_stop = StdDuration::from_millis(10);
        config
    }

    #[test]
    fn attach_forwards_both_directions_then_detach_brings_netif_down() {
        let (device_fd, remote_fd) = socketpair();
        let netif = TestNetif::new();
        let runtime: Arc<dyn StackRuntime> = Arc::new(SyncRuntime);
        let callbacks = Arc::new(CountingCallbacks::default());
        let host = Host::new(Arc::new(NativeHost), callbacks as Arc<dyn HostCallbacks>);
        let config = fast_config();

        let link = SlipLink::attach(
            Arc::clone(&netif) as Arc<dyn SlipNetif>,
            device_fd,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            runtime,
            host,
            &config,
            None,
        )
        .expect("attach succeeds");

        assert!(netif.up.load(StdOrdering::SeqCst));

        // Inbound: bytes written on the remote end of the socketpair must
        // reach the netif's `input` through the reader thread.
        // SAFETY: `remote_fd` was just created by `socketpair(2)` above.
        unsafe {
            libc::write(remote_fd, b"inbound".as_ptr().cast(), 7);
        }
        thread::sleep(StdDuration::from_millis(100));
        assert_eq!(&*netif.received.lock().unwrap(), b"inbound");

        // Outbound: pushing a frame through the installed sink must reach the
        // remote end via the writer thread.
        let sink = netif.sink.lock().unwrap().clone().expect("sink installed");
        sink.on_frame(b"outbound");
        thread::sleep(StdDuration::from_millis(100));
        let mut out = [0u8; 16];
        // SAFETY: `out` is a valid 16-byte buffer and `remote_fd` is readable.
        let n = unsafe { libc::read(remote_fd, out.as_mut_ptr().cast(), out.len()) };
        assert_eq!(&out[..n as usize], b"outbound");

        link.detach();
        assert!(netif.down.load(StdOrdering::SeqCst));

        // SAFETY: `remote_fd` is solely owned by this test.
        unsafe {
            libc::close(remote_fd);
        }
    }

    #[test]
    fn detach_is_idempotent() {
        let (device_fd, remote_fd) = socketpair();
        let netif = TestNetif::new();
        let runtime: Arc<dyn StackRuntime> = Arc::new(SyncRuntime);
        let callbacks = Arc::new(CountingCallbacks::default());
        let host = Host::new(Arc::new(NativeHost), callbacks as Arc<dyn HostCallbacks>);
        let config = fast_config();

        let link = SlipLink::attach(
            Arc::clone(&netif) as Arc<dyn SlipNetif>,
            device_fd,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            runtime,
            host,
            &config,
            None,
        )
        .expect("attach succeeds");

        link.detach();
        link.detach();
        assert!(netif.down.load(StdOrdering::SeqCst));

        // SAFETY: `remote_fd` is solely owned by this test.
        unsafe {
            libc::close(remote_fd);
        }
    }
}
