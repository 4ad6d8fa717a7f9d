//! Stuck-write detection: a periodic poll on the stack's TCP/IP thread that
//! samples the writer's current in-flight write id and fires exactly one
//! `onNativeError(USB_STUCK)` if it never advances for the configured
//! threshold. Grounded on `SlipInterface::watchdogTimerCb`.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bridge_host::Host;
use bridge_net::{StackRuntime, TimerId};
use bridge_utils::NativeError;
use tracing::warn;

use crate::writer::WriterShared;

struct WatchdogState {
    last_sample: Option<i64>,
    stuck_ticks: u32,
    fired: bool,
    timer: Option<TimerId>,
}

/// Owns the periodic stack-thread timer for one [`crate::SlipLink`]. Disabled
/// entirely (never arms a timer) when `stuck_threshold_secs` is zero.
pub(crate) struct Watchdog {
    writer: Arc<WriterShared>,
    host: Host,
    runtime: Arc<dyn StackRuntime>,
    poll_interval: Duration,
    /// Tick count at which exactly one error fires; zero disables firing
    /// (and `arm` becomes a no-op).
    threshold_ticks: u32,
    state: Mutex<WatchdogState>,
}

impl Watchdog {
    pub(crate) fn new(
        writer: Arc<WriterShared>,
        host: Host,
        runtime: Arc<dyn StackRuntime>,
        poll_interval: Duration,
        stuck_threshold_secs: u32,
    ) -> Arc<Self> {
        let threshold_ticks = if stuck_threshold_secs == 0 || poll_interval.is_zero() {
            0
        } else {
            (stuck_threshold_secs as u64 * 1000 / poll_interval.as_millis().max(1) as u64) as u32
        };
        Arc::new(Self {
            writer,
            host,
            runtime,
            poll_interval,
            threshold_ticks,
            state: Mutex::new(WatchdogState { last_sample: None, stuck_ticks: 0, fired: false, timer: None }),
        })
    }

    pub(crate) fn arm(self: &Arc<Self>) {
        if self.threshold_ticks == 0 {
            return;
        }
        self.schedule_next();
    }

    pub(crate) fn cancel(&self) {
        if let Some(id) = self.state.lock().unwrap().timer.take() {
            self.runtime.cancel_timeout(id);
        }
    }

    fn schedule_next(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let id = self.runtime.set_timeout(
            self.poll_interval,
            Box::new(move || this.tick()),
        );
        self.state.lock().unwrap().timer = Some(id);
    }

    fn tick(self: &Arc<Self>) {
        let sample = self.writer.current_write_sample();
        let mut state = self.state.lock().unwrap();

        let stuck = match (sample, state.last_sample) {
            (Some(cur), Some(prev)) if cur == prev => true,
            _ => false,
        };
        state.last_sample = sample;

        if stuck {
            state.stuck_ticks += 1;
        } else {
            state.stuck_ticks = 0;
        }

        // `==`, not `>=`: fires exactly once per stuck episode, not once per
        // tick past the threshold.
        if state.stuck_ticks == self.threshold_ticks && !state.fired {
            state.fired = true;
            warn!("writer appears stuck; reporting USB_STUCK");
            drop(state);
            self.host.on_native_error(NativeError::UsbStuck);
        } else if !stuck {
            state.fired = false;
        }

        drop(state);
        self.schedule_next();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bridge_host::{Host, HostCallbacks, HostRuntime, NativeHost};
    use bridge_net::{EventSink, Netconn, Protocol};

    use super::*;

    /// Runs timers only when the test calls [`Self::fire_due`], so `tick()`
    /// can be driven deterministically instead of racing a real clock.
    #[derive(Default)]
    struct ManualRuntime {
        pending: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl StackRuntime for ManualRuntime {
        fn tcpip_init(&self) {}
        fn new_netconn(
            &self,
            _protocol: Protocol,
            _sink: Arc<dyn EventSink>,
        ) -> Result<Box<dyn Netconn>, bridge_utils::StackError> {
            unimplemented!("not exercised by this test")
        }
        fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
            f();
        }
        fn schedule_blocking(&self, f: Box<dyn FnOnce() + Send>) {
            f();
        }
        fn set_timeout(&self, _after: Duration, f: Box<dyn FnOnce() + Send>) -> TimerId {
            *self.pending.lock().unwrap() = Some(f);
            TimerId(0)
        }
        fn cancel_timeout(&self, _id: TimerId) {
            self.pending.lock().unwrap().take();
        }
        fn reset_active_tcp(&self) {}
    }

    impl ManualRuntime {
        fn fire_due(&self) {
            let f = self.pending.lock().unwrap().take();
            if let Some(f) = f {
                f();
            }
        }
    }

    #[derive(Default)]
    struct CountingCallbacks {
        errors: AtomicUsize,
    }

    impl HostCallbacks for CountingCallbacks {
        fn on_slip_packet_ready(&self, _buffer: &[u8]) {}
        fn on_native_error(&self, _error: NativeError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_buffer_empty(&self, _id: u64) {}
    }

    fn test_host(callbacks: Arc<dyn HostCallbacks>) -> Host {
        Host::new(Arc::new(NativeHost), callbacks)
    }

    #[test]
    fn fires_exactly_once_per_stuck_episode() {
        let writer = WriterShared::new(-1, true);
        let callbacks = Arc::new(CountingCallbacks::default());
        let host = test_host(Arc::clone(&callbacks) as Arc<dyn HostCallbacks>);
        let runtime = Arc::new(ManualRuntime::default());
        let runtime_dyn: Arc<dyn StackRuntime> = Arc::clone(&runtime) as Arc<dyn StackRuntime>;

        let watchdog = Watchdog::new(
            Arc::clone(&writer),
            host,
            runtime_dyn,
            Duration::from_secs(1),
            3,
        );
        assert_eq!(watchdog.threshold_ticks, 3);
        watchdog.arm();

        writer.set_write_sample_for_test(Some(42));
        for _ in 0..5 {
            runtime.fire_due();
        }
        assert_eq!(callbacks.errors.load(Ordering::SeqCst), 1);

        // Recovery: sample advances, resetting the stuck counter.
        writer.set_write_sample_for_test(Some(43));
        runtime.fire_due();
        assert_eq!(callbacks.errors.load(Ordering::SeqCst), 1);

        // A fresh stuck episode fires again.
        for _ in 0..3 {
            runtime.fire_due();
        }
        assert_eq!(callbacks.errors.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_threshold_disables_arming() {
        let writer = WriterShared::new(-1, true);
        let callbacks = Arc::new(CountingCallbacks::default());
        let host = test_host(Arc::clone(&callbacks) as Arc<dyn HostCallbacks>);
        let runtime = Arc::new(ManualRuntime::default());
        let runtime_dyn: Arc<dyn StackRuntime> = Arc::clone(&runtime) as Arc<dyn StackRuntime>;

        let watchdog =
            Watchdog::new(writer, host, runtime_dyn, Duration::from_secs(1), 0);
        watchdog.arm();
        assert!(runtime.pending.lock().unwrap().is_none());
    }
}
