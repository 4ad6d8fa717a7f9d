//! The cooperative cancellation protocol for a thread blocked in `read`/
//! `write` on a character device that honours neither `O_NONBLOCK` nor a
//! close from another thread: a process-wide `SIGHUP` handler with no
//! `SA_RESTART`, delivered to one specific thread at a time via
//! `pthread_kill`, grounded on `SlipInterface::terminateThread`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, Once,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{info, warn};

static SIGHUP_INIT: Once = Once::new();
static SIGHUP_READY: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide `SIGHUP` handler exactly once. Must run before
/// any reader/writer thread starts, so that the signal always returns
/// `EINTR` from a blocked syscall rather than terminating the process or
/// restarting it.
pub(crate) fn ensure_sighup_handler() -> bool {
    SIGHUP_INIT.call_once(|| {
        // SAFETY: the handler does nothing; its only purpose is to make
        // `signal_hook` install a `sigaction` without `SA_RESTART` so blocked
        // `read`/`write` calls return `EINTR` instead of being retried by the
        // kernel.
        let installed = unsafe { signal_hook::low_level::register(libc::SIGHUP, || {}) };
        match installed {
            Ok(_) => SIGHUP_READY.store(true, Ordering::SeqCst),
            Err(e) => warn!(error = %e, "failed to install SIGHUP handler"),
        }
    });
    SIGHUP_READY.load(Ordering::SeqCst)
}

/// A counting semaphore, standing in for `sdl_android`'s `Semaphore`: used
/// only so the signalling thread never calls `pthread_kill` on a thread that
/// has already exited (and hence had its tid reused by the kernel).
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self { count: Mutex::new(0), cv: Condvar::new() }
    }

    pub(crate) fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// Shared between a worker thread and whatever calls [`Self::terminate`] on
/// it. The worker publishes its own `pthread_t` at startup and flips
/// `stopped` just before waiting on `term_sem`; the terminator signals until
/// `stopped` is observed, then releases `term_sem` so the worker may exit.
pub(crate) struct ThreadHandle {
    pthread_id: Mutex<Option<libc::pthread_t>>,
    stopped: AtomicBool,
    term_sem: Semaphore,
    name: &'static str,
}

impl ThreadHandle {
    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            pthread_id: Mutex::new(None),
            stopped: AtomicBool::new(false),
            term_sem: Semaphore::new(),
            name,
        })
    }

    /// Must be called from inside the worker thread itself, before it enters
    /// its blocking loop.
    pub(crate) fn publish_self(&self) {
        // SAFETY: `pthread_self` has no preconditions.
        let id = unsafe { libc::pthread_self() };
        *self.pthread_id.lock().unwrap() = Some(id);
    }

    /// Must be called from inside the worker thread itself, immediately
    /// before blocking on `term_sem`.
    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn wait_for_termination_signal(&self) {
        self.term_sem.wait();
    }

    /// Busy-polls `stopped` for up to `defer`, then signals `SIGHUP` at
    /// `interval` until the worker reports stopped, then releases it to exit
    /// and joins.
    pub(crate) fn terminate(&self, interval: Duration, defer: Duration, handle: JoinHandle<()>) {
        if !self.stopped.load(Ordering::SeqCst) && defer > Duration::ZERO {
            let deadline = Instant::now() + defer;
            while !self.stopped.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
        }

        while !self.stopped.load(Ordering::SeqCst) {
            let tid = *self.pthread_id.lock().unwrap();
            if let Some(tid) = tid {
                if !ensure_sighup_handler() {
                    warn!(thread = self.name, "cannot signal thread: no SIGHUP handler installed");
                    break;
                }
                info!(thread = self.name, "sending SIGHUP to unblock thread");
                // SAFETY: `tid` was published by the still-running worker and
                // this loop only continues while `stopped` is false, so the
                // thread has not yet returned and its identity is still live.
                unsafe {
                    libc::pthread_kill(tid, libc::SIGHUP);
                }
            }
            thread::sleep(interval);
        }

        self.term_sem.signal();
        if let Err(e) = handle.join() {
            warn!(thread = self.name, ?e, "worker thread panicked");
        }
    }
}
