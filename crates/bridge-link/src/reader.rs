//! The reader thread: blocking `read(2)` on the device fd, feeding decoded
//! bytes into the SLIP netif. Grounded on `SlipInterface::readerThreadLoop`.

use std::{
    os::unix::io::RawFd,
    sync::{atomic::{AtomicBool, Ordering}, Arc, Mutex},
};

use bridge_net::SlipNetif;
use tracing::{debug, info, warn};

use crate::signal::ThreadHandle;

const READ_BUF_LEN: usize = 8192;

pub(crate) fn run(
    fd: RawFd,
    netif: Arc<Mutex<Option<Arc<dyn SlipNetif>>>>,
    stop_read: Arc<AtomicBool>,
    handle: Arc<ThreadHandle>,
) {
    handle.publish_self();
    let mut buf = [0u8; READ_BUF_LEN];

    loop {
        if stop_read.load(Ordering::SeqCst) {
            debug!("reader: stop_read observed");
            break;
        }

        // SAFETY: `buf` is valid for `READ_BUF_LEN` bytes and `fd` is owned
        // by the link for the lifetime of this thread.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };

        if n > 0 {
            let guard = netif.lock().unwrap();
            if let Some(netif) = guard.as_ref() {
                if let Err(e) = netif.input(&buf[..n as usize]) {
                    warn!(error = ?e, "slip netif rejected input");
                }
            }
            continue;
        }

        if n == 0 {
            info!("reader: device reached EOF");
            break;
        }

        let err = io_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            debug!("reader: EINTR, re-checking stop flag");
            continue;
        }
        warn!(error = %err, "reader: device read failed");
        break;
    }

    handle.mark_stopped();
    handle.wait_for_termination_signal();
}

fn io_error() -> std::io::Error {
    std::io::Error::last_os_error()
}
