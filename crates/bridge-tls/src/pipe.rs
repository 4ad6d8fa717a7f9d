//! The two in-memory byte pipes a [`crate::TlsStateMachine`] pumps ciphertext
//! through, standing in for the pair of `BIO_s_mem()` objects the original
//! state machine wired directly into `SSL_set_bio`.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{Arc, Mutex},
};

#[derive(Clone, Default)]
pub(crate) struct Pipe(Arc<Mutex<VecDeque<u8>>>);

impl Pipe {
    pub(crate) fn push(&self, data: &[u8]) {
        self.0.lock().unwrap().extend(data.iter().copied());
    }

    pub(crate) fn drain_into(&self, dst: &mut [u8]) -> usize {
        let mut queue = self.0.lock().unwrap();
        let n = dst.len().min(queue.len());
        for slot in dst.iter_mut().take(n) {
            *slot = queue.pop_front().unwrap();
        }
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// `Read`/`Write` adapter handed to `openssl::ssl::Ssl::{connect,accept}`.
///
/// Reads drain the ingress pipe (caller-fed ciphertext); writes append to the
/// egress pipe (library-produced ciphertext). Both report
/// [`io::ErrorKind::WouldBlock`] instead of blocking, which is exactly the
/// signal the handshake and record layer need to suspend mid-operation and
/// resume once more bytes are injected or drained.
pub(crate) struct MemPipe {
    pub(crate) ingress: Pipe,
    pub(crate) egress: Pipe,
}

impl Read for MemPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.ingress.drain_into(buf);
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        Ok(n)
    }
}

impl Write for MemPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.egress.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
