use thiserror::Error;

/// Transport-layer errors, passed through from the embedded TCP/IP stack.
///
/// These mirror the small negative integers the stack itself uses so that a
/// [`StackError`] can be round-tripped across the host-callback boundary
/// without translation tables on either side.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum StackError {
    #[error("invalid argument")]
    Val = -1,
    #[error("out of memory")]
    Mem = -2,
    #[error("operation timed out")]
    Timeout = -3,
    #[error("connection closed")]
    Closed = -4,
    #[error("operation would block")]
    WouldBlock = -5,
    #[error("argument out of range")]
    Arg = -6,
}

impl StackError {
    /// `true` for the two disciplines [`Socket::send`](crate) retries rather
    /// than surfaces: a full send queue, or the stack's own OOM bug which is
    /// indistinguishable from queue congestion on the reference stack.
    #[must_use]
    pub const fn is_transient_send_congestion(self) -> bool {
        matches!(self, Self::WouldBlock | Self::Mem)
    }
}

/// TLS errors, numbered to match the OpenSSL error constants the original
/// implementation surfaced to its host language.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum SslErrorCode {
    #[error("SSL library error")]
    Ssl = -101,
    #[error("SSL wants more input")]
    WantRead = -102,
    #[error("SSL wants to flush output")]
    WantWrite = -103,
    #[error("SSL wants an X509 lookup")]
    WantX509Lookup = -104,
    #[error("SSL syscall error")]
    Syscall = -105,
    #[error("SSL connection cleanly shut down")]
    ZeroReturn = -106,
    #[error("SSL wants to connect")]
    WantConnect = -107,
    #[error("SSL wants to accept")]
    WantAccept = -108,
}

/// Errors surfaced out-of-band from a [`SlipLink`](crate) to the host via
/// `onNativeError`. Never returned from a `Socket` call.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum NativeError {
    #[error("device write failed")]
    UsbWrite = -1,
    #[error("device write appears stuck")]
    UsbStuck = -2,
}

/// The union of errors any single core operation can return.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Ssl(#[from] SslErrorCode),
    /// The state machine needs more transport bytes before it can make
    /// progress; not a failure.
    #[error("need more data")]
    NeedMore,
}
