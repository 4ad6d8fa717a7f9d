//! The contract the core requires of an external embedded TCP/IP stack.
//!
//! Nothing in this module runs packets; it only describes the primitives a
//! real stack (pbuf allocation, a netif, a TCP/IP worker thread, netconn
//! queues) must expose so [`crate::socket::Socket`] and a SLIP link can be
//! built against it without depending on a concrete implementation.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bridge_utils::StackError;

use crate::aggregate::NetbufChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A stack-reported receive-readiness or error event for one netconn.
///
/// Delivered synchronously on the stack's TCP/IP thread, in the exact order
/// the stack issued them.
#[derive(Debug, Clone, Copy)]
pub enum NetconnEvent {
    /// New data arrived (`len > 0`), or for TCP a `len == 0` signals the peer
    /// half-closed the connection.
    RecvPlus { len: u16 },
    /// Previously-signalled data was accepted by a higher layer.
    RecvMinus { len: u16 },
    /// A send-side event; the stack's own flow control suffices so the core
    /// ignores these, but the variant exists so implementations can report
    /// them without inventing a sentinel.
    SendPlus { len: u16 },
    SendMinus { len: u16 },
    /// The connection errored, or is being force-closed.
    Error,
}

/// Receiver for [`NetconnEvent`]s, installed on a netconn at creation time.
///
/// A [`Socket`](crate::socket::Socket) implements this indirectly through its
/// internal shared state so the stack can hold a stable, type-erased handle
/// (an `Arc`) without the aliasing games the original pointer-based design
/// needed to guard with a mutex-protected back-pointer.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: NetconnEvent);
}

/// One stack connection (TCP or UDP), queue-based, with an event callback.
///
/// Mutated only under its owning `Socket`'s `conn` mutex, per the shared
/// resource policy; `recv_avail` is the sole exception, read lock-free from
/// the `Socket::recv` fast path.
pub trait Netconn: Send {
    fn protocol(&self) -> Protocol;

    fn bind(&self, addr: SocketAddr) -> Result<(), StackError>;
    fn listen(&self, backlog: i32) -> Result<(), StackError>;
    /// Blocks (subject to the configured recv timeout) until a new
    /// connection arrives. `sink` is wired onto the accepted netconn before
    /// it can deliver any event, mirroring adoption storing the new Socket's
    /// address into the netconn's user-data slot.
    fn accept(&self, sink: Arc<dyn EventSink>) -> Result<Box<dyn Netconn>, StackError>;
    fn connect(&self, addr: SocketAddr) -> Result<(), StackError>;

    /// Attempts to write `data`, returning the number of bytes accepted.
    /// Never blocks longer than the netconn's nonblocking flag allows.
    fn write_partly(&self, data: &[u8]) -> Result<usize, StackError>;
    /// Blocks (subject to the configured recv timeout) for one chain of
    /// received bytes.
    fn recv(&self) -> Result<NetbufChain, StackError>;
    fn close(&self) -> Result<(), StackError>;

    fn set_recv_timeout(&self, timeout: Option<Duration>);
    fn recv_timeout(&self) -> Option<Duration>;
    fn set_send_timeout(&self, timeout: Option<Duration>);

    /// Sets the nonblocking flag, returning its previous value.
    fn set_nonblocking(&self, on: bool) -> bool;
    fn set_reuse_addr(&self, on: bool);
    fn set_recv_bufsize(&self, size: usize);
    fn recv_bufsize(&self) -> usize;

    fn local_addr(&self) -> Result<SocketAddr, StackError>;
    fn peer_addr(&self) -> Result<SocketAddr, StackError>;

    /// Lock-free count of bytes already queued for this netconn, readable
    /// without the `conn` mutex. Exists so `Socket::recv` can tell "an event
    /// may have arrived before my callback was installed" apart from
    /// "nothing is here yet".
    fn recv_avail(&self) -> usize;
}

/// An opaque, cancellable single-shot timer handle returned by
/// [`StackRuntime::set_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Everything the core needs from the stack's single TCP/IP worker thread:
/// scheduling work onto it, creating netconns on it, and running timers on
/// it. All non-reentrant stack calls must be issued through this trait's
/// implementor, which is expected to run them on one dedicated thread.
pub trait StackRuntime: Send + Sync {
    /// Starts the TCP/IP worker thread if not already running.
    fn tcpip_init(&self);

    fn new_netconn(
        &self,
        protocol: Protocol,
        sink: Arc<dyn EventSink>,
    ) -> Result<Box<dyn Netconn>, StackError>;

    /// Schedules `f` to run on the TCP/IP thread; does not wait for it.
    fn schedule(&self, f: Box<dyn FnOnce() + Send>);

    /// Schedules `f` on the TCP/IP thread and blocks the caller until it has
    /// run (the synchronous-RPC variant of [`Self::schedule`]).
    fn schedule_blocking(&self, f: Box<dyn FnOnce() + Send>);

    fn set_timeout(&self, after: Duration, f: Box<dyn FnOnce() + Send>) -> TimerId;
    fn cancel_timeout(&self, id: TimerId);

    /// Closes every active TCP connection on the stack's thread; used for
    /// abrupt, whole-stack teardown.
    fn reset_active_tcp(&self);
}

/// Receiver for SLIP-encoded outbound frames, installed on a [`SlipNetif`]
/// before it is brought up. Mirrors [`EventSink`] for the netconn side: the
/// stack holds a stable, type-erased handle to whatever owns the outbound
/// queue instead of a raw output-callback pointer.
pub trait SlipOutputSink: Send + Sync {
    /// `frame` is already SLIP-encoded (END/ESC framing applied) and must be
    /// copied if the sink needs to retain it past this call.
    fn on_frame(&self, frame: &[u8]);
}

/// The netif-facing half of a SLIP link: feeding raw device bytes into the
/// stack's SLIP decoder, and bringing the interface up/down.
///
/// Inbound bytes must be handed to `input` while holding whatever lock the
/// implementation uses to guard against a concurrent `detach` nulling the
/// netif, matching the "mutated only on the stack's TCP/IP thread / guarded
/// by the link's own mutex" resource policy for netifs.
pub trait SlipNetif: Send + Sync {
    /// Wires the outbound frame sink; must be called before [`Self::bring_up`].
    fn set_output_sink(&self, sink: Arc<dyn SlipOutputSink>);
    fn input(&self, bytes: &[u8]) -> Result<(), StackError>;
    fn bring_up(&self, local: Ipv4Addr, netmask: Ipv4Addr) -> Result<(), StackError>;
    fn bring_down(&self);
}
