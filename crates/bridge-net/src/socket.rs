//! A blocking TCP/UDP socket facade over a [`StackRuntime`]-provided
//! [`Netconn`], optionally carrying a TLS session. Grounded on
//! `NetconnSocket.cpp`: every suspension point, lock ordering and retry
//! discipline here mirrors a specific piece of that file.

use std::{
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use bridge_tls::{SslContext, TlsStateMachine};
use bridge_utils::{BridgeConfig, BridgeError, SslErrorCode, StackError};
use tracing::{debug, warn};

use crate::{
    aggregate::NetbufAggregator,
    stack::{EventSink, Netconn, NetconnEvent, Protocol, StackRuntime},
};

/// Shared receive-readiness state, the `recv_event_mutex_`/`recv_cond_` pair
/// from the original, reachable both from the stack's event callback and
/// from `Socket::recv`.
#[derive(Default)]
struct RecvState {
    recv_event_count: i64,
    peer_half_closed: bool,
    error_latched: bool,
    closing: bool,
}

/// The part of a [`Socket`] handed to the stack as an [`EventSink`]; must
/// outlive the `Netconn` itself since the stack may deliver events up until
/// the connection is fully torn down.
struct SocketEvents {
    state: Mutex<RecvState>,
    cv: Condvar,
    /// Listening sockets never react to events; this is set once at
    /// construction and never changes.
    reactive: bool,
}

impl SocketEvents {
    fn new(reactive: bool) -> Self {
        Self { state: Mutex::new(RecvState::default()), cv: Condvar::new(), reactive }
    }

    fn mark_closing(&self) {
        let mut state = self.state.lock().unwrap();
        state.closing = true;
        self.cv.notify_all();
    }

    fn terminal(state: &RecvState) -> bool {
        state.closing || state.peer_half_closed || state.error_latched
    }
}

impl EventSink for SocketEvents {
    fn on_event(&self, event: NetconnEvent) {
        if !self.reactive {
            return;
        }
        let mut state = self.state.lock().unwrap();
        match event {
            NetconnEvent::RecvPlus { len } if len > 0 => {
                state.recv_event_count += 1;
                self.cv.notify_all();
            }
            NetconnEvent::RecvPlus { len: 0 } => {
                state.peer_half_closed = true;
                self.cv.notify_all();
            }
            NetconnEvent::RecvMinus { len } if len > 0 => {
                if state.recv_event_count > 0 {
                    state.recv_event_count -= 1;
                }
            }
            NetconnEvent::Error => {
                state.error_latched = true;
                self.cv.notify_all();
            }
            NetconnEvent::RecvPlus { .. } | NetconnEvent::RecvMinus { .. } => {}
            NetconnEvent::SendPlus { .. } | NetconnEvent::SendMinus { .. } => {}
        }
    }
}

/// A TLS-side tag: which role a session plays in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Server,
    Client,
}

/// Blocking TCP or UDP socket, optionally with TLS layered on top.
///
/// Lock order, matching the shared-resource policy: `conn` is always taken
/// before `ssl`; `send` is independent of both and only ever held by
/// [`Self::send`]; `recv_event`'s mutex is only ever held transiently inside
/// [`SocketEvents`].
pub struct Socket {
    runtime: Arc<dyn StackRuntime>,
    protocol: Protocol,
    conn: Mutex<Option<Box<dyn Netconn>>>,
    send_mutex: Mutex<()>,
    ssl: Mutex<Option<TlsStateMachine>>,
    events: Arc<SocketEvents>,
    aggregator: NetbufAggregator,
    config: BridgeConfig,
}

impl Socket {
    /// Creates a fresh netconn of the given protocol, reacting to stack
    /// events (entry point (i)).
    pub fn new(
        runtime: Arc<dyn StackRuntime>,
        protocol: Protocol,
        config: BridgeConfig,
    ) -> Result<Self, StackError> {
        let events = Arc::new(SocketEvents::new(true));
        let conn = runtime.new_netconn(protocol, events.clone() as Arc<dyn EventSink>)?;
        Ok(Self {
            runtime,
            protocol,
            conn: Mutex::new(Some(conn)),
            send_mutex: Mutex::new(()),
            ssl: Mutex::new(None),
            events,
            aggregator: NetbufAggregator::new(),
            config,
        })
    }

    /// A listening socket: created but never reacts to events (entry point
    /// (iii) plus an immediate `listen`).
    pub fn new_listener(
        runtime: Arc<dyn StackRuntime>,
        protocol: Protocol,
        config: BridgeConfig,
    ) -> Result<Self, StackError> {
        let events = Arc::new(SocketEvents::new(false));
        let conn = runtime.new_netconn(protocol, events.clone() as Arc<dyn EventSink>)?;
        Ok(Self {
            runtime,
            protocol,
            conn: Mutex::new(Some(conn)),
            send_mutex: Mutex::new(()),
            ssl: Mutex::new(None),
            events,
            aggregator: NetbufAggregator::new(),
            config,
        })
    }

    /// Adopts a netconn handed back from [`Netconn::accept`] (entry point
    /// (ii)); the caller is responsible for the accepted netconn's own event
    /// sink having been wired by the stack at `accept` time.
    fn from_accepted(
        runtime: Arc<dyn StackRuntime>,
        protocol: Protocol,
        conn: Box<dyn Netconn>,
        events: Arc<SocketEvents>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            runtime,
            protocol,
            conn: Mutex::new(Some(conn)),
            send_mutex: Mutex::new(()),
            ssl: Mutex::new(None),
            events,
            aggregator: NetbufAggregator::new(),
            config,
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<(), StackError> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(StackError::Closed)?;
        conn.bind(addr)
    }

    pub fn listen(&self, backlog: i32) -> Result<(), StackError> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(StackError::Closed)?;
        conn.listen(backlog)
    }

    /// Accepts one connection, imposing the 1-second internal poll against
    /// `closing` unless the caller supplied a positive outer timeout. A
    /// listener with TLS configured performs a bounded handshake on the
    /// accepted socket before returning it; handshake failure drops the
    /// socket and yields `None`.
    pub fn accept(&self, outer_timeout: Option<Duration>) -> Result<Option<Socket>, StackError> {
        let poll_timeout = outer_timeout.unwrap_or(self.config.accept.internal_timeout);
        loop {
            if self.events.state.lock().unwrap().closing {
                return Err(StackError::Closed);
            }

            let events = Arc::new(SocketEvents::new(true));
            let accepted = {
                let guard = self.conn.lock().unwrap();
                let conn = guard.as_ref().ok_or(StackError::Closed)?;
                let previous = conn.recv_timeout();
                conn.set_recv_timeout(Some(poll_timeout));
                let result = conn.accept(events.clone() as Arc<dyn EventSink>);
                conn.set_recv_timeout(previous);
                result
            };

            match accepted {
                Ok(new_conn) => {
                    let socket = Self::from_accepted(
                        self.runtime.clone(),
                        self.protocol,
                        new_conn,
                        events,
                        self.config,
                    );

                    let listener_ctx = self.ssl.lock().unwrap().as_ref().map(TlsStateMachine::context);
                    if let Some(ctx) = listener_ctx {
                        if !socket.accept_tls_handshake(&ctx, self.config.accept.ssl_handshake_timeout) {
                            warn!("inline TLS handshake failed on accepted socket");
                            let _ = socket.close();
                            return Ok(None);
                        }
                    }
                    return Ok(Some(socket));
                }
                Err(StackError::Timeout) if outer_timeout.is_none() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn accept_tls_handshake(&self, ctx: &SslContext, timeout: Duration) -> bool {
        match TlsStateMachine::from_context(ctx, true) {
            Ok(tls) => {
                *self.ssl.lock().unwrap() = Some(tls);
                let deadline = Instant::now() + timeout;
                while Instant::now() < deadline {
                    if self.drive_handshake_tick(self.config.handshake.accept_poll) {
                        return true;
                    }
                }
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to build accepted-side TLS session");
                false
            }
        }
    }

    /// Configures TLS on a not-yet-connected socket (client role, or a
    /// listener socket whose context is cloned into every accepted
    /// connection).
    pub fn attach_tls(&self, tls: TlsStateMachine) {
        *self.ssl.lock().unwrap() = Some(tls);
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<(), StackError> {
        {
            let guard = self.conn.lock().unwrap();
            let conn = guard.as_ref().ok_or(StackError::Closed)?;
            conn.connect(addr)?;
        }

        if self.ssl.lock().unwrap().is_some() {
            loop {
                if self.drive_handshake_tick(self.config.handshake.connect_poll) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// One handshake step: flush pending egress ciphertext, attempt
    /// `ReadExtract`; on `NeedMore`, pull up to the poll timeout of fresh
    /// ciphertext and inject it (timeouts are treated as "keep going").
    /// Returns `true` once the handshake has completed.
    fn drive_handshake_tick(&self, poll: Duration) -> bool {
        let ssl_guard = self.ssl.lock().unwrap();
        let Some(tls) = ssl_guard.as_ref() else { return true };

        if tls.is_write_pending() {
            let mut scratch = [0u8; 16 * 1024];
            loop {
                let n = tls.write_extract(&mut scratch);
                if n == 0 {
                    break;
                }
                if let Err(e) = self.send_raw(&scratch[..n]) {
                    warn!(error = %e, "failed to flush handshake ciphertext");
                    return true;
                }
            }
        }

        let mut scratch = [0u8; 16 * 1024];
        match tls.read_extract(&mut scratch) {
            Ok(_) if tls.is_handshake_complete() => true,
            Ok(_) => {
                drop(ssl_guard);
                match self.recv_raw(Some(poll)) {
                    Ok(data) if !data.is_empty() => {
                        if let Some(tls) = self.ssl.lock().unwrap().as_ref() {
                            tls.read_inject(&data);
                        }
                        false
                    }
                    Ok(_) | Err(StackError::Timeout) => false,
                    Err(_) => true,
                }
            }
            Err(BridgeError::NeedMore) => {
                drop(ssl_guard);
                match self.recv_raw(Some(poll)) {
                    Ok(data) if !data.is_empty() => {
                        if let Some(tls) = self.ssl.lock().unwrap().as_ref() {
                            tls.read_inject(&data);
                        }
                        false
                    }
                    Ok(_) | Err(StackError::Timeout) => false,
                    Err(_) => true,
                }
            }
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                true
            }
        }
    }

    /// Raw (non-TLS) send, used both for plaintext sockets and to transport
    /// TLS ciphertext.
    pub fn send(&self, data: &[u8]) -> Result<(), StackError> {
        if self.ssl.lock().unwrap().is_some() {
            return self.ssl_write(data);
        }
        self.send_raw(data)
    }

    fn send_raw(&self, data: &[u8]) -> Result<(), StackError> {
        match self.protocol {
            Protocol::Udp => {
                let guard = self.conn.lock().unwrap();
                let conn = guard.as_ref().ok_or(StackError::Closed)?;
                conn.write_partly(data)?;
                Ok(())
            }
            Protocol::Tcp => {
                let _serial = self.send_mutex.lock().unwrap();
                let mut offset = 0;
                while offset < data.len() {
                    if self.events.state.lock().unwrap().closing {
                        return Err(StackError::Closed);
                    }

                    let result = {
                        let guard = self.conn.lock().unwrap();
                        let conn = guard.as_ref().ok_or(StackError::Closed)?;
                        let was_nonblocking = conn.set_nonblocking(true);
                        let result = conn.write_partly(&data[offset..]);
                        conn.set_nonblocking(was_nonblocking);
                        result
                    };

                    match result {
                        Ok(n) => offset += n,
                        Err(e) if e.is_transient_send_congestion() => {
                            thread::sleep(self.config.send_backoff());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    }

    /// Plaintext receive: aggregator fast path, then the blocking wait on
    /// `recv_cv`, then one `netconn_recv` call.
    pub fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, StackError> {
        if self.ssl.lock().unwrap().is_some() {
            return self.ssl_read(buf, timeout);
        }
        self.recv_into(buf, timeout)
    }

    fn recv_raw(&self, timeout: Option<Duration>) -> Result<Vec<u8>, StackError> {
        let mut buf = [0u8; 16 * 1024];
        let n = self.recv_into(&mut buf, timeout)?;
        Ok(buf[..n].to_vec())
    }

    fn recv_into(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, StackError> {
        if self.aggregator.size() > 0 {
            return Ok(self.aggregator.take(buf));
        }

        {
            let conn_avail = {
                let guard = self.conn.lock().unwrap();
                guard.as_ref().map_or(0, |c| c.recv_avail())
            };

            let mut state = self.events.state.lock().unwrap();
            if conn_avail == 0 && state.recv_event_count == 0 {
                let predicate =
                    |s: &RecvState| s.recv_event_count > 0 || SocketEvents::terminal(s);
                match timeout {
                    None => {
                        state = self.events.cv.wait_while(state, |s| !predicate(s)).unwrap();
                    }
                    Some(t) => {
                        let (guard, timed_out) = self
                            .events
                            .cv
                            .wait_timeout_while(state, t, |s| !predicate(s))
                            .unwrap();
                        state = guard;
                        if timed_out.timed_out() && !predicate(&state) {
                            return Err(StackError::Timeout);
                        }
                    }
                }
            }

            if state.closing || state.error_latched {
                return Err(StackError::Closed);
            }
            if state.recv_event_count > 0 {
                state.recv_event_count -= 1;
            }
        }

        let mut guard = self.conn.lock().unwrap();
        let Some(conn) = guard.as_mut() else { return Err(StackError::Closed) };
        let previous = conn.recv_timeout();
        if let Some(t) = timeout {
            conn.set_recv_timeout(Some(t));
        }
        let result = conn.recv();
        conn.set_recv_timeout(previous);
        drop(guard);

        match result {
            Ok(chain) => {
                self.aggregator.set(chain);
                Ok(self.aggregator.take(buf))
            }
            Err(e) => Err(e),
        }
    }

    /// `sslRead`: drain buffered plaintext first, else pull one round of
    /// ciphertext and decrypt it.
    fn ssl_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, StackError> {
        {
            let ssl_guard = self.ssl.lock().unwrap();
            let tls = ssl_guard.as_ref().ok_or(StackError::Closed)?;
            match tls.read_extract(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(_) => return Err(StackError::Val),
            }
        }

        let ciphertext = self.recv_raw(timeout)?;
        if ciphertext.is_empty() {
            return Err(StackError::Timeout);
        }

        let ssl_guard = self.ssl.lock().unwrap();
        let tls = ssl_guard.as_ref().ok_or(StackError::Closed)?;
        tls.read_inject(&ciphertext);
        match tls.read_extract(buf) {
            Ok(n) if n > 0 => Ok(n),
            Ok(_) => Err(StackError::Timeout),
            Err(_) => Err(StackError::Val),
        }
    }

    /// `sslWrite`: feed plaintext, then flush all resulting ciphertext.
    fn ssl_write(&self, data: &[u8]) -> Result<(), StackError> {
        {
            let ssl_guard = self.ssl.lock().unwrap();
            let tls = ssl_guard.as_ref().ok_or(StackError::Closed)?;
            if tls.write_inject(data).is_err() {
                return Err(StackError::Val);
            }
        }

        loop {
            let pending = {
                let ssl_guard = self.ssl.lock().unwrap();
                let tls = ssl_guard.as_ref().ok_or(StackError::Closed)?;
                if !tls.is_write_pending() {
                    break;
                }
                let mut scratch = vec![0u8; 64 * 1024];
                let n = tls.write_extract(&mut scratch);
                scratch.truncate(n);
                scratch
            };
            if pending.is_empty() {
                break;
            }
            self.send_raw(&pending)?;
        }
        Ok(())
    }

    /// Idempotent. Unblocks `accept`'s poll loop and any pending `recv`
    /// within one tick.
    pub fn close(&self) -> Result<(), StackError> {
        self.events.mark_closing();

        let mut guard = self.conn.lock().unwrap();
        let Some(conn) = guard.take() else {
            return Err(StackError::Closed);
        };
        if self.protocol == Protocol::Tcp {
            if let Err(e) = conn.close() {
                debug!(error = %e, "netconn_close failed during Socket::close");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Walks the stack's active TCP connections and force-closes each; runs on
/// the stack's own thread via a scheduled callback, for abrupt whole-stack
/// teardown.
pub fn reset_all_active_tcp(runtime: &Arc<dyn StackRuntime>) {
    let runtime = runtime.clone();
    runtime.schedule(Box::new(move || runtime.reset_active_tcp()));
}
