//! A `std::net`-backed [`StackRuntime`]/[`Netconn`] double used only by this
//! crate's own tests, standing in for the real embedded stack which is
//! explicitly out of scope here.
//!
//! Simplification: [`TestNetconn::recv_avail`] always reports bytes as
//! "maybe available" so [`crate::socket::Socket::recv`] always falls through
//! to a real blocking read rather than waiting on a simulated event
//! callback; this double has no TCP/IP worker thread to deliver one from.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bridge_utils::StackError;

use crate::{
    aggregate::NetbufChain,
    stack::{EventSink, Netconn, Protocol, StackRuntime, TimerId},
};

pub(crate) struct LoopbackStack;

impl LoopbackStack {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl StackRuntime for LoopbackStack {
    fn tcpip_init(&self) {}

    fn new_netconn(
        &self,
        protocol: Protocol,
        _sink: Arc<dyn EventSink>,
    ) -> Result<Box<dyn Netconn>, StackError> {
        Ok(Box::new(TestNetconn::new(protocol)))
    }

    fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }

    fn schedule_blocking(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }

    fn set_timeout(&self, _after: Duration, _f: Box<dyn FnOnce() + Send>) -> TimerId {
        TimerId(0)
    }

    fn cancel_timeout(&self, _id: TimerId) {}

    fn reset_active_tcp(&self) {}
}

enum Transport {
    Unbound,
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    Udp(UdpSocket, Mutex<Option<SocketAddr>>),
}

struct TestNetconnState {
    transport: Transport,
    recv_timeout: Option<Duration>,
    nonblocking: bool,
    bind_addr: Option<SocketAddr>,
}

pub(crate) struct TestNetconn {
    protocol: Protocol,
    state: Mutex<TestNetconnState>,
}

impl TestNetconn {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: Mutex::new(TestNetconnState {
                transport: Transport::Unbound,
                recv_timeout: None,
                nonblocking: false,
                bind_addr: None,
            }),
        }
    }

    fn from_stream(protocol: Protocol, stream: TcpStream) -> Self {
        Self {
            protocol,
            state: Mutex::new(TestNetconnState {
                transport: Transport::TcpStream(stream),
                recv_timeout: None,
                nonblocking: false,
                bind_addr: None,
            }),
        }
    }
}

fn map_io_err(e: &io::Error) -> StackError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => StackError::Timeout,
        _ => StackError::Val,
    }
}

impl Netconn for TestNetconn {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn bind(&self, addr: SocketAddr) -> Result<(), StackError> {
        let mut state = self.state.lock().unwrap();
        if self.protocol == Protocol::Udp {
            let socket = UdpSocket::bind(addr).map_err(|_| StackError::Val)?;
            state.transport = Transport::Udp(socket, Mutex::new(None));
        } else {
            state.bind_addr = Some(addr);
        }
        Ok(())
    }

    fn listen(&self, _backlog: i32) -> Result<(), StackError> {
        let mut state = self.state.lock().unwrap();
        let addr = state.bind_addr.ok_or(StackError::Arg)?;
        let listener = TcpListener::bind(addr).map_err(|_| StackError::Val)?;
        state.transport = Transport::TcpListener(listener);
        Ok(())
    }

    fn accept(&self, _sink: Arc<dyn EventSink>) -> Result<Box<dyn Netconn>, StackError> {
        let (listener, timeout) = {
            let state = self.state.lock().unwrap();
            let Transport::TcpListener(listener) = &state.transport else {
                return Err(StackError::Arg);
            };
            (listener.try_clone().map_err(|_| StackError::Val)?, state.recv_timeout)
        };

        match timeout {
            Some(t) => {
                listener.set_nonblocking(true).ok();
                let deadline = Instant::now() + t;
                loop {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            stream.set_nonblocking(false).ok();
                            return Ok(Box::new(Self::from_stream(self.protocol, stream)));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            if Instant::now() >= deadline {
                                return Err(StackError::Timeout);
                            }
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => return Err(StackError::Val),
                    }
                }
            }
            None => {
                listener.set_nonblocking(false).ok();
                let (stream, _) = listener.accept().map_err(|_| StackError::Val)?;
                Ok(Box::new(Self::from_stream(self.protocol, stream)))
            }
        }
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), StackError> {
        let mut state = self.state.lock().unwrap();
        match self.protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect(addr).map_err(|_| StackError::Val)?;
                state.transport = Transport::TcpStream(stream);
            }
            Protocol::Udp => {
                if let Transport::Udp(_, peer) = &state.transport {
                    *peer.lock().unwrap() = Some(addr);
                } else {
                    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|_| StackError::Val)?;
                    state.transport = Transport::Udp(socket, Mutex::new(Some(addr)));
                }
            }
        }
        Ok(())
    }

    fn write_partly(&self, data: &[u8]) -> Result<usize, StackError> {
        let state = self.state.lock().unwrap();
        match &state.transport {
            Transport::TcpStream(stream) => {
                stream.set_nonblocking(state.nonblocking).ok();
                match (&stream).write(data) {
                    Ok(n) => Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(StackError::WouldBlock),
                    Err(_) => Err(StackError::Val),
                }
            }
            Transport::Udp(socket, peer) => {
                let peer = peer.lock().unwrap().ok_or(StackError::Arg)?;
                socket.send_to(data, peer).map_err(|_| StackError::Val)
            }
            Transport::TcpListener(_) | Transport::Unbound => Err(StackError::Arg),
        }
    }

    fn recv(&self) -> Result<NetbufChain, StackError> {
        let state = self.state.lock().unwrap();
        let mut buf = [0u8; 16 * 1024];
        match &state.transport {
            Transport::TcpStream(stream) => {
                stream.set_nonblocking(false).ok();
                stream.set_read_timeout(state.recv_timeout).ok();
                match (&stream).read(&mut buf) {
                    Ok(0) => Err(StackError::Closed),
                    Ok(n) => Ok(NetbufChain::single(&buf[..n])),
                    Err(e) => Err(map_io_err(&e)),
                }
            }
            Transport::Udp(socket, _) => {
                socket.set_read_timeout(state.recv_timeout).ok();
                match socket.recv(&mut buf) {
                    Ok(n) => Ok(NetbufChain::single(&buf[..n])),
                    Err(e) => Err(map_io_err(&e)),
                }
            }
            Transport::TcpListener(_) | Transport::Unbound => Err(StackError::Arg),
        }
    }

    fn close(&self) -> Result<(), StackError> {
        let mut state = self.state.lock().unwrap();
        if let Transport::TcpStream(stream) = &state.transport {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        state.transport = Transport::Unbound;
        Ok(())
    }

    fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.state.lock().unwrap().recv_timeout = timeout;
    }

    fn recv_timeout(&self) -> Option<Duration> {
        self.state.lock().unwrap().recv_timeout
    }

    fn set_send_timeout(&self, _timeout: Option<Duration>) {}

    fn set_nonblocking(&self, on: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::replace(&mut state.nonblocking, on)
    }

    fn set_reuse_addr(&self, _on: bool) {}

    fn set_recv_bufsize(&self, _size: usize) {}

    fn recv_bufsize(&self) -> usize {
        0
    }

    fn local_addr(&self) -> Result<SocketAddr, StackError> {
        let state = self.state.lock().unwrap();
        match &state.transport {
            Transport::TcpListener(l) => l.local_addr().map_err(|_| StackError::Val),
            Transport::TcpStream(s) => s.local_addr().map_err(|_| StackError::Val),
            Transport::Udp(s, _) => s.local_addr().map_err(|_| StackError::Val),
            Transport::Unbound => Err(StackError::Arg),
        }
    }

    fn peer_addr(&self) -> Result<SocketAddr, StackError> {
        let state = self.state.lock().unwrap();
        match &state.transport {
            Transport::TcpStream(s) => s.peer_addr().map_err(|_| StackError::Val),
            Transport::Udp(_, peer) => peer.lock().unwrap().ok_or(StackError::Arg),
            Transport::TcpListener(_) | Transport::Unbound => Err(StackError::Arg),
        }
    }

    fn recv_avail(&self) -> usize {
        1
    }
}
