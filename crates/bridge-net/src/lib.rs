mod aggregate;
mod socket;
mod stack;
#[cfg(test)]
mod testutil;

pub use aggregate::{NetbufAggregator, NetbufChain};
pub use socket::{reset_all_active_tcp, Socket, TlsRole};
pub use stack::{
    EventSink, Netconn, NetconnEvent, Protocol, SlipNetif, SlipOutputSink, StackRuntime, TimerId,
};
