//! Process lifecycle: one-time initialisation and teardown of the pieces a
//! host embeds together — the TLS library, the embedded TCP/IP stack's
//! worker thread, and the SIGHUP cancellation handler a [`SlipLink`] needs
//! before its reader/writer threads can safely block.
//!
//! Everything else lives in the sub-crates re-exported below; this crate's
//! own surface is deliberately thin.

use std::sync::{Arc, Once};

use bridge_net::StackRuntime;
use tracing::info;

pub use bridge_host as host;
pub use bridge_link as link;
pub use bridge_net as net;
pub use bridge_queue as queue;
pub use bridge_tls as tls;
pub use bridge_utils as utils;

static STACK_INIT: Once = Once::new();

/// Starts the stack's TCP/IP worker thread exactly once per process, even if
/// called from several host threads concurrently. Idempotent: every call
/// after the first is a no-op.
///
/// TLS library initialisation is not driven from here: each
/// [`tls::TlsStateMachine`] constructor already performs its own one-time
/// `openssl::init()` the first time a session is built, since a process may
/// run for a long time before its first TLS connection and there is no
/// benefit to forcing that cost earlier.
pub fn init_stack(runtime: &Arc<dyn StackRuntime>) {
    STACK_INIT.call_once(|| {
        info!("starting stack tcp/ip thread");
        runtime.tcpip_init();
    });
}

/// Closes every active TCP connection on the stack's own thread. Intended
/// for abrupt, whole-process teardown (the host is shutting down and cannot
/// wait for individual `Socket::close` calls to drain).
pub fn shutdown_stack(runtime: &Arc<dyn StackRuntime>) {
    info!("resetting all active tcp connections for shutdown");
    net::reset_all_active_tcp(runtime);
}
