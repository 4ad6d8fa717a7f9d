mod pipe;
mod state_machine;

pub use openssl::ssl::SslContext;
pub use state_machine::{TlsSetupError, TlsStateMachine};
