mod assert;
mod config;
pub mod directories;
mod error;
mod logging;

pub use config::{AcceptConfig, BridgeConfig, HandshakeConfig, SignalConfig, SlipConfig, WatchdogConfig};
pub use error::{BridgeError, NativeError, SslErrorCode, StackError};
pub use logging::init_tracing;
