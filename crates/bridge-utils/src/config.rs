use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Send back-pressure retry cadence and the accept-loop's internal polling
/// tick. Mirrors the "Configuration flags" table in the design doc.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptConfig {
    /// Internal `netconn` recv-timeout used while polling for `closing` when
    /// the caller passed an unbounded outer timeout.
    #[serde(with = "humantime_serde")]
    pub internal_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ssl_handshake_timeout: Duration,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            internal_timeout: Duration::from_millis(1000),
            ssl_handshake_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    #[serde(with = "humantime_serde")]
    pub connect_poll: Duration,
    #[serde(with = "humantime_serde")]
    pub accept_poll: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { connect_poll: Duration::from_millis(50), accept_poll: Duration::from_millis(10) }
    }
}

/// Tuning for the SIGHUP-based blocking-device cancellation protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub writer_defer_stop: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            writer_defer_stop: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// 0 disables the watchdog.
    pub stuck_threshold_secs: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(1000), stuck_threshold_secs: 0 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipConfig {
    pub stop_on_write_error: bool,
    pub watchdog: WatchdogConfig,
    pub signal: SignalConfig,
}

impl Default for SlipConfig {
    fn default() -> Self {
        Self { stop_on_write_error: true, watchdog: WatchdogConfig::default(), signal: SignalConfig::default() }
    }
}

/// Top-level, file-loadable configuration for a bridge process.
///
/// Loaded with [`BridgeConfig::load`]; any field missing from the TOML file
/// falls back to its documented default, matching the way the upstream
/// accessory client ships built-in defaults and only overrides a handful of
/// knobs per device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub slip: SlipConfig,
    pub accept: AcceptConfig,
    pub handshake: HandshakeConfig,
    pub send_backoff_ms: u64,
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    #[must_use]
    pub fn send_backoff(&self) -> Duration {
        Duration::from_millis(if self.send_backoff_ms == 0 { 10 } else { self.send_backoff_ms })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Lets every timeout/interval field in this module round-trip through TOML
/// as a human-readable string (`"100ms"`, `"5s"`) instead of a bare integer,
/// the way `flux-timing`'s own duration fields parse via `humantime::Duration`.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        text.trim()
            .parse::<humantime::Duration>()
            .map(Into::into)
            .map_err(serde::de::Error::custom)
    }
}
