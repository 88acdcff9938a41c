//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "brains": { "port": 4000 },
///   "clients": { "port": 4001, "publicAddr": "bob.local:4001" },
///   "hearing": { "sampleRate": 16000, "dispatchPeriodMs": 500 }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BobSettings {
    /// Worker-facing listener.
    pub brains: BrainsSettings,
    /// Client-facing listener.
    pub clients: ClientsSettings,
    /// Keepalive and queueing shared by both sockets.
    pub websocket: WebSocketSettings,
    /// Directory holding front-end resources. Reported, not served.
    pub resources_directory: String,
    /// Continuous-sampling ability.
    pub hearing: HearingSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for BobSettings {
    fn default() -> Self {
        Self {
            brains: BrainsSettings::default(),
            clients: ClientsSettings::default(),
            websocket: WebSocketSettings::default(),
            resources_directory: "resources".to_string(),
            hearing: HearingSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl BobSettings {
    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(SettingsError::InvalidValue(msg.into()))
        }

        if self.brains.host.is_empty() {
            return invalid("brains.host must not be empty");
        }
        if self.clients.host.is_empty() {
            return invalid("clients.host must not be empty");
        }
        if self.brains.timeout_ms == 0 {
            return invalid("brains.timeoutMs must be > 0");
        }
        if self.brains.register_timeout_ms == 0 {
            return invalid("brains.registerTimeoutMs must be > 0");
        }
        if self.clients.timeout_ms == 0 {
            return invalid("clients.timeoutMs must be > 0");
        }
        if self.websocket.ping_interval_ms == 0 {
            return invalid("websocket.pingIntervalMs must be > 0");
        }
        if self.websocket.pong_timeout_ms <= self.websocket.ping_interval_ms {
            return invalid("websocket.pongTimeoutMs must exceed websocket.pingIntervalMs");
        }
        if self.websocket.max_send_queue == 0 {
            return invalid("websocket.maxSendQueue must be > 0");
        }
        self.hearing.validate()
    }
}

/// Worker-facing listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrainsSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Upgrade request timeout in milliseconds. Does not bound the session.
    pub timeout_ms: u64,
    /// Time allowed for the `worker.register` frame, in milliseconds.
    pub register_timeout_ms: u64,
}

impl Default for BrainsSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            timeout_ms: 5_000,
            register_timeout_ms: 5_000,
        }
    }
}

impl BrainsSettings {
    /// `host:port` to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Upgrade request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Registration deadline.
    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }
}

/// Client-facing listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientsSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Address advertised to front-ends when it differs from the bind address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_addr: Option<String>,
    /// `/api` request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ClientsSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4001,
            public_addr: None,
            timeout_ms: 5_000,
        }
    }
}

impl ClientsSettings {
    /// `host:port` to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address front-ends should dial.
    pub fn advertised_addr(&self) -> String {
        self.public_addr.clone().unwrap_or_else(|| self.addr())
    }

    /// `/api` request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// WebSocket keepalive settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    /// Interval between pings, in milliseconds.
    pub ping_interval_ms: u64,
    /// Silence after which a peer is considered dead, in milliseconds.
    pub pong_timeout_ms: u64,
    /// Outbound frames buffered per connection before sends are dropped.
    pub max_send_queue: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 54_000,
            pong_timeout_ms: 60_000,
            max_send_queue: 256,
        }
    }
}

impl WebSocketSettings {
    /// Ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Pong deadline.
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

/// Continuous-sampling settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HearingSettings {
    /// Samples per second.
    pub sample_rate: u32,
    /// Length of one dispatched chunk, in milliseconds. One second when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_period_ms: Option<u64>,
    /// Bit depth of each sample.
    pub significant_bits: u32,
    /// Audio level at or below which a chunk counts as silence.
    pub silence_max_audio_level: f64,
}

impl Default for HearingSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            dispatch_period_ms: None,
            significant_bits: 16,
            silence_max_audio_level: 0.0,
        }
    }
}

impl HearingSettings {
    /// Chunk length, if configured.
    pub fn dispatch_period(&self) -> Option<Duration> {
        self.dispatch_period_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SettingsError::InvalidValue(
                "hearing.sampleRate must be > 0".into(),
            ));
        }
        if !(1..=32).contains(&self.significant_bits) {
            return Err(SettingsError::InvalidValue(
                "hearing.significantBits must be between 1 and 32".into(),
            ));
        }
        if let Some(ms) = self.dispatch_period_ms {
            if u64::from(self.sample_rate) * ms < 1_000 {
                return Err(SettingsError::InvalidValue(format!(
                    "hearing.dispatchPeriodMs {ms} yields an empty chunk at {} Hz",
                    self.sample_rate
                )));
            }
        }
        if !self.silence_max_audio_level.is_finite() || self.silence_max_audio_level < 0.0 {
            return Err(SettingsError::InvalidValue(
                "hearing.silenceMaxAudioLevel must be a finite value >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
