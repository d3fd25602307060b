//! Configuration for the engine, the notifier and the demo binary.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for quick start

use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::Value;

use crate::error::NotifierError;

/// Channel every engine listens to in addition to its declared topics.
pub const ERROR_CHANNEL: &str = "error";

/// Per-message payload limit of a LISTEN/NOTIFY broker.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 8000;

/// What `unsubscribe` does to the channel-level registration.
#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UnlistenPolicy {
    /// Always unlisten the channel, even if other subscriptions share it.
    #[default]
    Channel,
    /// Unlisten only once no subscription references the channel and it is
    /// not part of the interest set.
    LastSubscriber,
}

/// Output format of the log lines.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Options for [`PubSub`](crate::engine::PubSub).
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineOptions {
    /// Channels listened to on `connect()`.
    pub topics: Vec<String>,
    pub unlisten_policy: UnlistenPolicy,
    /// Buffer size of the engine event stream.
    pub event_capacity: usize,
}

impl EngineOptions {
    /// The interest set: declared topics followed by the error channel.
    pub fn interest_set(&self) -> Vec<String> {
        let mut channels = self.topics.clone();
        channels.push(ERROR_CHANNEL.to_string());
        channels
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            unlisten_policy: UnlistenPolicy::default(),
            event_capacity: 256,
        }
    }
}

/// Turns notification text into a payload.
pub type ParseFn = fn(&str) -> Result<Value, NotifierError>;

/// Turns a payload into notification text.
pub type SerializeFn = fn(&Value) -> Result<String, NotifierError>;

fn parse_json(text: &str) -> Result<Value, NotifierError> {
    serde_json::from_str(text).map_err(|e| NotifierError::Parse(e.to_string()))
}

fn serialize_json(value: &Value) -> Result<String, NotifierError> {
    serde_json::to_string(value).map_err(|e| NotifierError::Serialize(e.to_string()))
}

/// Options passed through to the notifier transport.
#[derive(Debug, Clone)]
pub struct NotifierOptions {
    /// Prefer a native driver binding where the transport has one.
    pub native: bool,
    /// Interval of connection health checks; `None` disables them.
    pub paranoid_checking: Option<Duration>,
    /// Delay between reconnection attempts.
    pub retry_interval: Duration,
    /// Maximum reconnection attempts; `None` retries until `retry_timeout`.
    pub retry_limit: Option<u32>,
    /// Total time budget for reconnecting.
    pub retry_timeout: Duration,
    pub max_payload_bytes: usize,
    pub parse: ParseFn,
    pub serialize: SerializeFn,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            native: false,
            paranoid_checking: None,
            retry_interval: Duration::from_millis(500),
            retry_limit: None,
            retry_timeout: Duration::from_millis(3000),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            parse: parse_json,
            serialize: serialize_json,
        }
    }
}

/// pgbridge: push notifications bridged to pull-style subscriptions.
#[derive(Parser, Debug, Clone)]
#[command(name = "pgbridge")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Channels to listen to on connect (comma separated)
    #[arg(short, long, env = "PGBRIDGE_TOPICS", value_delimiter = ',')]
    pub topics: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Log line format
    #[arg(long, env = "PGBRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// What unsubscribe does to the shared channel registration
    #[arg(long, env = "PGBRIDGE_UNLISTEN_POLICY", value_enum, default_value_t = UnlistenPolicy::Channel)]
    pub unlisten_policy: UnlistenPolicy,

    /// Size of the engine event channel
    #[arg(long, env = "PGBRIDGE_EVENT_CAPACITY", default_value_t = 256)]
    pub event_capacity: usize,

    /// Maximum serialized payload size in bytes
    #[arg(long, env = "PGBRIDGE_MAX_PAYLOAD_BYTES", default_value_t = DEFAULT_MAX_PAYLOAD_BYTES)]
    pub max_payload_bytes: usize,

    /// Delay between reconnection attempts in milliseconds
    #[arg(long, env = "PGBRIDGE_RETRY_INTERVAL_MS", default_value_t = 500)]
    pub retry_interval_ms: u64,

    /// Maximum reconnection attempts (unlimited if unset)
    #[arg(long, env = "PGBRIDGE_RETRY_LIMIT")]
    pub retry_limit: Option<u32>,

    /// Total reconnection budget in milliseconds
    #[arg(long, env = "PGBRIDGE_RETRY_TIMEOUT_MS", default_value_t = 3000)]
    pub retry_timeout_ms: u64,

    /// Connection health check interval in milliseconds (disabled if unset)
    #[arg(long, env = "PGBRIDGE_PARANOID_CHECKING_MS")]
    pub paranoid_checking_ms: Option<u64>,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            topics: self.topics.clone(),
            unlisten_policy: self.unlisten_policy,
            event_capacity: self.event_capacity,
        }
    }

    pub fn notifier_options(&self) -> NotifierOptions {
        NotifierOptions {
            paranoid_checking: self.paranoid_checking_ms.map(Duration::from_millis),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            retry_limit: self.retry_limit,
            retry_timeout: Duration::from_millis(self.retry_timeout_ms),
            max_payload_bytes: self.max_payload_bytes,
            ..NotifierOptions::default()
        }
    }
}
