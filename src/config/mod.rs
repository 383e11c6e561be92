//! Typed configuration loaded from a TOML file.
//!
//! Every key has a default, so an empty file is a valid configuration.
//! Credentials and the telemetry endpoint can be overridden from the
//! environment. Sensitive values are wrapped in `secrecy::SecretString`
//! to prevent log leaks.

pub mod secrets;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::codec::{CodecLimits, DEFAULT_MAX_FILE_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::error::{Error, Result};
use crate::model::QoS;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub tls: TlsConfig,
    pub will: Option<WillConfig>,
    pub topics: TopicsConfig,
    /// Named secondary topics, e.g. `[custom_topics.alerts]`.
    pub custom_topics: HashMap<String, TopicOptions>,
    pub jobs: JobsConfig,
    pub codec: CodecConfig,
    pub telemetry: TelemetrySettings,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    #[serde(deserialize_with = "optional_secret")]
    pub password: Option<SecretString>,
    /// Broker URI. Derived from host and port when unset.
    pub uri: Option<String>,
    /// Seconds between keep-alive pings. 0 leaves the client default.
    pub keep_alive: u64,
    pub auto_reconnect: bool,
    /// Seconds to wait for the broker's CONNACK. Unset means 30.
    pub connect_timeout: Option<u64>,
    /// Consecutive connection failures tolerated before giving up.
    pub reconnect_retries: u32,
    /// Ceiling in seconds for the reconnect backoff.
    pub reconnect_max_interval: u64,
    pub clean_session: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "event-listener".to_string(),
            username: None,
            password: None,
            uri: None,
            keep_alive: 10,
            auto_reconnect: true,
            connect_timeout: None,
            reconnect_retries: 2,
            reconnect_max_interval: 10,
            clean_session: true,
        }
    }
}

impl ConnectionConfig {
    pub fn uri(&self) -> String {
        self.uri
            .clone()
            .unwrap_or_else(|| format!("mqtt://{}:{}", self.host, self.port))
    }

    /// Host and port to dial. Taken from `uri` when set, otherwise from
    /// `host` and `port`.
    pub fn broker_address(&self) -> Result<(String, u16)> {
        let Some(uri) = &self.uri else {
            return Ok((self.host.clone(), self.port));
        };
        let bad = |what: &str| Error::Config(format!("{what} in broker uri {uri}"));

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| bad("missing scheme"))?;
        let default_port = match scheme {
            "mqtt" | "tcp" => 1883,
            "mqtts" | "ssl" => 8883,
            _ => return Err(bad("unsupported scheme")),
        };
        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| bad("bad port"))?),
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(bad("missing host"));
        }
        Ok((host.to_string(), port))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub cafile: Option<PathBuf>,
    pub capath: Option<PathBuf>,
    pub cadata: Option<String>,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.cafile.is_some() || self.capath.is_some() || self.cadata.is_some()
    }
}

/// Last-will message registered with the broker on connect.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WillConfig {
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopicsConfig {
    /// The topic the engine subscribes to.
    pub main: String,
    pub qos: QoS,
    /// Retain flag for failure reports.
    pub retain: bool,
    /// Where failure reports are published.
    pub error: String,
    /// Fallback for result envelopes that carry no topic.
    pub results: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            main: "test".to_string(),
            qos: QoS::AtMostOnce,
            retain: false,
            error: "test/error".to_string(),
            results: "test/results".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopicOptions {
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    pub max_in_memory: usize,
    /// Terminal jobs older than this are evicted.
    pub retention_secs: u64,
    /// Payload field holding the job id.
    pub id_field: String,
    pub allow_id_generation: bool,
    pub duplicate_action: DuplicateAction,
    /// How often the processing loop runs eviction.
    pub eviction_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_in_memory: 5000,
            retention_secs: 259_200,
            id_field: "job_id".to_string(),
            allow_id_generation: false,
            duplicate_action: DuplicateAction::Skip,
            eviction_interval_secs: 300,
        }
    }
}

impl JobsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodecConfig {
    pub max_payload_bytes: usize,
    pub max_file_bytes: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl CodecConfig {
    pub fn limits(&self) -> CodecLimits {
        CodecLimits {
            max_payload_bytes: self.max_payload_bytes,
            max_file_bytes: self.max_file_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySettings {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Duplicate action
// ---------------------------------------------------------------------------

/// What to do when a message resolves to an id that is already tracked.
///
/// Parsed once at load time. Unrecognized strings are kept as `Unknown` and
/// treated like `Skip`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum DuplicateAction {
    Skip,
    Error,
    Reprocess,
    Unknown(String),
}

impl From<String> for DuplicateAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "skip" => DuplicateAction::Skip,
            "error" => DuplicateAction::Error,
            "reprocess" => DuplicateAction::Reprocess,
            _ => DuplicateAction::Unknown(s),
        }
    }
}

impl From<&str> for DuplicateAction {
    fn from(s: &str) -> Self {
        DuplicateAction::from(s.to_string())
    }
}

impl std::fmt::Display for DuplicateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateAction::Skip => write!(f, "skip"),
            DuplicateAction::Error => write!(f, "error"),
            DuplicateAction::Reprocess => write!(f, "reprocess"),
            DuplicateAction::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load a config file and apply environment overrides.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse a config from TOML text. Does not consult the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Override credentials and telemetry settings from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(username) = std::env::var("JOBCAST_USERNAME") {
            self.connection.username = Some(username);
        }
        if let Ok(password) = std::env::var("JOBCAST_PASSWORD") {
            self.connection.password = Some(SecretString::from(password));
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.telemetry.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.jobs.id_field.is_empty() {
            return Err(Error::Config("jobs.id_field must not be empty".to_string()));
        }
        if self.topics.main.is_empty() {
            return Err(Error::Config("topics.main must not be empty".to_string()));
        }
        self.connection.broker_address()?;
        if self.will.as_ref().is_some_and(|will| will.topic.is_empty()) {
            return Err(Error::Config("will.topic must not be empty".to_string()));
        }
        if let DuplicateAction::Unknown(raw) = &self.jobs.duplicate_action {
            warn!(
                duplicate_action = %raw,
                "unknown duplicate_action, duplicates will be skipped"
            );
        }
        Ok(())
    }

    /// Options for a named custom topic, if configured.
    pub fn custom_topic(&self, name: &str) -> Option<TopicOptions> {
        self.custom_topics.get(name).copied()
    }
}

fn optional_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}
