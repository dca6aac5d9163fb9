//! Link configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! The config file is read from `$OBSQURA_LINK_CONFIG` when set; otherwise
//! defaults apply. Individual fields can be overridden with
//! `OBSQURA_LINK__<SECTION>__<FIELD>` variables, e.g.
//! `OBSQURA_LINK__TIMING__PACING_MS=80`.
//!
//! Wire sizes are not configurable; see [`crate::core`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    ACK_RETRY_DELAY, BUSY_RETRY_DELAY, CONNECT_WATCHDOG, DEFAULT_RELAY_DIRECTION,
    DEFAULT_RELAY_SESSION, DISCOVERY_WATCHDOG, KEY_REQUEST_PAYLOAD, MAX_FRAGMENT_ATTEMPTS,
    MAX_PUBLIC_KEY_SIZE, MAX_RECONNECT_ATTEMPTS, MIN_PUBLIC_KEY_SIZE, PACING_DELAY,
    RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY, RELAY_RETRY_DELAY, SUBMIT_RETRY_DELAY,
};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "OBSQURA_LINK_CONFIG";

/// Prefix of per-field override variables.
pub const ENV_PREFIX: &str = "OBSQURA_LINK__";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Delivery and connection timers.
    pub timing: TimingConfig,
    /// Retry caps.
    pub retry: RetryConfig,
    /// Handshake parameters.
    pub handshake: HandshakeConfig,
    /// Relay transport parameters.
    pub relay: RelayConfig,
    /// Crypto parameters.
    pub crypto: CryptoConfig,
}

/// Timer values, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between an acknowledged fragment and the next.
    pub pacing_ms: u64,
    /// Re-attempt delay while a direct write is in flight.
    pub busy_retry_ms: u64,
    /// Retry delay after a refused direct write.
    pub submit_retry_ms: u64,
    /// Retry delay after a failed direct write completion.
    pub ack_retry_ms: u64,
    /// Retry delay after a refused relay send.
    pub relay_retry_ms: u64,
    /// Watchdog for the link to come up.
    pub connect_watchdog_ms: u64,
    /// Watchdog for capability discovery.
    pub discovery_watchdog_ms: u64,
    /// First reconnect delay.
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling.
    pub reconnect_max_ms: u64,
}

/// Retry caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per fragment before the transfer is abandoned.
    pub max_fragment_attempts: u8,
    /// Reconnect attempts before the connection is declared failed.
    pub max_reconnect_attempts: u32,
}

/// Handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Smallest accepted public key length.
    pub min_public_key_len: usize,
    /// Largest accepted public key length.
    pub max_public_key_len: usize,
    /// Payload of the key request message.
    pub request_payload: String,
}

/// Relay transport parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Owner id for keys negotiated through the relay.
    pub session: String,
    /// Direction tag on outbound envelopes.
    pub direction: String,
}

/// Crypto parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// AEAD used for secure messages.
    pub cipher_suite: CipherSuite,
}

/// AEAD cipher suite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherSuite {
    /// AES-256-GCM, what the peripheral firmware speaks.
    #[default]
    Aes256Gcm,
    /// ChaCha20-Poly1305.
    ChaCha20Poly1305,
}

impl CipherSuite {
    /// Config-file name of the suite.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Parse a config-file name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes-256-gcm" => Some(Self::Aes256Gcm),
            "chacha20-poly1305" => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pacing_ms: millis(PACING_DELAY),
            busy_retry_ms: millis(BUSY_RETRY_DELAY),
            submit_retry_ms: millis(SUBMIT_RETRY_DELAY),
            ack_retry_ms: millis(ACK_RETRY_DELAY),
            relay_retry_ms: millis(RELAY_RETRY_DELAY),
            connect_watchdog_ms: millis(CONNECT_WATCHDOG),
            discovery_watchdog_ms: millis(DISCOVERY_WATCHDOG),
            reconnect_base_ms: millis(RECONNECT_BASE_DELAY),
            reconnect_max_ms: millis(RECONNECT_MAX_DELAY),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_fragment_attempts: MAX_FRAGMENT_ATTEMPTS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            min_public_key_len: MIN_PUBLIC_KEY_SIZE,
            max_public_key_len: MAX_PUBLIC_KEY_SIZE,
            request_payload: String::from_utf8_lossy(KEY_REQUEST_PAYLOAD).into_owned(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session: DEFAULT_RELAY_SESSION.to_string(),
            direction: DEFAULT_RELAY_DIRECTION.to_string(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl TimingConfig {
    /// Pacing delay.
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Busy re-attempt delay.
    pub fn busy_retry(&self) -> Duration {
        Duration::from_millis(self.busy_retry_ms)
    }

    /// Refused-submission retry delay.
    pub fn submit_retry(&self) -> Duration {
        Duration::from_millis(self.submit_retry_ms)
    }

    /// Failed-completion retry delay.
    pub fn ack_retry(&self) -> Duration {
        Duration::from_millis(self.ack_retry_ms)
    }

    /// Relay reject retry delay.
    pub fn relay_retry(&self) -> Duration {
        Duration::from_millis(self.relay_retry_ms)
    }

    /// Connect watchdog.
    pub fn connect_watchdog(&self) -> Duration {
        Duration::from_millis(self.connect_watchdog_ms)
    }

    /// Discovery watchdog.
    pub fn discovery_watchdog(&self) -> Duration {
        Duration::from_millis(self.discovery_watchdog_ms)
    }

    /// First reconnect delay.
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    /// Reconnect ceiling.
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    /// Config file is not valid TOML for [`LinkConfig`].
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),

    /// Serialization failed.
    #[error("failed to serialize: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    /// Values are individually valid but inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LinkConfig {
    /// Start a builder from defaults.
    pub fn builder() -> LinkConfigBuilder {
        LinkConfigBuilder::new()
    }

    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(PathBuf::from("<str>"), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake.min_public_key_len > self.handshake.max_public_key_len {
            return Err(ConfigError::Invalid(format!(
                "public key window {}..={} is empty",
                self.handshake.min_public_key_len, self.handshake.max_public_key_len
            )));
        }
        if self.retry.max_fragment_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_fragment_attempts must be at least 1".into(),
            ));
        }
        if self.timing.reconnect_base_ms > self.timing.reconnect_max_ms {
            return Err(ConfigError::Invalid(
                "reconnect_base_ms exceeds reconnect_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Apply `OBSQURA_LINK__*` overrides read through `lookup`.
    ///
    /// Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        macro_rules! parsed {
            ($name:literal, $field:expr) => {
                if let Some(v) = var($name).and_then(|v| v.trim().parse().ok()) {
                    $field = v;
                }
            };
        }

        parsed!("TIMING__PACING_MS", self.timing.pacing_ms);
        parsed!("TIMING__BUSY_RETRY_MS", self.timing.busy_retry_ms);
        parsed!("TIMING__SUBMIT_RETRY_MS", self.timing.submit_retry_ms);
        parsed!("TIMING__ACK_RETRY_MS", self.timing.ack_retry_ms);
        parsed!("TIMING__RELAY_RETRY_MS", self.timing.relay_retry_ms);
        parsed!("TIMING__CONNECT_WATCHDOG_MS", self.timing.connect_watchdog_ms);
        parsed!("TIMING__DISCOVERY_WATCHDOG_MS", self.timing.discovery_watchdog_ms);
        parsed!("RETRY__MAX_FRAGMENT_ATTEMPTS", self.retry.max_fragment_attempts);
        parsed!("RETRY__MAX_RECONNECT_ATTEMPTS", self.retry.max_reconnect_attempts);

        if let Some(v) = var("RELAY__SESSION") {
            self.relay.session = v;
        }
        if let Some(suite) = var("CRYPTO__CIPHER_SUITE").and_then(|v| CipherSuite::from_name(v.trim())) {
            self.crypto.cipher_suite = suite;
        }
    }
}

/// Builder for [`LinkConfig`].
#[derive(Debug, Default)]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Create a builder from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pacing delay.
    pub fn pacing(mut self, delay: Duration) -> Self {
        self.config.timing.pacing_ms = millis(delay);
        self
    }

    /// Set the per-fragment attempt cap.
    pub fn max_fragment_attempts(mut self, attempts: u8) -> Self {
        self.config.retry.max_fragment_attempts = attempts;
        self
    }

    /// Set the reconnect attempt cap.
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_reconnect_attempts = attempts;
        self
    }

    /// Set the connect and discovery watchdogs.
    pub fn watchdogs(mut self, connect: Duration, discovery: Duration) -> Self {
        self.config.timing.connect_watchdog_ms = millis(connect);
        self.config.timing.discovery_watchdog_ms = millis(discovery);
        self
    }

    /// Set the reconnect backoff base and ceiling.
    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.timing.reconnect_base_ms = millis(base);
        self.config.timing.reconnect_max_ms = millis(max);
        self
    }

    /// Set the accepted public key length window.
    pub fn public_key_window(mut self, min: usize, max: usize) -> Self {
        self.config.handshake.min_public_key_len = min;
        self.config.handshake.max_public_key_len = max;
        self
    }

    /// Set the relay session owner id.
    pub fn relay_session(mut self, session: impl Into<String>) -> Self {
        self.config.relay.session = session.into();
        self
    }

    /// Set the cipher suite.
    pub fn cipher_suite(mut self, suite: CipherSuite) -> Self {
        self.config.crypto.cipher_suite = suite;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<LinkConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
