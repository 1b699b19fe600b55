//! Configuration for the notifier.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [storage]
//! host = "localhost"
//! port = 5432
//! database = "userv"
//! username = "userv"
//! password = "${POSTGRES_PASSWORD}"
//!
//! [kafka]
//! brokers = ["localhost:9092"]
//! topic = "postgres.public.users"
//!
//! [notifier]
//! channel = "user_changes"
//! rate_limit = 500
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use rdkafka::ClientConfig;
use regex::Regex;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;
use tracing::{debug, info};

use crate::{DEFAULT_CHANNEL, DEFAULT_MESSAGE_KEY, DEFAULT_TOPIC};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifierConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub notifier: DispatchConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Storage (PostgreSQL) connection parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_host")]
    pub host: String,

    #[serde(default = "default_storage_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_database")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// libpq-style TLS mode; "disable" matches the legacy deployment.
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: default_storage_host(),
            port: default_storage_port(),
            database: default_database(),
            username: default_database(),
            password: String::new(),
            ssl_mode: default_ssl_mode(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_storage_host() -> String {
    "localhost".to_string()
}

fn default_storage_port() -> u16 {
    5432
}

fn default_database() -> String {
    "userv".to_string()
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

const SSL_MODES: &[&str] = &["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];

impl StorageConfig {
    /// Build connect options for the listener connection.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(&self.password)
            .ssl_mode(self.ssl_mode.parse::<PgSslMode>()?)
            .application_name("user-notifier"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Kafka producer parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Key attached to every message when `key_field` is unset.
    #[serde(default = "default_message_key")]
    pub message_key: String,

    /// Optional field of the JSON payload to derive the message key from,
    /// e.g. the row id. Falls back to `message_key` per message when the
    /// payload lacks the field.
    #[serde(default)]
    pub key_field: Option<String>,

    /// Maximum time a message may sit in the producer buffer before the
    /// batch is flushed (`linger.ms`).
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Batch size threshold in bytes (`batch.size`).
    #[serde(default = "default_batch_size")]
    pub batch_size_bytes: u64,

    /// Batch size threshold in messages (`batch.num.messages`).
    #[serde(default = "default_batch_size")]
    pub batch_max_messages: u64,

    /// Upper bound on waiting for a delivery report (`message.timeout.ms`).
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic: default_topic(),
            message_key: default_message_key(),
            key_field: None,
            batch_timeout_ms: default_batch_timeout_ms(),
            batch_size_bytes: default_batch_size(),
            batch_max_messages: default_batch_size(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_message_key() -> String {
    DEFAULT_MESSAGE_KEY.to_string()
}

fn default_batch_timeout_ms() -> u64 {
    100
}

fn default_batch_size() -> u64 {
    1_000_000
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

impl KafkaConfig {
    /// Build the rdkafka producer configuration.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("linger.ms", self.batch_timeout_ms.to_string())
            .set("batch.size", self.batch_size_bytes.to_string())
            .set("batch.num.messages", self.batch_max_messages.to_string())
            .set("message.timeout.ms", self.delivery_timeout_ms.to_string());
        config
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Dispatch-loop parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Notification channel to LISTEN on.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Maximum number of concurrently in-flight publishes.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,

    /// Lower bound for the listener's reconnect backoff.
    #[serde(default = "default_min_reconnect_secs")]
    pub min_reconnect_interval_secs: u64,

    /// Upper bound for the listener's reconnect backoff.
    #[serde(default = "default_max_reconnect_secs")]
    pub max_reconnect_interval_secs: u64,

    /// How long shutdown waits for in-flight publishes before abandoning
    /// them. Zero abandons immediately.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            rate_limit: default_rate_limit(),
            min_reconnect_interval_secs: default_min_reconnect_secs(),
            max_reconnect_interval_secs: default_max_reconnect_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn default_rate_limit() -> usize {
    500
}

fn default_min_reconnect_secs() -> u64 {
    5
}

fn default_max_reconnect_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl DispatchConfig {
    pub fn min_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.min_reconnect_interval_secs)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Tracing/OpenTelemetry parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP collector endpoint; spans are exported only when set.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
        }
    }
}

fn default_service_name() -> String {
    "user-notifier".to_string()
}

impl NotifierConfig {
    /// Load configuration from the default path or the `NOTIFIER_CONFIG`
    /// env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("NOTIFIER_CONFIG").unwrap_or_else(|_| "config/notifier.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "config file not found, using defaults"
            );
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        info!(path = %path.display(), "loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("parsing TOML configuration");
        let config: NotifierConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            channel = %config.notifier.channel,
            topic = %config.kafka.topic,
            rate_limit = config.notifier.rate_limit,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.brokers.is_empty() {
            return Err(ConfigError::ValidationError(
                "kafka.brokers must list at least one broker".to_string(),
            ));
        }

        if self.kafka.topic.is_empty() {
            return Err(ConfigError::ValidationError(
                "kafka.topic must not be empty".to_string(),
            ));
        }

        if let Some(field) = &self.kafka.key_field {
            if field.is_empty() {
                return Err(ConfigError::ValidationError(
                    "kafka.key_field must not be empty when set".to_string(),
                ));
            }
        }

        if self.notifier.channel.is_empty() {
            return Err(ConfigError::ValidationError(
                "notifier.channel must not be empty".to_string(),
            ));
        }

        if self.notifier.rate_limit == 0 {
            return Err(ConfigError::ValidationError(
                "notifier.rate_limit must be > 0".to_string(),
            ));
        }

        if self.notifier.min_reconnect_interval_secs > self.notifier.max_reconnect_interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "notifier.min_reconnect_interval_secs ({}) exceeds max ({})",
                self.notifier.min_reconnect_interval_secs,
                self.notifier.max_reconnect_interval_secs
            )));
        }

        if !SSL_MODES.contains(&self.storage.ssl_mode.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "storage.ssl_mode '{}' is not one of {:?}",
                self.storage.ssl_mode, SSL_MODES
            )));
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
