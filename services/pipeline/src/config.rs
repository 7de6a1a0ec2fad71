//! Configuration for the Blinkwatch pipeline.
//!
//! [`KafkaConfig`] covers broker connectivity (SSL/SASL), producer and consumer
//! tuning and topic names. [`PipelineConfig`] adds blink detection parameters
//! and logging, layered from files and `PIPELINE__*` environment variables.

use crate::blink::BlinkConfig;
use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
    OAuthBearer,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::OAuthBearer => "OAUTHBEARER",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
    /// Private key password
    pub key_password: Option<String>,
    /// Enable certificate verification
    #[serde(default = "default_true")]
    pub enable_verification: bool,
}

fn default_true() -> bool {
    true
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
    /// OAuth bearer token (for OAuthBearer mechanism)
    pub oauth_token: Option<String>,
}

/// Retry and reliability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Number of retries for failed operations
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Retry backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Enable idempotent producer
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    /// Required acknowledgments: 0, 1, or -1 (all)
    #[serde(default = "default_acks")]
    pub acks: String,
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_acks() -> String {
    "all".to_string()
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            enable_idempotence: true,
            acks: default_acks(),
        }
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Batch size in bytes
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Linger time in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    /// Maximum in-flight requests per connection
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: u32,
}

fn default_batch_size() -> usize {
    16384
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_max_in_flight() -> u32 {
    5
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            compression_type: default_compression(),
            max_in_flight_requests: default_max_in_flight(),
        }
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Enable auto commit
    #[serde(default)]
    pub enable_auto_commit: bool,
    /// Auto commit interval in milliseconds
    #[serde(default = "default_auto_commit_interval")]
    pub auto_commit_interval_ms: u64,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "blinkwatch".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_auto_commit_interval() -> u64 {
    5000
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_heartbeat_interval() -> u64 {
    3000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            enable_auto_commit: false,
            auto_commit_interval_ms: default_auto_commit_interval(),
            session_timeout_ms: default_session_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Topic names for the three event streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Session lifecycle events, keyed by user ID
    #[serde(default = "default_sessions_topic")]
    pub sessions: String,
    /// Per-frame EAR samples, keyed by session ID
    #[serde(default = "default_frames_topic")]
    pub frames: String,
    /// Completed blinks, keyed by session ID
    #[serde(default = "default_blinks_topic")]
    pub blinks: String,
}

fn default_sessions_topic() -> String {
    "session_events".to_string()
}

fn default_frames_topic() -> String {
    "frame_data".to_string()
}

fn default_blinks_topic() -> String {
    "blink_event".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            sessions: default_sessions_topic(),
            frames: default_frames_topic(),
            blinks: default_blinks_topic(),
        }
    }
}

/// Kafka connection and client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// SSL configuration
    #[serde(default)]
    pub ssl: SslConfig,
    /// SASL configuration
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Reliability settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    /// Producer settings
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Topic configuration
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional Kafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "blinkwatch-pipeline".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            reliability: ReliabilityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // KAFKA_SERVER/KAFKA_PORT are accepted for older deployments
        let bootstrap_servers = std::env::var("KAFKA_BOOTSTRAP_SERVERS").unwrap_or_else(|_| {
            let host = std::env::var("KAFKA_SERVER").unwrap_or_else(|_| "localhost".to_string());
            let port = std::env::var("KAFKA_PORT").unwrap_or_else(|_| "9092".to_string());
            format!("{}:{}", host, port)
        });

        let mut config = Self::new(bootstrap_servers);

        // Load optional environment variables
        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }

        if let Ok(group_id) = std::env::var("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }

        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            config.security_protocol = match protocol.to_lowercase().as_str() {
                "ssl" => SecurityProtocol::Ssl,
                "sasl_plaintext" => SecurityProtocol::SaslPlaintext,
                "sasl_ssl" => SecurityProtocol::SaslSsl,
                _ => SecurityProtocol::Plaintext,
            };
        }

        // Load SASL credentials
        if let Ok(username) = std::env::var("KAFKA_SASL_USERNAME") {
            config.sasl.username = Some(username);
        }
        if let Ok(password) = std::env::var("KAFKA_SASL_PASSWORD") {
            config.sasl.password = Some(password);
        }

        // Load SSL paths
        if let Ok(ca) = std::env::var("KAFKA_SSL_CA_LOCATION") {
            config.ssl.ca_location = Some(ca);
        }

        Ok(config)
    }

    /// Build a base rdkafka ClientConfig from this configuration
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        // SSL configuration
        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }
        if let Some(ref password) = self.ssl.key_password {
            config.set("ssl.key.password", password);
        }
        if !self.ssl.enable_verification {
            config.set("enable.ssl.certificate.verification", "false");
        }

        // SASL configuration
        config.set("sasl.mechanism", self.sasl.mechanism.as_str());
        if let Some(ref username) = self.sasl.username {
            config.set("sasl.username", username);
        }
        if let Some(ref password) = self.sasl.password {
            config.set("sasl.password", password);
        }

        // Extra properties
        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        // Reliability settings
        config.set("retries", self.reliability.retries.to_string());
        config.set("retry.backoff.ms", self.reliability.retry_backoff_ms.to_string());
        config.set("request.timeout.ms", self.reliability.request_timeout_ms.to_string());
        config.set("acks", &self.reliability.acks);

        if self.reliability.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        // Producer settings
        config.set("batch.size", self.producer.batch_size.to_string());
        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set("compression.type", &self.producer.compression_type);
        config.set(
            "max.in.flight.requests.per.connection",
            self.producer.max_in_flight_requests.to_string(),
        );

        config
    }

    /// Build a consumer ClientConfig
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        // Consumer settings
        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set(
            "enable.auto.commit",
            self.consumer.enable_auto_commit.to_string(),
        );
        config.set(
            "auto.commit.interval.ms",
            self.consumer.auto_commit_interval_ms.to_string(),
        );
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "heartbeat.interval.ms",
            self.consumer.heartbeat_interval_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "bootstrap_servers".to_string(),
            ));
        }

        for (key, topic) in [
            ("topics.sessions", &self.topics.sessions),
            ("topics.frames", &self.topics.frames),
            ("topics.blinks", &self.topics.blinks),
        ] {
            if topic.is_empty() {
                return Err(ConfigError::MissingRequired(key.to_string()));
            }
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "consumer.group_id".to_string(),
            ));
        }

        // Validate SASL config if using SASL
        match self.security_protocol {
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl => {
                if self.sasl.username.is_none() {
                    return Err(ConfigError::MissingRequired(
                        "sasl.username (required for SASL)".to_string(),
                    ));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Logging settings for the pipeline binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Top-level configuration for the session-side pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub blink: BlinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load from `config/pipeline`, `/etc/blinkwatch/pipeline` and
    /// `PIPELINE__*` environment variables, in increasing precedence.
    ///
    /// `PIPELINE__KAFKA__BOOTSTRAP_SERVERS` -> `kafka.bootstrap_servers`
    pub fn load() -> Result<Self, ConfigError> {
        let kafka = KafkaConfig::from_env()?;

        let mut loaded: Self = config::Config::builder()
            .set_default("kafka.bootstrap_servers", kafka.bootstrap_servers.clone())
            .and_then(|b| b.set_default("kafka.client_id", kafka.client_id.clone()))
            .and_then(|b| b.set_default("kafka.consumer.group_id", kafka.consumer.group_id.clone()))
            .map_err(|e| ConfigError::LoadError(e.to_string()))?
            .add_source(config::File::with_name("config/pipeline").required(false))
            .add_source(config::File::with_name("/etc/blinkwatch/pipeline").required(false))
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        // KAFKA_* security variables fill in whatever the layered sources left unset
        if matches!(loaded.kafka.security_protocol, SecurityProtocol::Plaintext) {
            loaded.kafka.security_protocol = kafka.security_protocol;
        }
        if loaded.kafka.sasl.username.is_none() {
            loaded.kafka.sasl = kafka.sasl;
        }
        if loaded.kafka.ssl.ca_location.is_none() {
            loaded.kafka.ssl.ca_location = kafka.ssl.ca_location;
        }

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;
        self.blink.validate()
    }
}
