use blinkwatch_pipeline::{KafkaConfig, SecurityProtocol};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for a storage consumer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Which consumer to run
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// The three consumer variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    Frame,
    Blink,
    Session,
}

impl ConsumerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerKind::Frame => "frame",
            ConsumerKind::Blink => "blink",
            ConsumerKind::Session => "session",
        }
    }

    /// Consumer group used when none is configured
    pub fn default_group_id(&self) -> String {
        format!("{}-consumer-group", self.as_str())
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frame" => Ok(ConsumerKind::Frame),
            "blink" => Ok(ConsumerKind::Blink),
            "session" => Ok(ConsumerKind::Session),
            other => anyhow::bail!(
                "unknown consumer type '{}' (expected frame, blink or session)",
                other
            ),
        }
    }
}

/// Consumer selection
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    /// Variant to run; `CONSUMER_TYPE` or the first CLI argument also select it
    pub kind: Option<ConsumerKind>,
    /// Overrides the per-kind default group
    pub group_id: Option<String>,
    /// Event-time seconds after which a quiet session's last blink is forgotten
    #[serde(default = "default_blink_idle_horizon_secs")]
    pub blink_idle_horizon_secs: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            kind: None,
            group_id: None,
            blink_idle_horizon_secs: default_blink_idle_horizon_secs(),
        }
    }
}

// Default value functions
fn default_service_name() -> String {
    "storage-consumer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_blink_idle_horizon_secs() -> u64 {
    3600
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        // KAFKA_* variables seed the kafka section
        let env_kafka = KafkaConfig::from_env()?;

        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", default_metrics_port())?
            .set_default("kafka.bootstrap_servers", env_kafka.bootstrap_servers.clone())?
            // Add config file if present
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/blinkwatch/storage").required(false))
            // Override with environment variables
            // STORAGE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: Self = config.try_deserialize()?;

        if matches!(loaded.kafka.security_protocol, SecurityProtocol::Plaintext) {
            loaded.kafka.security_protocol = env_kafka.security_protocol;
        }
        if loaded.kafka.sasl.username.is_none() {
            loaded.kafka.sasl = env_kafka.sasl;
        }
        if loaded.kafka.ssl.ca_location.is_none() {
            loaded.kafka.ssl.ca_location = env_kafka.ssl.ca_location;
        }
        loaded.kafka.validate()?;

        Ok(loaded)
    }

    /// Pick the consumer kind: CLI argument, then `CONSUMER_TYPE`, then config
    pub fn resolve_kind(&self, arg: Option<&str>) -> anyhow::Result<ConsumerKind> {
        if let Some(arg) = arg {
            return arg.parse();
        }
        if let Ok(env) = std::env::var("CONSUMER_TYPE") {
            return env.parse();
        }
        self.consumer.kind.ok_or_else(|| {
            anyhow::anyhow!("no consumer type given (argument, CONSUMER_TYPE or consumer.kind)")
        })
    }

    /// Kafka settings for `kind`, with its consumer group applied
    pub fn kafka_for(&self, kind: ConsumerKind) -> KafkaConfig {
        let mut kafka = self.kafka.clone();
        kafka.client_id = format!("blinkwatch-{}-consumer", kind);
        kafka.consumer.group_id = self
            .consumer
            .group_id
            .clone()
            .unwrap_or_else(|| kind.default_group_id());
        kafka
    }

    /// How long a session may go without blinks before its interval
    /// bookkeeping is dropped
    pub fn blink_idle_horizon(&self) -> Duration {
        Duration::from_secs(self.consumer.blink_idle_horizon_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}
