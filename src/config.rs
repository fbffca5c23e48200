use crate::kafka::topic_manager::DEFAULT_TOPICS;
use crate::resilience::retry::MAX_BACKOFF;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PRODUCER: &str = "default";

/// Largest jitter factor accepted for retry delays.
pub const MAX_JITTER: f64 = 10.0;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_timeout_ms")]
    pub circuit_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
    /// Send schema validation failures through the retry loop like broker errors.
    #[serde(default)]
    pub retry_schema_errors: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicsConfig {
    /// Topics provisioned on every connect.
    #[serde(default = "default_topics")]
    pub known: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_true")]
    pub idempotent: bool,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: u32,
    #[serde(default)]
    pub transactional_id: Option<String>,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("SENTINEL_BUS")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("topics.known")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a local single-broker cluster.
    pub fn local(brokers: &[&str]) -> Self {
        Self {
            kafka: KafkaConfig {
                brokers: brokers.iter().map(|b| b.to_string()).collect(),
                client_id: default_client_id(),
                ssl: false,
                sasl: None,
                replication_factor: default_replication_factor(),
                connection_timeout_ms: default_connection_timeout_ms(),
                request_timeout_ms: default_request_timeout_ms(),
            },
            resilience: ResilienceConfig::default(),
            topics: TopicsConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.kafka.validate()?;

        if self.resilience.failure_threshold == 0 {
            return Err(Error::Config(
                "resilience.failure_threshold must be at least 1".to_string(),
            ));
        }
        let (jitter_min, jitter_max) = (self.resilience.jitter_min, self.resilience.jitter_max);
        if !jitter_min.is_finite()
            || !jitter_max.is_finite()
            || jitter_min < 0.0
            || jitter_min > jitter_max
            || jitter_max > MAX_JITTER
        {
            return Err(Error::Config(format!(
                "invalid jitter range [{}, {}], bounds must lie within [0, {}]",
                jitter_min, jitter_max, MAX_JITTER
            )));
        }
        if self.resilience.base_delay() > MAX_BACKOFF {
            return Err(Error::Config(format!(
                "resilience.base_delay_ms must not exceed {}",
                MAX_BACKOFF.as_millis()
            )));
        }
        if self.consumer.max_batch_size == 0 {
            return Err(Error::Config(
                "consumer.max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl KafkaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers cannot be empty".to_string()));
        }
        if let Some(sasl) = &self.sasl {
            if sasl.username.is_empty() || sasl.password.is_empty() {
                return Err(Error::Config(
                    "kafka.sasl requires both username and password".to_string(),
                ));
            }
        }
        if self.replication_factor < 1 {
            return Err(Error::Config(
                "kafka.replication_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn security_protocol(&self) -> &'static str {
        match (self.ssl, self.sasl.is_some()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl ResilienceConfig {
    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_timeout_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            circuit_timeout_ms: default_circuit_timeout_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
            retry_schema_errors: false,
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            known: default_topics(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            idempotent: true,
            max_in_flight_requests: default_max_in_flight(),
            transactional_id: None,
            acks: default_acks(),
            linger_ms: default_linger_ms(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_batch_size: default_max_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            auto_commit_interval_ms: default_auto_commit_interval_ms(),
        }
    }
}

/// Wire compression codec for a publish call.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::Config(format!("unknown compression '{}'", other))),
        }
    }
}

/// Settings fixed when a named producer is first created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOptions {
    pub idempotent: bool,
    pub max_in_flight_requests: u32,
    pub transactional_id: Option<String>,
}

impl From<&ProducerConfig> for ProducerOptions {
    fn from(config: &ProducerConfig) -> Self {
        Self {
            idempotent: config.idempotent,
            max_in_flight_requests: config.max_in_flight_requests,
            transactional_id: config.transactional_id.clone(),
        }
    }
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self::from(&ProducerConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Producer to send through; `"default"` when unset.
    pub producer: Option<String>,
    /// Only consulted when the named producer does not exist yet.
    pub producer_options: Option<ProducerOptions>,
    pub schema_id: Option<String>,
    pub compression: Compression,
    /// Explicit record key; otherwise derived from the payload.
    pub key: Option<String>,
    pub source: Option<String>,
    pub message_type: Option<String>,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(mut self, name: impl Into<String>) -> Self {
        self.producer = Some(name.into());
        self
    }

    pub fn producer_options(mut self, options: ProducerOptions) -> Self {
        self.producer_options = Some(options);
        self
    }

    pub fn schema(mut self, schema_id: impl Into<String>) -> Self {
        self.schema_id = Some(schema_id.into());
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn producer_name(&self) -> &str {
        self.producer.as_deref().unwrap_or(DEFAULT_PRODUCER)
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub from_beginning: bool,
    pub dlq_topic: Option<String>,
    pub continue_on_error: bool,
    /// Resolve each offset as soon as its message is handled; when false,
    /// offsets resolve only once the whole batch succeeded.
    pub each_batch_auto_resolve: bool,
    pub session_timeout: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            from_beginning: false,
            dlq_topic: None,
            continue_on_error: false,
            each_batch_auto_resolve: true,
            session_timeout: None,
            heartbeat_interval: None,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    pub fn dlq_topic(mut self, topic: impl Into<String>) -> Self {
        self.dlq_topic = Some(topic.into());
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn each_batch_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.each_batch_auto_resolve = auto_resolve;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

fn default_client_id() -> String {
    "sentinel-bus".to_string()
}

fn default_replication_factor() -> i32 {
    1
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_jitter_min() -> f64 {
    0.5
}

fn default_jitter_max() -> f64 {
    1.5
}

fn default_topics() -> Vec<String> {
    DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> u32 {
    5
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_max_batch_size() -> usize {
    100
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_auto_commit_interval_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file_applies_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[kafka]
brokers = ["kafka-1:9092", "kafka-2:9092"]
client_id = "alerts-api"

[resilience]
failure_threshold = 3
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.kafka.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.kafka.client_id, "alerts-api");
        assert_eq!(config.resilience.failure_threshold, 3);
        assert_eq!(config.resilience.max_retries, 3);
        assert!(config.producer.idempotent);
    }

    // Only this test sets SENTINEL_BUS_* variables, and only for keys the
    // other file-loading test leaves alone.
    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[kafka]
brokers = ["kafka-1:9092"]

[resilience]
base_delay_ms = 100

[topics]
known = ["events.security.alerts"]
"#
        )
        .unwrap();

        std::env::set_var("SENTINEL_BUS_RESILIENCE__BASE_DELAY_MS", "250");
        std::env::set_var(
            "SENTINEL_BUS_TOPICS__KNOWN",
            "events.scan.results,events.dlq.scan",
        );
        let loaded = Config::from_file(file.path());
        std::env::remove_var("SENTINEL_BUS_RESILIENCE__BASE_DELAY_MS");
        std::env::remove_var("SENTINEL_BUS_TOPICS__KNOWN");

        let config = loaded.unwrap();
        assert_eq!(config.resilience.base_delay_ms, 250);
        assert_eq!(
            config.topics.known,
            vec!["events.scan.results".to_string(), "events.dlq.scan".to_string()]
        );
        assert_eq!(config.kafka.bootstrap_servers(), "kafka-1:9092");
    }

    #[test]
    fn test_unbounded_backoff_settings_rejected() {
        let mut config = Config::local(&["localhost:9092"]);
        config.resilience.base_delay_ms = 100_000_000_000_000;
        config.resilience.max_retries = 30;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::local(&["localhost:9092"]);
        config.resilience.jitter_max = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::local(&["localhost:9092"]);
        config.resilience.jitter_max = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = Config::local(&["localhost:9092"]);
        config.resilience.jitter_max = MAX_JITTER + 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_brokers_rejected() {
        let mut config = Config::local(&["localhost:9092"]);
        config.kafka.brokers = vec![" ".to_string()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_half_specified_sasl_rejected() {
        let mut config = Config::local(&["localhost:9092"]);
        config.kafka.sasl = Some(SaslConfig {
            mechanism: SaslMechanism::ScramSha512,
            username: "svc-alerts".to_string(),
            password: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_security_protocol() {
        let mut config = Config::local(&["localhost:9092"]);
        assert_eq!(config.kafka.security_protocol(), "plaintext");
        config.kafka.ssl = true;
        assert_eq!(config.kafka.security_protocol(), "ssl");
        config.kafka.sasl = Some(SaslConfig {
            mechanism: SaslMechanism::Plain,
            username: "u".to_string(),
            password: "p".to_string(),
        });
        assert_eq!(config.kafka.security_protocol(), "sasl_ssl");
    }

    #[test]
    fn test_zero_failure_threshold_rejected() {
        let mut config = Config::local(&["localhost:9092"]);
        config.resilience.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publish_options_defaults() {
        let options = PublishOptions::new();
        assert_eq!(options.producer_name(), "default");
        assert_eq!(options.compression, Compression::Gzip);

        let options = PublishOptions::new().producer("audit").compression(Compression::Zstd);
        assert_eq!(options.producer_name(), "audit");
        assert_eq!(options.compression.as_str(), "zstd");
    }

    #[test]
    fn test_subscribe_options_defaults() {
        let options = SubscribeOptions::default();
        assert!(!options.from_beginning);
        assert!(!options.continue_on_error);
        assert!(options.each_batch_auto_resolve);
        assert!(options.dlq_topic.is_none());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("LZ4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert!("brotli".parse::<Compression>().is_err());
    }
}
