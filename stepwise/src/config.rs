//! Configuration for queues, consumers, barriers and logging.
//!
//! Queue configurations replace a process-wide schema registry: every
//! [`WorkQueue`](crate::queue::WorkQueue) is constructed with the
//! [`QueueConfig`] naming its collection and schema version.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::consumer::PollBackoffConfig;
use crate::errors::{FlowError, FlowResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepwiseConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// One entry per queue type.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    /// Event consumer configuration.
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Barrier configuration.
    #[serde(default)]
    pub barrier: BarrierConfig,
}

impl StepwiseConfig {
    /// Parses a JSON configuration document.
    pub fn from_json_str(json: &str) -> FlowResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> FlowResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Applies `STEPWISE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("STEPWISE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("STEPWISE_LOG_JSON") {
            self.logging.json = matches!(json.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(service) = lookup("STEPWISE_SERVICE_NAME") {
            self.consumer.service_name = service;
        }
        if let Some(group) = lookup("STEPWISE_CONSUMER_GROUP") {
            self.consumer.group = group;
        }
        if let Some(name) = lookup("STEPWISE_CONSUMER_NAME") {
            self.consumer.consumer_name = name;
        }
    }

    /// Validates every section.
    pub fn validate(&self) -> FlowResult<()> {
        for queue in &self.queues {
            queue.validate()?;
        }
        let mut names: Vec<&str> = self.queues.iter().map(|q| q.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(FlowError::Config(format!("duplicate queue name '{}'", pair[0])));
        }
        self.consumer.validate()?;
        self.barrier.validate()
    }

    /// Returns the queue configuration with the given name.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Include the event target (module path).
    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            with_target: true,
        }
    }
}

/// Configuration for one queue type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Logical queue name.
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Persisted collection holding the items.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Payload schema version this queue produces and consumes.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// How long a claim stays live without renewal.
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,
    /// How long before lease expiry the heartbeat renews.
    #[serde(default = "default_heartbeat_margin_ms")]
    pub heartbeat_margin_ms: u64,
    /// Maximum time a blocking claim waits for an item.
    #[serde(default = "default_claim_wait_ms")]
    pub claim_wait_ms: u64,
    /// Delay between claim attempts while waiting.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Retries given to items enqueued without an explicit count.
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    /// Visibility delay applied when an item is requeued.
    #[serde(default)]
    pub requeue_delay_ms: u64,
    /// Pause after the store reports itself unavailable.
    #[serde(default = "default_store_backoff_ms")]
    pub store_backoff_ms: u64,
    /// Number of workers polling this queue.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_collection() -> String {
    "queue_items".to_string()
}

fn default_schema_version() -> String {
    "1".to_string()
}

fn default_lease_duration_ms() -> u64 {
    30_000
}

fn default_heartbeat_margin_ms() -> u64 {
    5_000
}

fn default_claim_wait_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_retries() -> u32 {
    3
}

fn default_store_backoff_ms() -> u64 {
    1_000
}

fn default_pool_size() -> usize {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            collection: default_collection(),
            schema_version: default_schema_version(),
            lease_duration_ms: default_lease_duration_ms(),
            heartbeat_margin_ms: default_heartbeat_margin_ms(),
            claim_wait_ms: default_claim_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            default_retries: default_retries(),
            requeue_delay_ms: 0,
            store_backoff_ms: default_store_backoff_ms(),
            pool_size: default_pool_size(),
        }
    }
}

impl QueueConfig {
    /// Creates a queue configuration with defaults for the given name and collection.
    #[must_use]
    pub fn new(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Sets the lease duration.
    #[must_use]
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_ms = duration_ms(lease);
        self
    }

    /// Sets the heartbeat safety margin.
    #[must_use]
    pub fn with_heartbeat_margin(mut self, margin: Duration) -> Self {
        self.heartbeat_margin_ms = duration_ms(margin);
        self
    }

    /// Sets the blocking claim wait and poll interval.
    #[must_use]
    pub fn with_claim_wait(mut self, wait: Duration, poll_interval: Duration) -> Self {
        self.claim_wait_ms = duration_ms(wait);
        self.poll_interval_ms = duration_ms(poll_interval);
        self
    }

    /// Sets the default retry count.
    #[must_use]
    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Sets the requeue visibility delay.
    #[must_use]
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the pause after a store outage.
    #[must_use]
    pub fn with_store_backoff(mut self, backoff: Duration) -> Self {
        self.store_backoff_ms = duration_ms(backoff);
        self
    }

    /// Sets the schema version.
    #[must_use]
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Gets the lease duration.
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Gets the heartbeat renewal interval.
    ///
    /// This is the lease duration minus the safety margin, or half the lease
    /// when the margin leaves no room.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        let interval = if self.heartbeat_margin_ms < self.lease_duration_ms {
            self.lease_duration_ms - self.heartbeat_margin_ms
        } else {
            self.lease_duration_ms / 2
        };
        Duration::from_millis(interval.max(1))
    }

    /// Gets the blocking claim wait.
    #[must_use]
    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }

    /// Gets the claim poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Gets the requeue visibility delay.
    #[must_use]
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    /// Gets the pause after a store outage.
    #[must_use]
    pub fn store_backoff(&self) -> Duration {
        Duration::from_millis(self.store_backoff_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> FlowResult<()> {
        if self.name.is_empty() {
            return Err(FlowError::Config("queue name must not be empty".into()));
        }
        if self.collection.is_empty() {
            return Err(FlowError::Config(format!("queue '{}' has no collection", self.name)));
        }
        if self.lease_duration_ms == 0 {
            return Err(FlowError::Config(format!(
                "queue '{}' must have a non-zero lease duration",
                self.name
            )));
        }
        if self.pool_size == 0 {
            return Err(FlowError::Config(format!(
                "queue '{}' must have at least one worker",
                self.name
            )));
        }
        Ok(())
    }
}

/// When a consumed message is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge once the message is handed to the handler pool.
    #[default]
    AfterSubmit,
    /// Acknowledge only after the handler returned successfully.
    AfterCompletion,
}

/// Configuration for an event consumer loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Name of this service; messages routed elsewhere are skipped.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Metadata key holding the target service.
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    /// Metadata key holding the event type used for decoding.
    #[serde(default = "default_event_type_key")]
    pub event_type_key: String,
    /// Consumer group name.
    #[serde(default = "default_group")]
    pub group: String,
    /// Consumer name within the group.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    /// Maximum messages read per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time a poll blocks waiting for messages.
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    /// Maximum concurrently running handlers.
    #[serde(default = "default_handler_pool_size")]
    pub handler_pool_size: usize,
    /// Handling time above which a warning is logged.
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Pause after the broker reports itself unavailable.
    #[serde(default = "default_unavailable_backoff_ms")]
    pub unavailable_backoff_ms: u64,
    /// How long shutdown waits for in-flight handlers.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Acknowledgement mode.
    #[serde(default)]
    pub ack_mode: AckMode,
    /// Optional sleep before each poll for low-priority consumers.
    #[serde(default)]
    pub lazy: Option<PollBackoffConfig>,
}

fn default_service_name() -> String {
    "stepwise".to_string()
}

fn default_routing_key() -> String {
    "serviceId".to_string()
}

fn default_event_type_key() -> String {
    "eventType".to_string()
}

fn default_group() -> String {
    "stepwise".to_string()
}

fn default_consumer_name() -> String {
    "consumer-1".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_wait_ms() -> u64 {
    1_000
}

fn default_handler_pool_size() -> usize {
    4
}

fn default_slow_threshold_ms() -> u64 {
    5_000
}

fn default_unavailable_backoff_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            routing_key: default_routing_key(),
            event_type_key: default_event_type_key(),
            group: default_group(),
            consumer_name: default_consumer_name(),
            batch_size: default_batch_size(),
            poll_wait_ms: default_poll_wait_ms(),
            handler_pool_size: default_handler_pool_size(),
            slow_threshold_ms: default_slow_threshold_ms(),
            unavailable_backoff_ms: default_unavailable_backoff_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            ack_mode: AckMode::default(),
            lazy: None,
        }
    }
}

impl ConsumerConfig {
    /// Creates a consumer configuration for a service.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Sets the consumer group and consumer name.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer_name = consumer_name.into();
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the poll wait.
    #[must_use]
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait_ms = duration_ms(wait);
        self
    }

    /// Sets the handler pool size.
    #[must_use]
    pub fn with_handler_pool_size(mut self, size: usize) -> Self {
        self.handler_pool_size = size;
        self
    }

    /// Sets the slow-processing threshold.
    #[must_use]
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold_ms = duration_ms(threshold);
        self
    }

    /// Sets the broker outage backoff.
    #[must_use]
    pub fn with_unavailable_backoff(mut self, backoff: Duration) -> Self {
        self.unavailable_backoff_ms = duration_ms(backoff);
        self
    }

    /// Sets the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the acknowledgement mode.
    #[must_use]
    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    /// Enables lazy polling.
    #[must_use]
    pub fn with_lazy(mut self, backoff: PollBackoffConfig) -> Self {
        self.lazy = Some(backoff);
        self
    }

    /// Gets the poll wait.
    #[must_use]
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    /// Gets the slow-processing threshold.
    #[must_use]
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    /// Gets the broker outage backoff.
    #[must_use]
    pub fn unavailable_backoff(&self) -> Duration {
        Duration::from_millis(self.unavailable_backoff_ms)
    }

    /// Gets the shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> FlowResult<()> {
        if self.service_name.is_empty() {
            return Err(FlowError::Config("consumer service name must not be empty".into()));
        }
        if self.group.is_empty() || self.consumer_name.is_empty() {
            return Err(FlowError::Config("consumer group and name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(FlowError::Config("consumer batch size must be positive".into()));
        }
        if self.handler_pool_size == 0 {
            return Err(FlowError::Config("consumer handler pool must be positive".into()));
        }
        Ok(())
    }
}

/// Barrier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarrierConfig {
    /// Expected count for barriers that were never registered.
    #[serde(default)]
    pub default_expected_count: Option<usize>,
}

impl BarrierConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> FlowResult<()> {
        if self.default_expected_count == Some(0) {
            return Err(FlowError::Config("barrier expected count must be positive".into()));
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.lease_duration(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.default_retries, 3);
        assert_eq!(config.pool_size, 1);
    }

    #[test]
    fn test_heartbeat_interval_when_margin_exceeds_lease() {
        let config = QueueConfig::default()
            .with_lease_duration(Duration::from_secs(2))
            .with_heartbeat_margin(Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_queue_validation() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(QueueConfig::default()
            .with_lease_duration(Duration::ZERO)
            .validate()
            .is_err());
        assert!(QueueConfig::default().with_pool_size(0).validate().is_err());
        assert!(QueueConfig::new("q", "").validate().is_err());
    }

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.slow_threshold(), Duration::from_secs(5));
        assert_eq!(config.ack_mode, AckMode::AfterSubmit);
        assert_eq!(config.routing_key, "serviceId");
        assert!(config.lazy.is_none());
    }

    #[test]
    fn test_from_json_str_applies_field_defaults() {
        let json = r#"{
            "queues": [
                {"name": "heartbeats", "collection": "hb_queue", "lease_duration_ms": 10000},
                {"name": "finalize", "collection": "finalize_queue", "pool_size": 4}
            ],
            "consumer": {"service_name": "pms", "ack_mode": "after_completion"},
            "barrier": {"default_expected_count": 2}
        }"#;

        let config = StepwiseConfig::from_json_str(json).unwrap();
        let hb = config.queue("heartbeats").unwrap();
        assert_eq!(hb.lease_duration(), Duration::from_secs(10));
        assert_eq!(hb.default_retries, 3);
        assert_eq!(config.queue("finalize").unwrap().pool_size, 4);
        assert_eq!(config.consumer.service_name, "pms");
        assert_eq!(config.consumer.ack_mode, AckMode::AfterCompletion);
        assert_eq!(config.barrier.default_expected_count, Some(2));
    }

    #[test]
    fn test_duplicate_queue_names_rejected() {
        let json = r#"{"queues": [{"name": "a"}, {"name": "a"}]}"#;
        let err = StepwiseConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, FlowError::Config(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"consumer": {{"service_name": "cd"}}}}"#).unwrap();

        let config = StepwiseConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.consumer.service_name, "cd");
        assert!(config.queues.is_empty());
    }

    #[test]
    fn test_from_json_file_missing() {
        let err = StepwiseConfig::from_json_file("/nonexistent/stepwise.json").unwrap_err();
        assert!(matches!(err, FlowError::Io(_)));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STEPWISE_LOG_LEVEL", "debug"),
            ("STEPWISE_LOG_JSON", "true"),
            ("STEPWISE_SERVICE_NAME", "ci"),
        ]
        .into_iter()
        .collect();

        let mut config = StepwiseConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.consumer.service_name, "ci");
        assert_eq!(config.consumer.group, "stepwise");
    }

    #[test]
    fn test_barrier_validation() {
        let config = BarrierConfig {
            default_expected_count: Some(0),
        };
        assert!(config.validate().is_err());
    }
}
