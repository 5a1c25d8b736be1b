//! Bridge configuration.
//!
//! [`BridgeConfig`] is normally parsed from the flat initialization map the
//! surrounding engine hands over (see [`BridgeConfig::from_map`]). Keys this
//! crate does not know are ignored, so one map may configure several
//! components. Builder-style `with_*` methods cover programmatic setup.

use std::{collections::HashMap, str::FromStr, time::Duration};

use tracing::debug;

use crate::{consumer::ConsumerKind, error::ConfigError, transport::{DeliveryMode, QueueSpec}};

const DEFAULT_POOL_MAX_SIZE: usize = 8;
const DEFAULT_POOL_WAIT: Duration = Duration::from_millis(5_000);
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const DEFAULT_PERIOD: Duration = Duration::from_millis(100);
const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(1_000);
const DEFAULT_MIN_BATCH: usize = 10;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);
const DEFAULT_REPLY_EXPIRY: Duration = Duration::from_millis(60_000);

/// Connection pooling for producers and extractors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Reuse connection objects across calls.
    pub enabled: bool,
    /// Upper bound on live pooled objects.
    pub max_size: usize,
    /// How long a borrower waits for a free object before failing.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: DEFAULT_POOL_MAX_SIZE,
            wait_timeout: DEFAULT_POOL_WAIT,
        }
    }
}

/// Settings shared by every consumer delegate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Which delegate runs on each resource.
    pub kind: ConsumerKind,
    /// Number of parallel resources consuming the queue.
    pub instances: usize,
    /// Consumer tag override. Defaults to `queuebridge-<queue>`.
    pub tag: Option<String>,
    /// Reconnect automatically when the broker cancels the subscription.
    pub cancel_recovery: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            kind: ConsumerKind::Default,
            instances: 1,
            tag: None,
            cancel_recovery: true,
        }
    }
}

/// Timer and batching parameters of the merging consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergingConfig {
    /// Delay before the first tick.
    pub initial_delay: Duration,
    /// Interval between ticks.
    pub period: Duration,
    /// Flush once the oldest accumulated message is older than this.
    pub max_wait: Duration,
    /// Flush once this many messages are accumulated.
    pub min_batch: usize,
    /// Bound on each broker poll inside a tick.
    pub poll_timeout: Duration,
    /// Delivery mode of published replies.
    pub reply_delivery_mode: DeliveryMode,
    /// Publish one merged reply per reply destination instead of one per batch.
    pub merge_on_reply_to: bool,
    /// Only publish replies for groups holding exactly one message.
    pub unity_only: bool,
}

impl Default for MergingConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            period: DEFAULT_PERIOD,
            max_wait: DEFAULT_MAX_WAIT,
            min_batch: DEFAULT_MIN_BATCH,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            reply_delivery_mode: DeliveryMode::Transient,
            merge_on_reply_to: true,
            unity_only: false,
        }
    }
}

/// Defaults applied by producers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Inactivity expiry of ephemeral reply queues.
    pub reply_expiry: Duration,
    /// Delivery mode used when a send does not override it.
    pub delivery_mode: DeliveryMode,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            reply_expiry: DEFAULT_REPLY_EXPIRY,
            delivery_mode: DeliveryMode::Persistent,
        }
    }
}

/// Complete configuration of one bridge endpoint.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use queuebridge::{config::BridgeConfig, consumer::ConsumerKind};
///
/// let config = BridgeConfig::new("orders", "memory://local")
///     .with_consumer(ConsumerKind::Merging)
///     .with_instances(2)
///     .with_pool(4, Duration::from_secs(1));
/// assert_eq!(config.backend_name(), "memory");
/// assert_eq!(config.consumer_tag(1), "queuebridge-orders-1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Target queue.
    pub queue: String,
    /// Broker connection string.
    pub uri: String,
    /// Backend name override. Defaults to the URI scheme.
    pub backend: Option<String>,
    /// Producer and extractor pooling.
    pub pool: PoolConfig,
    /// Prefetch (QoS) limit applied to consumer channels.
    pub prefetch: Option<u16>,
    /// Attributes the target queue is declared with.
    pub declare: QueueSpec,
    /// Consumer selection and recovery.
    pub consumer: ConsumerConfig,
    /// Merging consumer parameters.
    pub merging: MergingConfig,
    /// Producer defaults.
    pub producer: ProducerConfig,
}

impl BridgeConfig {
    /// Configuration for `queue` on the broker at `uri`, with defaults for
    /// everything else.
    #[must_use]
    pub fn new(queue: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            uri: uri.into(),
            backend: None,
            pool: PoolConfig::default(),
            prefetch: None,
            declare: QueueSpec {
                durable: true,
                ..QueueSpec::default()
            },
            consumer: ConsumerConfig::default(),
            merging: MergingConfig::default(),
            producer: ProducerConfig::default(),
        }
    }

    /// Parse the initialization map.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when `queue` or `uri` is absent and
    /// [`ConfigError::Invalid`] when a value cannot be parsed.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let queue = map.get("queue").ok_or(ConfigError::Missing { key: "queue" })?;
        let uri = map.get("uri").ok_or(ConfigError::Missing { key: "uri" })?;
        let mut config = Self::new(queue.trim(), uri.trim());

        let mut keys: Vec<_> = map.keys().collect();
        keys.sort();
        for key in keys {
            config.apply(key, &map[key])?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        match key {
            "queue" | "uri" => {}
            "backend" => self.backend = Some(raw.trim().to_owned()),
            "pool.enabled" => self.pool.enabled = parse_bool(key, raw)?,
            "pool.max_size" => self.pool.max_size = parse(key, raw)?,
            "pool.wait_timeout_ms" => self.pool.wait_timeout = parse_millis(key, raw)?,
            "prefetch" => self.prefetch = Some(parse(key, raw)?),
            "queue.durable" => self.declare.durable = parse_bool(key, raw)?,
            "queue.expires_ms" => self.declare.expires = Some(parse_millis(key, raw)?),
            "queue.message_ttl_ms" => self.declare.message_ttl = Some(parse_millis(key, raw)?),
            "queue.ha_policy" => self.declare.ha_policy = Some(raw.trim().to_owned()),
            "consumer" => self.consumer.kind = raw.parse()?,
            "consumer.instances" => self.consumer.instances = parse(key, raw)?,
            "consumer.tag" => self.consumer.tag = Some(raw.trim().to_owned()),
            "consumer.cancel_recovery" => self.consumer.cancel_recovery = parse_bool(key, raw)?,
            "merging.initial_delay_ms" => self.merging.initial_delay = parse_millis(key, raw)?,
            "merging.period_ms" => self.merging.period = parse_millis(key, raw)?,
            "merging.max_wait_ms" => self.merging.max_wait = parse_millis(key, raw)?,
            "merging.min_batch" => self.merging.min_batch = parse(key, raw)?,
            "merging.poll_timeout_ms" => self.merging.poll_timeout = parse_millis(key, raw)?,
            "merging.reply_delivery_mode" => {
                self.merging.reply_delivery_mode = parse_mode(key, raw)?;
            }
            "merging.merge_on_reply_to" => self.merging.merge_on_reply_to = parse_bool(key, raw)?,
            "merging.unity_only" => self.merging.unity_only = parse_bool(key, raw)?,
            "producer.reply_expiry_ms" => self.producer.reply_expiry = parse_millis(key, raw)?,
            "producer.delivery_mode" => self.producer.delivery_mode = parse_mode(key, raw)?,
            other => debug!(key = other, "ignoring unrecognised configuration key"),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("pool.max_size", self.pool.max_size),
            ("consumer.instances", self.consumer.instances),
            ("merging.min_batch", self.merging.min_batch),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "0", "must be at least 1"));
            }
        }
        if self.merging.period.is_zero() {
            return Err(invalid("merging.period_ms", "0", "must be at least 1"));
        }
        if self.queue.is_empty() {
            return Err(invalid("queue", "", "must not be empty"));
        }
        Ok(())
    }

    /// Name of the backend to resolve: the explicit override, else the URI
    /// scheme.
    #[must_use]
    pub fn backend_name(&self) -> &str {
        match &self.backend {
            Some(name) => name,
            None => self
                .uri
                .split_once("://")
                .map_or(self.uri.as_str(), |(scheme, _)| scheme),
        }
    }

    /// Consumer tag for resource `index`.
    #[must_use]
    pub fn consumer_tag(&self, index: usize) -> String {
        let base = self
            .consumer
            .tag
            .clone()
            .unwrap_or_else(|| format!("queuebridge-{}", self.queue));
        if self.consumer.instances > 1 {
            format!("{base}-{index}")
        } else {
            base
        }
    }

    /// Override the backend name.
    #[must_use]
    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = Some(name.into());
        self
    }

    /// Select the consumer delegate.
    #[must_use]
    pub fn with_consumer(mut self, kind: ConsumerKind) -> Self {
        self.consumer.kind = kind;
        self
    }

    /// Number of parallel consumer resources.
    #[must_use]
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.consumer.instances = instances;
        self
    }

    /// Enable pooling with `max_size` objects and the given borrow wait.
    #[must_use]
    pub fn with_pool(mut self, max_size: usize, wait_timeout: Duration) -> Self {
        self.pool = PoolConfig {
            enabled: true,
            max_size,
            wait_timeout,
        };
        self
    }

    /// Apply a prefetch limit to consumer channels.
    #[must_use]
    pub fn with_prefetch(mut self, limit: u16) -> Self {
        self.prefetch = Some(limit);
        self
    }

    /// Replace the merging parameters.
    #[must_use]
    pub fn with_merging(mut self, merging: MergingConfig) -> Self {
        self.merging = merging;
        self
    }

    /// Toggle automatic recovery after broker cancellation.
    #[must_use]
    pub fn with_cancel_recovery(mut self, enabled: bool) -> Self {
        self.consumer.cancel_recovery = enabled;
        self
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.into(),
        value: value.into(),
        reason: reason.into(),
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, raw, &e.to_string()))
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, raw).map(Duration::from_millis)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(key, raw, "expected a boolean")),
    }
}

fn parse_mode(key: &str, raw: &str) -> Result<DeliveryMode, ConfigError> {
    raw.parse::<DeliveryMode>()
        .map_err(|_| invalid(key, raw, "expected transient or persistent"))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use rstest::rstest;

    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn minimal_map_uses_defaults() {
        let config = BridgeConfig::from_map(&map(&[("queue", "orders"), ("uri", "memory://")]))
            .expect("valid config");
        assert_eq!(config, BridgeConfig::new("orders", "memory://"));
        assert!(config.declare.durable);
        assert!(!config.pool.enabled);
        assert_eq!(config.consumer_tag(0), "queuebridge-orders");
    }

    #[test]
    fn parses_merging_settings() {
        let config = BridgeConfig::from_map(&map(&[
            ("queue", "orders"),
            ("uri", "amqp://rabbit"),
            ("consumer", "merging"),
            ("merging.min_batch", "5"),
            ("merging.max_wait_ms", "10000"),
            ("merging.merge_on_reply_to", "no"),
            ("merging.reply_delivery_mode", "persistent"),
            ("queue.expires_ms", "30000"),
            ("queue.ha_policy", "all"),
            ("pool.enabled", "yes"),
            ("engine.threads", "4"),
        ]))
        .expect("valid config");

        assert_eq!(config.consumer.kind, ConsumerKind::Merging);
        assert_eq!(config.merging.min_batch, 5);
        assert_eq!(config.merging.max_wait, Duration::from_secs(10));
        assert!(!config.merging.merge_on_reply_to);
        assert_eq!(config.merging.reply_delivery_mode, DeliveryMode::Persistent);
        assert_eq!(config.declare.expires, Some(Duration::from_secs(30)));
        assert_eq!(config.declare.ha_policy.as_deref(), Some("all"));
        assert!(config.pool.enabled);
        assert_eq!(config.backend_name(), "amqp");
    }

    #[rstest]
    #[case("queue")]
    #[case("uri")]
    fn missing_required_keys_fail(#[case] absent: &str) {
        let mut entries = map(&[("queue", "orders"), ("uri", "memory://")]);
        entries.remove(absent);
        let err = BridgeConfig::from_map(&entries).expect_err("required key");
        assert!(matches!(err, ConfigError::Missing { key } if key == absent));
    }

    #[rstest]
    #[case("pool.max_size", "0")]
    #[case("pool.enabled", "maybe")]
    #[case("prefetch", "70000")]
    #[case("merging.period_ms", "0")]
    #[case("consumer", "fanout")]
    #[case("producer.delivery_mode", "eventually")]
    fn invalid_values_name_their_key(#[case] key: &str, #[case] value: &str) {
        let entries = map(&[("queue", "orders"), ("uri", "memory://"), (key, value)]);
        let err = BridgeConfig::from_map(&entries).expect_err("invalid value");
        match err {
            ConfigError::Invalid { key: reported, .. } => assert_eq!(reported, key),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn explicit_tag_gains_index_with_several_instances() {
        let mut config = BridgeConfig::new("orders", "memory://").with_instances(3);
        config.consumer.tag = Some("billing".into());
        assert_eq!(config.consumer_tag(2), "billing-2");
    }
}
