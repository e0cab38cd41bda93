//! Matcher configuration
//!
//! [`MatcherConfig`] is a plain value. The surrounding configuration system
//! publishes refreshed values through a [`ConfigHandle`]; the matcher and the
//! forwarder only ever read the current snapshot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range
    #[error("{field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

/// Per-partition matching policy
///
/// # Example
///
/// ```
/// use everruns_matching::MatcherConfig;
///
/// let config = MatcherConfig::default()
///     .with_max_outstanding_polls(2)
///     .with_max_rate_per_second(50)
///     .with_max_children_per_node(10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatcherConfig {
    /// Whether unmatched tasks and polls may be forwarded to the parent
    pub forwarding_enabled: bool,

    /// Maximum forwarded add-task calls in flight
    pub forwarder_max_outstanding_tasks: usize,

    /// Maximum forwarded poll calls in flight
    pub forwarder_max_outstanding_polls: usize,

    /// Maximum forwarded add-task calls admitted per second
    pub forwarder_max_rate_per_second: u32,

    /// Fan-out degree of the partition tree
    pub forwarder_max_children_per_node: u32,

    /// Local dispatch rate limit for this partition (None = unlimited)
    #[serde(default)]
    pub dispatch_rate_per_second: Option<u32>,

    /// How long `must_offer` waits for a local poller after a failed forward
    /// before forwarding again
    #[serde(with = "duration_millis")]
    pub must_offer_forward_retry: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            forwarding_enabled: true,
            forwarder_max_outstanding_tasks: 1,
            forwarder_max_outstanding_polls: 1,
            forwarder_max_rate_per_second: 10,
            forwarder_max_children_per_node: 20,
            dispatch_rate_per_second: None,
            must_offer_forward_retry: Duration::from_secs(2),
        }
    }
}

impl MatcherConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `MATCHING_*` environment variables
    ///
    /// Unset or unparsable variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let forwarding_enabled = env_parse("MATCHING_FORWARDING_ENABLED")
            .unwrap_or(defaults.forwarding_enabled);
        let forwarder_max_outstanding_tasks = env_parse("MATCHING_FORWARDER_MAX_OUTSTANDING_TASKS")
            .unwrap_or(defaults.forwarder_max_outstanding_tasks);
        let forwarder_max_outstanding_polls = env_parse("MATCHING_FORWARDER_MAX_OUTSTANDING_POLLS")
            .unwrap_or(defaults.forwarder_max_outstanding_polls);
        let forwarder_max_rate_per_second = env_parse("MATCHING_FORWARDER_MAX_RATE_PER_SECOND")
            .unwrap_or(defaults.forwarder_max_rate_per_second);
        let forwarder_max_children_per_node =
            env_parse("MATCHING_FORWARDER_MAX_CHILDREN_PER_NODE")
                .unwrap_or(defaults.forwarder_max_children_per_node);
        let dispatch_rate_per_second = env_parse("MATCHING_DISPATCH_RATE_PER_SECOND");
        let must_offer_forward_retry = env_parse("MATCHING_MUST_OFFER_FORWARD_RETRY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.must_offer_forward_retry);

        Self {
            forwarding_enabled,
            forwarder_max_outstanding_tasks,
            forwarder_max_outstanding_polls,
            forwarder_max_rate_per_second,
            forwarder_max_children_per_node,
            dispatch_rate_per_second,
            must_offer_forward_retry,
        }
    }

    /// Enable or disable forwarding
    pub fn with_forwarding(mut self, enabled: bool) -> Self {
        self.forwarding_enabled = enabled;
        self
    }

    /// Set the maximum number of outstanding forwarded add-task calls
    pub fn with_max_outstanding_tasks(mut self, max: usize) -> Self {
        self.forwarder_max_outstanding_tasks = max;
        self
    }

    /// Set the maximum number of outstanding forwarded polls
    pub fn with_max_outstanding_polls(mut self, max: usize) -> Self {
        self.forwarder_max_outstanding_polls = max;
        self
    }

    /// Set the forwarded add-task rate
    pub fn with_max_rate_per_second(mut self, rate: u32) -> Self {
        self.forwarder_max_rate_per_second = rate;
        self
    }

    /// Set the partition tree fan-out degree
    pub fn with_max_children_per_node(mut self, degree: u32) -> Self {
        self.forwarder_max_children_per_node = degree;
        self
    }

    /// Set the local dispatch rate
    pub fn with_dispatch_rate(mut self, rate: Option<u32>) -> Self {
        self.dispatch_rate_per_second = rate;
        self
    }

    /// Set the forward retry window used by `must_offer`
    pub fn with_must_offer_forward_retry(mut self, window: Duration) -> Self {
        self.must_offer_forward_retry = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forwarding_enabled && self.forwarder_max_children_per_node == 0 {
            return Err(ConfigError::InvalidValue {
                field: "forwarder_max_children_per_node",
                reason: "must be positive when forwarding is enabled",
            });
        }
        if self.dispatch_rate_per_second == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "dispatch_rate_per_second",
                reason: "must be positive or unset",
            });
        }
        if self.must_offer_forward_retry.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "must_offer_forward_retry",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Shared, replaceable configuration snapshot
///
/// Readers get an `Arc` to the current value; a refresh swaps the whole value
/// and never mutates fields in place.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<MatcherConfig>>>,
}

impl ConfigHandle {
    /// Create a handle holding `config`
    pub fn new(config: MatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Current configuration snapshot
    pub fn current(&self) -> Arc<MatcherConfig> {
        Arc::clone(&self.current.read())
    }

    /// Replace the configuration
    pub fn replace(&self, config: MatcherConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
