//! Centralized Configuration Management
//!
//! One [`CourierConfig`] covers every process role (gateway, directory,
//! delivery). Durations are stored as integer milliseconds or seconds so the
//! TOML form stays flat; accessor methods return [`Duration`].

use crate::errors::{CourierError, Result};
use crate::types::Platform;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Smallest ack wait a delivery worker may use
pub const MIN_ACK_WAIT: Duration = Duration::from_millis(250);

// ----------------------------------------------------------------------------
// Gateway Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Capacity of each session's outbound buffer
    pub outbound_capacity: usize,
    /// Prefix used when deriving a gateway id from the host
    pub name_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            name_prefix: "gateway".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Directory Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Topic kickout, backlog and fan-out envelopes are published to
    pub topic: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            topic: "courier.deliver".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Configuration
// ----------------------------------------------------------------------------

/// Configuration for delivery workers and retry escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// How long a push waits for the client's ack
    pub ack_wait_ms: u64,
    /// Workers on the primary topic
    pub concurrency: usize,
    pub topic: String,
    pub retry_topic: String,
    /// Workers on the retry topic
    pub retry_concurrency: usize,
    /// Minimum spacing between two attempts of the same envelope
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub dlq_topic: String,
    /// Overall bound on draining one session's offline backlog
    pub offline_push_deadline_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_wait_ms: 3_000,
            concurrency: 8,
            topic: "courier.deliver".to_string(),
            retry_topic: "courier.deliver.retry".to_string(),
            retry_concurrency: 2,
            retry_delay_ms: 5_000,
            max_retries: 3,
            dlq_topic: "courier.deliver.dlq".to_string(),
            offline_push_deadline_ms: 120_000,
        }
    }
}

impl DeliveryConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn offline_push_deadline(&self) -> Duration {
        Duration::from_millis(self.offline_push_deadline_ms)
    }
}

// ----------------------------------------------------------------------------
// Offline Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Lifetime of an offline message, whole seconds
    pub expire_secs: u64,
    /// Messages per backlog push
    pub batch_count: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            expire_secs: 7 * 24 * 3600,
            batch_count: 50,
        }
    }
}

impl OfflineConfig {
    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }
}

// ----------------------------------------------------------------------------
// Platforms
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: Platform,
    /// Offline backlog cap per user; -1 keeps everything until expiry
    pub max_offline_count: i64,
}

impl PlatformConfig {
    pub fn new<P: Into<Platform>>(name: P, max_offline_count: i64) -> Self {
        Self {
            name: name.into(),
            max_offline_count,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    pub platforms: Vec<PlatformConfig>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            directory: DirectoryConfig::default(),
            delivery: DeliveryConfig::default(),
            offline: OfflineConfig::default(),
            platforms: vec![
                PlatformConfig::new("ios", 500),
                PlatformConfig::new("android", 500),
                PlatformConfig::new("web", -1),
            ],
        }
    }
}

impl CourierConfig {
    /// Short delays and few workers, for tests and local simulation
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.gateway.outbound_capacity = 16;
        config.delivery.ack_wait_ms = MIN_ACK_WAIT.as_millis() as u64;
        config.delivery.concurrency = 2;
        config.delivery.retry_concurrency = 1;
        config.delivery.retry_delay_ms = 50;
        config.delivery.offline_push_deadline_ms = 5_000;
        config.offline.batch_count = 11;
        config
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: CourierConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|err| {
            CourierError::config_error(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.outbound_capacity == 0 {
            return Err(CourierError::config_error(
                "gateway.outbound_capacity must be > 0",
            ));
        }
        if self.directory.topic.is_empty() {
            return Err(CourierError::config_error("directory.topic must be set"));
        }

        let delivery = &self.delivery;
        if delivery.ack_wait() < MIN_ACK_WAIT {
            return Err(CourierError::config_error(format!(
                "delivery.ack_wait_ms must be >= {}",
                MIN_ACK_WAIT.as_millis()
            )));
        }
        if delivery.concurrency == 0 || delivery.retry_concurrency == 0 {
            return Err(CourierError::config_error(
                "delivery.concurrency and delivery.retry_concurrency must be > 0",
            ));
        }
        if delivery.topic.is_empty() || delivery.retry_topic.is_empty() {
            return Err(CourierError::config_error(
                "delivery.topic and delivery.retry_topic must be set",
            ));
        }
        if delivery.topic == delivery.retry_topic {
            return Err(CourierError::config_error(
                "delivery.retry_topic must differ from delivery.topic",
            ));
        }
        if delivery.dlq_topic.is_empty() {
            return Err(CourierError::config_error("delivery.dlq_topic must be set"));
        }
        if delivery.max_retries == 0 {
            return Err(CourierError::config_error("delivery.max_retries must be > 0"));
        }

        if self.offline.expire_secs == 0 {
            return Err(CourierError::config_error("offline.expire_secs must be > 0"));
        }
        if self.offline.batch_count <= 10 {
            return Err(CourierError::config_error("offline.batch_count must be > 10"));
        }

        if self.platforms.is_empty() {
            return Err(CourierError::config_error("at least one platform is required"));
        }
        let mut seen = HashSet::new();
        for platform in &self.platforms {
            if platform.name.is_empty() {
                return Err(CourierError::config_error("platform name must be set"));
            }
            if !seen.insert(platform.name.clone()) {
                return Err(CourierError::config_error(format!(
                    "platform {} configured twice",
                    platform.name
                )));
            }
            if platform.max_offline_count < -1 {
                return Err(CourierError::config_error(format!(
                    "platform {}: max_offline_count must be -1 or >= 0",
                    platform.name
                )));
            }
        }
        Ok(())
    }

    /// Configured platform names in declaration order
    pub fn platform_names(&self) -> Vec<Platform> {
        self.platforms.iter().map(|p| p.name.clone()).collect()
    }

    pub fn max_offline_counts(&self) -> HashMap<Platform, i64> {
        self.platforms
            .iter()
            .map(|p| (p.name.clone(), p.max_offline_count))
            .collect()
    }
}
