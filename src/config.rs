//! Configuration of the export pipeline and of its destinations.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between two timer flushes of a destination.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// Default number of pending events that triggers a flush of a bulk destination.
pub const DEFAULT_MAX_BUFFERED_EVENTS: i64 = 100_000;
/// Default interval between two compactions of the event log.
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for [`Manager`](crate::Manager).
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Interval between two compactions of the shared event log.
    ///
    /// Defaults to [`ManagerConfig::DEFAULT_COMPACTION_INTERVAL`].
    pub compaction_interval: Duration,
}

impl ManagerConfig {
    /// Default value for [`ManagerConfig::compaction_interval`].
    pub const DEFAULT_COMPACTION_INTERVAL: Duration = DEFAULT_COMPACTION_INTERVAL;

    /// Create a new `ManagerConfig` using default configuration.
    pub fn new() -> ManagerConfig {
        ManagerConfig::default()
    }

    /// Update compaction interval with `interval`.
    pub fn with_compaction_interval(mut self, interval: Duration) -> ManagerConfig {
        self.compaction_interval = interval;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> ManagerConfig {
        ManagerConfig {
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
        }
    }
}

/// Batching settings of a destination, as found in configuration files.
///
/// Zero values mean "use the default".
///
/// ```
/// # use flagpipe::DeliverySettings;
/// let settings: DeliverySettings =
///     serde_json::from_str(r#"{"name": "s3", "flushInterval": 10000, "maxEventInMemory": 500}"#)
///         .unwrap();
/// assert_eq!(settings.flush_interval, std::time::Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Name of the destination in logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Interval between two timer flushes, in milliseconds.
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Number of pending events that triggers a flush.
    #[serde(rename = "maxEventInMemory")]
    pub max_buffered_events: i64,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
