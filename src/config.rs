//! Client configuration.

use serde::Deserialize;
use std::time::Duration;

/// Protocol version this client speaks.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.4";

/// Interval between two heartbeats.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Delay before a reconnect attempt.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Default capacity of the connection event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for a [`SignalRClient`](crate::SignalRClient).
///
/// # Example
///
/// ```
/// use signalrr_classic::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_query_string("token=abc")
///     .with_reconnect_delay(Duration::from_secs(1));
/// assert_eq!(config.protocol_version, "1.4");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Protocol version requested in negotiate. The server must answer with
    /// exactly the same version.
    pub protocol_version: String,
    /// How often the heartbeat checks keep-alive and activity.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Delay between a detected connection loss and the reconnect attempt.
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    /// Extra `key=value&...` pairs appended to every request.
    pub query_string: Option<String>,
    /// Capacity of the broadcast channel carrying
    /// [`ConnectionEvent`](crate::ConnectionEvent)s. Slow subscribers lag and
    /// miss events rather than blocking the connection.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            query_string: None,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the extra query string. A leading `?` or `&` is ignored.
    #[must_use]
    pub fn with_query_string(mut self, query: impl Into<String>) -> Self {
        self.query_string = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
