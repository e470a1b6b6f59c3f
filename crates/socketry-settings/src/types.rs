//! Settings types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketrySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-connection liveness settings.
    pub heartbeat: HeartbeatSettings,
}

impl SocketrySettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidField {
                field: "server.host",
                reason: "must not be empty",
            });
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidField {
                field: "server.maxMessageSize",
                reason: "must be greater than 0",
            });
        }
        self.heartbeat.validate()
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` = auto-assign).
    pub port: u16,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Heartbeat monitor settings, supplied with every accepted connection.
///
/// A connection that delivers no frame of any kind for
/// `interval × try_times` is torn down on the next tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Tick interval in milliseconds.
    pub interval_ms: u64,
    /// Number of silent intervals tolerated before teardown.
    pub try_times: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            try_times: 3,
        }
    }
}

impl HeartbeatSettings {
    /// Build from a tick interval and tolerated miss count.
    pub fn new(interval: Duration, try_times: u32) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            try_times,
        }
    }

    /// Tick interval (at least one millisecond).
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Tolerated miss count (at least one).
    pub fn try_times(&self) -> u32 {
        self.try_times.max(1)
    }

    /// Maximum silence before a connection is considered dead.
    pub fn threshold(&self) -> Duration {
        self.interval().saturating_mul(self.try_times())
    }

    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(SettingsError::InvalidField {
                field: "heartbeat.intervalMs",
                reason: "must be greater than 0",
            });
        }
        if self.try_times == 0 {
            return Err(SettingsError::InvalidField {
                field: "heartbeat.tryTimes",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}
