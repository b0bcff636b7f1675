//! Broker connection and subscription lifetime settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Smallest idle auto-delete window a broker accepts.
pub const MIN_IDLE_AUTO_DELETE_SECS: u64 = 5 * 60;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackplaneSettings {
    /// Opaque broker address. `memory://` selects the in-process broker.
    pub connection_string: String,
    /// Shared topic every node publishes to.
    pub topic_name: String,
    /// Seconds without a receiver before the broker drops a node's
    /// subscription.
    pub idle_auto_delete_secs: u64,
    /// Seconds a queued envelope stays deliverable.
    pub message_ttl_secs: u64,
}

impl Default for BackplaneSettings {
    fn default() -> Self {
        Self {
            connection_string: "memory://local".to_string(),
            topic_name: "hubmesh".to_string(),
            idle_auto_delete_secs: 24 * 60 * 60,
            message_ttl_secs: 60 * 60,
        }
    }
}

impl BackplaneSettings {
    pub fn idle_auto_delete(&self) -> Duration {
        Duration::from_secs(self.idle_auto_delete_secs)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(SettingsError::invalid(
                "backplane.connectionString",
                "must not be empty",
            ));
        }
        if self.topic_name.trim().is_empty() {
            return Err(SettingsError::invalid("backplane.topicName", "must not be empty"));
        }
        if self.idle_auto_delete_secs < MIN_IDLE_AUTO_DELETE_SECS {
            return Err(SettingsError::invalid(
                "backplane.idleAutoDeleteSecs",
                format!(
                    "must be at least {MIN_IDLE_AUTO_DELETE_SECS}, got {}",
                    self.idle_auto_delete_secs
                ),
            ));
        }
        if self.message_ttl_secs == 0 {
            return Err(SettingsError::invalid(
                "backplane.messageTtlSecs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
