// Tracker configuration: one JSON document covering every component
//
// Every section and field has a default, so a config file only needs the
// values that differ (usually just the backend URL, key and volunteer id).

use crate::backend::RestConfig;
use crate::location::validator::ValidatorConfig;
use crate::realtime::client::RealtimeConfig;
use crate::store::queue::QueueConfig;
use crate::tracking::scheduler::TrackingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Volunteer whose location is shared
    pub user_id: Option<String>,
    pub backend: RestConfig,
    pub tracking: TrackingConfig,
    pub validator: ValidatorConfig,
    pub queue: QueueConfig,
    pub realtime: RealtimeConfig,
}

impl TrackerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = serde_json::from_str(text)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        std::fs::write(path, self.to_json()?).map_err(io)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(user) = &self.user_id {
            if user.trim().is_empty() {
                return Err(invalid("user_id", "must not be blank"));
            }
        }
        if !self.backend.base_url.is_empty() {
            url::Url::parse(&self.backend.base_url)
                .map_err(|e| invalid("backend.base_url", e.to_string()))?;
        }
        if self.backend.request_timeout.is_zero() {
            return Err(invalid("backend.request_timeout", "must be positive"));
        }

        if self.tracking.interval < Duration::from_secs(1) {
            return Err(invalid("tracking.interval", "must be at least one second"));
        }
        if self.tracking.capture.timeout.is_zero() {
            return Err(invalid("tracking.capture.timeout", "must be positive"));
        }

        let max_accuracy = self.validator.max_accuracy_m;
        if !max_accuracy.is_finite() || max_accuracy <= 0.0 {
            return Err(invalid("validator.max_accuracy_m", "must be a positive number"));
        }
        if let Some(area) = &self.validator.service_area {
            area.check()
                .map_err(|reason| invalid("validator.service_area", reason))?;
        }

        self.queue
            .retry
            .check()
            .map_err(|reason| invalid("queue.retry", reason))?;
        if self.queue.max_items == 0 {
            return Err(invalid("queue.max_items", "must be at least 1"));
        }
        if self.queue.stats_window == 0 {
            return Err(invalid("queue.stats_window", "must be at least 1"));
        }
        if self.queue.send_timeout.is_zero() {
            return Err(invalid("queue.send_timeout", "must be positive"));
        }

        if self.realtime.heartbeat_interval.is_zero() {
            return Err(invalid("realtime.heartbeat_interval", "must be positive"));
        }
        if self.realtime.reconnect_base_delay > self.realtime.reconnect_max_delay {
            return Err(invalid(
                "realtime.reconnect_base_delay",
                "must not exceed reconnect_max_delay",
            ));
        }
        Ok(())
    }
}
