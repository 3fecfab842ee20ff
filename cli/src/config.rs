// Configuration management for the rvois CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/rvois/config.json
// - Linux: ~/.config/rvois/config.json
// - Windows: %APPDATA%\rvois\config.json
//
// Secrets can come from the environment instead of the file.

use anyhow::{Context, Result};
use rvois_core::location::ServiceArea;
use rvois_core::TrackerConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_API_KEY: &str = "RVOIS_API_KEY";
pub const ENV_ACCESS_TOKEN: &str = "RVOIS_ACCESS_TOKEN";

/// Keys accepted by `config set` / `config get`
pub const KEYS: &[&str] = &[
    "user_id",
    "backend.base_url",
    "backend.api_key",
    "backend.access_token",
    "backend.locations_table",
    "backend.notifications_table",
    "backend.push_table",
    "tracking.interval_secs",
    "tracking.high_accuracy",
    "tracking.timeout_secs",
    "validator.max_accuracy_m",
    "validator.service_area",
    "queue.max_attempts",
    "queue.base_delay_secs",
    "queue.max_delay_secs",
    "queue.max_items",
    "queue.per_user_ordering",
    "realtime.heartbeat_secs",
    "realtime.max_reconnect_attempts",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub tracker: TrackerConfig,
    path: PathBuf,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("rvois");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("rvois");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let tracker = if path.exists() {
            TrackerConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?
        } else {
            let tracker = TrackerConfig::default();
            tracker
                .save(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            tracker
        };
        Ok(Self {
            tracker,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        self.tracker
            .save(&self.path)
            .context("Failed to write config file")
    }

    /// The config components run with: file values plus environment
    /// overrides. Overrides are never written back to disk.
    pub fn effective(&self) -> TrackerConfig {
        self.effective_with(|name| std::env::var(name).ok())
    }

    fn effective_with<F: Fn(&str) -> Option<String>>(&self, env: F) -> TrackerConfig {
        let mut tracker = self.tracker.clone();
        if let Some(key) = env(ENV_API_KEY).filter(|v| !v.is_empty()) {
            tracker.backend.api_key = key;
        }
        if let Some(token) = env(ENV_ACCESS_TOKEN).filter(|v| !v.is_empty()) {
            tracker.backend.access_token = Some(token);
        }
        tracker
    }

    /// Set a config value, validate the result and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.tracker.clone();
        apply(&mut next, key, value)?;
        next.validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        self.tracker = next;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        let t = &self.tracker;
        let value = match key {
            "user_id" => t.user_id.clone().unwrap_or_default(),
            "backend.base_url" => t.backend.base_url.clone(),
            "backend.api_key" => t.backend.api_key.clone(),
            "backend.access_token" => t.backend.access_token.clone().unwrap_or_default(),
            "backend.locations_table" => t.backend.locations_table.clone(),
            "backend.notifications_table" => t.backend.notifications_table.clone(),
            "backend.push_table" => t.backend.push_table.clone(),
            "tracking.interval_secs" => t.tracking.interval.as_secs().to_string(),
            "tracking.high_accuracy" => t.tracking.capture.high_accuracy.to_string(),
            "tracking.timeout_secs" => t.tracking.capture.timeout.as_secs().to_string(),
            "validator.max_accuracy_m" => t.validator.max_accuracy_m.to_string(),
            "validator.service_area" => match &t.validator.service_area {
                Some(area) => serde_json::to_string(area).ok()?,
                None => "none".to_string(),
            },
            "queue.max_attempts" => t.queue.retry.max_attempts.to_string(),
            "queue.base_delay_secs" => t.queue.retry.base_delay.as_secs().to_string(),
            "queue.max_delay_secs" => t.queue.retry.max_delay.as_secs().to_string(),
            "queue.max_items" => t.queue.max_items.to_string(),
            "queue.per_user_ordering" => t.queue.per_user_ordering.to_string(),
            "realtime.heartbeat_secs" => t.realtime.heartbeat_interval.as_secs().to_string(),
            "realtime.max_reconnect_attempts" => t.realtime.max_reconnect_attempts.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// List all config values; secrets are masked
    pub fn list(&self) -> Vec<(String, String)> {
        KEYS.iter()
            .map(|key| {
                let value = self.get(key).unwrap_or_default();
                let shown = if is_secret(key) {
                    mask(&value)
                } else if value.is_empty() {
                    "(unset)".to_string()
                } else {
                    value
                };
                (key.to_string(), shown)
            })
            .collect()
    }
}

fn is_secret(key: &str) -> bool {
    matches!(key, "backend.api_key" | "backend.access_token")
}

fn mask(value: &str) -> String {
    if value.is_empty() {
        "(unset)".to_string()
    } else {
        let tail: String = value.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("****{}", tail)
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn secs(value: &str) -> Result<Duration> {
    Ok(Duration::from_secs(value.parse().context("Invalid number of seconds")?))
}

fn apply(t: &mut TrackerConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "user_id" => t.user_id = optional(value),
        "backend.base_url" => t.backend.base_url = value.trim_end_matches('/').to_string(),
        "backend.api_key" => t.backend.api_key = value.to_string(),
        "backend.access_token" => t.backend.access_token = optional(value),
        "backend.locations_table" => t.backend.locations_table = value.to_string(),
        "backend.notifications_table" => t.backend.notifications_table = value.to_string(),
        "backend.push_table" => t.backend.push_table = value.to_string(),
        "tracking.interval_secs" => t.tracking.interval = secs(value)?,
        "tracking.high_accuracy" => {
            t.tracking.capture.high_accuracy = value.parse().context("Invalid boolean value")?;
        }
        "tracking.timeout_secs" => t.tracking.capture.timeout = secs(value)?,
        "validator.max_accuracy_m" => {
            t.validator.max_accuracy_m = value.parse().context("Invalid number")?;
        }
        "validator.service_area" => {
            t.validator.service_area = if value.is_empty() || value == "none" {
                None
            } else {
                Some(
                    serde_json::from_str::<ServiceArea>(value)
                        .context("Service area must be a polygon or bounding_box JSON object")?,
                )
            };
        }
        "queue.max_attempts" => {
            t.queue.retry.max_attempts = value.parse().context("Invalid number")?;
        }
        "queue.base_delay_secs" => t.queue.retry.base_delay = secs(value)?,
        "queue.max_delay_secs" => t.queue.retry.max_delay = secs(value)?,
        "queue.max_items" => t.queue.max_items = value.parse().context("Invalid number")?,
        "queue.per_user_ordering" => {
            t.queue.per_user_ordering = value.parse().context("Invalid boolean value")?;
        }
        "realtime.heartbeat_secs" => t.realtime.heartbeat_interval = secs(value)?,
        "realtime.max_reconnect_attempts" => {
            t.realtime.max_reconnect_attempts = value.parse().context("Invalid number")?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    Ok(())
}
