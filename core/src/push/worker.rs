// Push worker: turns incoming push payloads into displayed notifications
//
// Runs where the platform delivers push messages (a service worker in the
// browser, a background receiver elsewhere). It shows the notification,
// forwards the payload to in-app listeners and resolves clicks to the page
// the notification points at.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Tag used when the payload carries nothing to group by
pub const DEFAULT_TAG: &str = "rvois-notification";
/// Where a click lands when the payload names no page
pub const DEFAULT_URL: &str = "/";

const DEFAULT_TITLE: &str = "RVOIS";

/// Push message body as sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl PushPayload {
    fn data_str(&self, key: &str) -> Option<String> {
        match self.data.as_ref()?.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayNotification {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    /// Notifications sharing a tag replace each other
    pub tag: String,
    /// Page opened on click
    pub url: String,
    pub data: Option<Value>,
}

impl DisplayNotification {
    pub fn from_payload(payload: &PushPayload) -> Self {
        let tag = payload
            .data_str("tag")
            .or_else(|| payload.data_str("id"))
            .or_else(|| payload.data_str("type"))
            .unwrap_or_else(|| DEFAULT_TAG.to_string());
        let url = payload
            .data_str("url")
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        Self {
            title: payload.title.clone(),
            body: payload.body.clone(),
            icon: payload.icon.clone(),
            tag,
            url,
            data: payload.data.clone(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Failed to show notification: {0}")]
    Display(String),
    #[error("No shown notification with tag {0}")]
    UnknownTag(String),
}

/// Displays notifications on the platform.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: &DisplayNotification) -> Result<(), String>;
}

/// In-app listener for push deliveries (the notification bell).
pub trait NotificationHandler: Send + Sync {
    fn on_notification(&self, payload: &PushPayload);
}

pub struct PushWorker {
    sink: Arc<dyn NotificationSink>,
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
    /// url per tag for notifications currently shown
    shown: RwLock<HashMap<String, String>>,
}

impl PushWorker {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            handlers: RwLock::new(Vec::new()),
            shown: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.write().push(handler);
    }

    /// Handle a raw push message. A body that is not a JSON payload is shown
    /// as plain text under the default title.
    pub fn on_push(&self, raw: &str) -> Result<DisplayNotification, WorkerError> {
        let payload = serde_json::from_str::<PushPayload>(raw).unwrap_or_else(|e| {
            tracing::debug!("Push body is not a payload ({}); showing as text", e);
            PushPayload {
                title: DEFAULT_TITLE.to_string(),
                body: raw.to_string(),
                icon: None,
                data: None,
            }
        });
        self.on_payload(payload)
    }

    pub fn on_payload(&self, payload: PushPayload) -> Result<DisplayNotification, WorkerError> {
        let notification = DisplayNotification::from_payload(&payload);
        self.sink
            .show(&notification)
            .map_err(WorkerError::Display)?;
        self.shown
            .write()
            .insert(notification.tag.clone(), notification.url.clone());

        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler.on_notification(&payload);
        }
        tracing::debug!("Shown push notification tagged {}", notification.tag);
        Ok(notification)
    }

    /// Resolve a click on the notification with `tag` to the page to open.
    pub fn on_click(&self, tag: &str) -> Result<String, WorkerError> {
        self.shown
            .write()
            .remove(tag)
            .ok_or_else(|| WorkerError::UnknownTag(tag.to_string()))
    }

    pub fn shown_count(&self) -> usize {
        self.shown.read().len()
    }
}
