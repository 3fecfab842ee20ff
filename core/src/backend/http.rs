//! REST client for the managed backend.
//!
//! Speaks the PostgREST dialect: one JSON endpoint per table under
//! `/rest/v1/`, filters as `column=eq.value` query parameters. Authentication
//! is the project API key plus the volunteer's bearer token when signed in.

use super::{LocationSink, NotificationBackend, PushRegistry, SendError};
use crate::clock::to_rfc3339;
use crate::location::sample::LocationSample;
use crate::notifications::feed::NotificationEvent;
use crate::push::bridge::PushSubscriptionRecord;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid backend configuration: {0}")]
pub struct BackendSetupError(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    /// Public API key sent with every request
    pub api_key: String,
    /// Signed-in volunteer's token; the API key is used when absent
    pub access_token: Option<String>,
    pub locations_table: String,
    pub push_table: String,
    pub notifications_table: String,
    /// Path of the server function that sends a test push
    pub push_test_path: String,
    #[serde(with = "crate::clock::duration_ms")]
    pub request_timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            locations_table: "volunteer_locations".to_string(),
            push_table: "push_subscriptions".to_string(),
            notifications_table: "notifications".to_string(),
            push_test_path: "/api/push/test".to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Serialize)]
struct LocationRow<'a> {
    user_id: &'a str,
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    captured_at: String,
}

impl<'a> From<&'a LocationSample> for LocationRow<'a> {
    fn from(sample: &'a LocationSample) -> Self {
        Self {
            user_id: sample.user_id(),
            latitude: sample.latitude(),
            longitude: sample.longitude(),
            accuracy: sample.accuracy(),
            heading: sample.heading(),
            speed: sample.speed(),
            captured_at: to_rfc3339(sample.captured_at()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    config: RestConfig,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, BackendSetupError> {
        if config.base_url.is_empty() {
            return Err(BackendSetupError("base_url is not set".into()));
        }
        let header = |value: &str, what: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| BackendSetupError(format!("invalid {} header value: {}", what, e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert("apikey", header(&config.api_key, "apikey")?);
        let bearer = config.access_token.as_deref().unwrap_or(&config.api_key);
        headers.insert(
            AUTHORIZATION,
            header(&format!("Bearer {}", bearer), "authorization")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendSetupError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table
        )
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, SendError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::Timeout
            } else {
                SendError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("Backend answered HTTP {}: {}", status.as_u16(), body);
        Err(SendError::from_status(status.as_u16(), body))
    }

    /// Latest notifications for a volunteer, newest first. Used to refetch
    /// after a realtime reconnect.
    pub async fn fetch_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, SendError> {
        let request = self
            .client
            .get(self.table_url(&self.config.notifications_table))
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ]);
        let rows: Vec<Value> = self
            .execute(request)
            .await?
            .json()
            .await
            .map_err(|e| SendError::Network(format!("unreadable response: {}", e)))?;
        Ok(rows.iter().filter_map(NotificationEvent::from_row).collect())
    }
}

#[async_trait]
impl LocationSink for RestClient {
    async fn send_location(&self, sample: &LocationSample) -> Result<(), SendError> {
        let request = self
            .client
            .post(self.table_url(&self.config.locations_table))
            .header("Prefer", "return=minimal")
            .json(&LocationRow::from(sample));
        self.execute(request).await?;
        tracing::debug!("Location for {} written", sample.user_id());
        Ok(())
    }
}

#[async_trait]
impl PushRegistry for RestClient {
    async fn register(&self, record: &PushSubscriptionRecord) -> Result<(), SendError> {
        let body = json!({
            "user_id": record.user_id,
            "endpoint": record.endpoint,
            "p256dh": record.keys.p256dh,
            "auth": record.keys.auth,
            "created_at": to_rfc3339(record.created_at),
        });
        let request = self
            .client
            .post(self.table_url(&self.config.push_table))
            .query(&[("on_conflict", "endpoint")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body);
        self.execute(request).await?;
        Ok(())
    }

    async fn unregister(&self, user_id: &str, endpoint: &str) -> Result<(), SendError> {
        let request = self
            .client
            .delete(self.table_url(&self.config.push_table))
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                ("endpoint", format!("eq.{}", endpoint)),
            ]);
        self.execute(request).await?;
        Ok(())
    }

    async fn send_test(&self, user_id: &str) -> Result<(), SendError> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.push_test_path.trim_start_matches('/')
        );
        let request = self.client.post(url).json(&json!({ "user_id": user_id }));
        match self.execute(request).await {
            Ok(_) => Ok(()),
            Err(SendError::Rejected { status, .. }) if status == 404 || status == 410 => {
                Err(SendError::Gone { status })
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl NotificationBackend for RestClient {
    async fn mark_read(&self, notification_id: &str, read_at: u64) -> Result<(), SendError> {
        let request = self
            .client
            .patch(self.table_url(&self.config.notifications_table))
            .query(&[("id", format!("eq.{}", notification_id))])
            .header("Prefer", "return=minimal")
            .json(&json!({ "read_at": to_rfc3339(read_at) }));
        self.execute(request).await?;
        Ok(())
    }
}
