//! Backend contracts: the REST endpoints this subsystem writes to.
//!
//! The managed backend is an external collaborator. Each endpoint is a trait
//! so the queue, push bridge and notification feed can be driven by mocks in
//! tests and by [`http::RestClient`] in production.

pub mod http;

use crate::location::sample::LocationSample;
use crate::push::bridge::PushSubscriptionRecord;
use async_trait::async_trait;
use thiserror::Error;

pub use http::{BackendSetupError, RestClient, RestConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Rejected by server (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Resource gone (HTTP {status})")]
    Gone { status: u16 },
}

impl SendError {
    /// Transport failures, timeouts and server-side errors are worth retrying;
    /// a rejected payload will be rejected again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Network(_) | SendError::Timeout)
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            408 | 429 | 500..=599 => SendError::Network(format!("HTTP {}: {}", status, body)),
            _ => SendError::Rejected {
                status,
                message: body,
            },
        }
    }
}

/// Location write endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocationSink: Send + Sync {
    async fn send_location(&self, sample: &LocationSample) -> Result<(), SendError>;
}

/// Push registration endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushRegistry: Send + Sync {
    /// Idempotent on repeated registration of the same endpoint
    async fn register(&self, record: &PushSubscriptionRecord) -> Result<(), SendError>;
    async fn unregister(&self, user_id: &str, endpoint: &str) -> Result<(), SendError>;
    /// Ask the server to push a diagnostic notification to this user
    async fn send_test(&self, user_id: &str) -> Result<(), SendError>;
}

/// Notification read-state endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    async fn mark_read(&self, notification_id: &str, read_at: u64) -> Result<(), SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(SendError::from_status(503, "busy").is_retryable());
        assert!(SendError::from_status(429, "slow down").is_retryable());
        assert!(SendError::from_status(408, "").is_retryable());
        let rejected = SendError::from_status(422, "captured_at in the future");
        assert!(!rejected.is_retryable());
        assert!(matches!(rejected, SendError::Rejected { status: 422, .. }));
        assert!(!SendError::Gone { status: 410 }.is_retryable());
    }
}
