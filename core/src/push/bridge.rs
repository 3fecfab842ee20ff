// Push bridge: registers this device for server-sent notifications
//
// The bridge sits between the platform push service (permission prompt,
// subscription endpoint and keys) and the backend's subscription table. Local
// state (enabled flag plus the registered record) survives restarts so the
// settings toggle reflects reality without a round trip.

use crate::backend::{PushRegistry, SendError};
use crate::clock::Clock;
use crate::location::capture::PermissionState;
use crate::store::backend::StorageBackend;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

const PUSH_STATE_KEY: &[u8] = b"push_state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// What the platform push service hands back on subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

/// A device subscription attributed to a volunteer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscriptionRecord {
    pub endpoint: String,
    pub keys: PushKeys,
    pub user_id: String,
    pub created_at: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Sign in to enable notifications")]
    NotAuthenticated,
    #[error("Notification permission was denied. Re-enable it in the browser or system settings")]
    PermissionDenied,
    #[error("Push registration failed: {0}")]
    RegistrationFailed(String),
}

/// Platform push service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushPlatform: Send + Sync {
    fn is_supported(&self) -> bool;
    /// Current permission. Must not prompt.
    async fn permission_state(&self) -> PermissionState;
    /// Show the permission prompt and return the outcome.
    async fn request_permission(&self) -> PermissionState;
    async fn subscribe(&self) -> Result<PlatformSubscription, String>;
    async fn unsubscribe(&self) -> Result<(), String>;
}

/// Who is signed in. Session management itself lives elsewhere.
#[cfg_attr(test, mockall::automock)]
pub trait SessionProvider: Send + Sync {
    fn current_user(&self) -> Option<String>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedPushState {
    enabled: bool,
    record: Option<PushSubscriptionRecord>,
}

pub struct PushBridge {
    platform: Arc<dyn PushPlatform>,
    registry: Arc<dyn PushRegistry>,
    session: Arc<dyn SessionProvider>,
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    /// Denial sticks until the bridge is recreated
    denied: AtomicBool,
    op: tokio::sync::Mutex<()>,
}

impl PushBridge {
    pub fn new(
        platform: Arc<dyn PushPlatform>,
        registry: Arc<dyn PushRegistry>,
        session: Arc<dyn SessionProvider>,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            platform,
            registry,
            session,
            storage,
            clock,
            denied: AtomicBool::new(false),
            op: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.platform.is_supported()
    }

    /// Subscribe this device and register it with the backend.
    pub async fn enable(&self) -> Result<PushSubscriptionRecord, PushError> {
        let _op = self.op.lock().await;

        // Session first: an anonymous user must never see a permission prompt
        let user_id = self
            .session
            .current_user()
            .ok_or(PushError::NotAuthenticated)?;

        if !self.platform.is_supported() {
            return Err(PushError::RegistrationFailed(
                "push notifications are not supported on this platform".into(),
            ));
        }
        if self.denied.load(Ordering::SeqCst) {
            return Err(PushError::PermissionDenied);
        }

        let permission = match self.platform.permission_state().await {
            PermissionState::Prompt => self.platform.request_permission().await,
            state => state,
        };
        match permission {
            PermissionState::Granted => {}
            PermissionState::Denied => {
                tracing::warn!("Notification permission denied");
                self.denied.store(true, Ordering::SeqCst);
                return Err(PushError::PermissionDenied);
            }
            PermissionState::Prompt => {
                tracing::info!("Notification prompt dismissed");
                return Err(PushError::PermissionDenied);
            }
        }

        let subscription = self
            .platform
            .subscribe()
            .await
            .map_err(PushError::RegistrationFailed)?;
        let record = PushSubscriptionRecord {
            endpoint: subscription.endpoint,
            keys: subscription.keys,
            user_id,
            created_at: self.clock.now_ms(),
        };

        self.registry
            .register(&record)
            .await
            .map_err(|e| PushError::RegistrationFailed(e.to_string()))?;

        self.save(&PersistedPushState {
            enabled: true,
            record: Some(record.clone()),
        })
        .map_err(PushError::RegistrationFailed)?;

        tracing::info!("Push notifications enabled for {}", record.user_id);
        Ok(record)
    }

    /// Unsubscribe everywhere. Failures are logged; local state is always
    /// cleared.
    pub async fn disable(&self) {
        let _op = self.op.lock().await;
        let record = self.load().record;

        if let Err(e) = self.platform.unsubscribe().await {
            tracing::warn!("Platform unsubscribe failed: {}", e);
        }
        if let Some(record) = record {
            if let Err(e) = self
                .registry
                .unregister(&record.user_id, &record.endpoint)
                .await
            {
                tracing::warn!("Backend unregister failed: {}", e);
            }
        }
        self.clear_local();
        tracing::info!("Push notifications disabled");
    }

    /// Ask the backend to push a test notification to this user.
    pub async fn send_test(&self) -> Result<(), PushError> {
        let user_id = self
            .session
            .current_user()
            .ok_or(PushError::NotAuthenticated)?;
        if !self.is_enabled() {
            return Err(PushError::RegistrationFailed(
                "push notifications are not enabled".into(),
            ));
        }

        match self.registry.send_test(&user_id).await {
            Ok(()) => Ok(()),
            Err(SendError::Gone { status }) => {
                tracing::warn!("Push subscription gone (HTTP {}); clearing local state", status);
                self.clear_local();
                Err(PushError::RegistrationFailed(
                    "subscription expired; enable notifications again".into(),
                ))
            }
            Err(e) => Err(PushError::RegistrationFailed(e.to_string())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.load().enabled
    }

    pub fn current_record(&self) -> Option<PushSubscriptionRecord> {
        self.load().record
    }

    fn load(&self) -> PersistedPushState {
        match self.storage.get(PUSH_STATE_KEY) {
            Ok(Some(bytes)) => bincode::deserialize(&bytes).unwrap_or_else(|e| {
                tracing::warn!("Unreadable push state, treating as disabled: {}", e);
                PersistedPushState::default()
            }),
            Ok(None) => PersistedPushState::default(),
            Err(e) => {
                tracing::warn!("Failed to read push state: {}", e);
                PersistedPushState::default()
            }
        }
    }

    fn save(&self, state: &PersistedPushState) -> Result<(), String> {
        let bytes = bincode::serialize(state).map_err(|e| e.to_string())?;
        self.storage
            .put(PUSH_STATE_KEY, &bytes)
            .and_then(|_| self.storage.flush())
            .map_err(|e| e.to_string())
    }

    fn clear_local(&self) {
        if let Err(e) = self
            .storage
            .remove(PUSH_STATE_KEY)
            .and_then(|_| self.storage.flush())
        {
            tracing::error!("Failed to clear push state: {}", e);
        }
    }
}
