//! Geolocation capture: one-shot and continuous sampling.
//!
//! [`Geolocator`] wraps a platform [`GeolocationProvider`] and turns its fixes
//! into [`LocationSample`]s attributed to the signed-in volunteer. It enforces
//! the capture timeout itself so a provider that never answers still yields a
//! typed [`CaptureError::Timeout`].

use crate::clock::Clock;
use crate::gate::CallbackGate;
use crate::clock::duration_ms;
use crate::location::sample::{LocationSample, Position};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shortest interval a watch will poll at
const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(250);

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Platform permission state for location access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Prompt,
    Denied,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Location permission denied. Allow location access for RVOIS in your device settings to share your position")]
    PermissionDenied,
    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("Timed out waiting for a location fix")]
    Timeout,
}

/// Options for a single capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Ask the platform for its most precise source (GPS over network)
    pub high_accuracy: bool,
    /// Upper bound on how long a capture may take
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Oldest fix that is still acceptable
    #[serde(with = "duration_ms")]
    pub maximum_age: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(15),
            maximum_age: Duration::from_secs(60),
        }
    }
}

/// Platform geolocation API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    /// Current permission state. Must not prompt.
    async fn permission_state(&self) -> PermissionState;

    /// Acquire a fix. May prompt for permission when the state is `Prompt`.
    async fn current_position(&self, options: &CaptureOptions) -> Result<Position, CaptureError>;
}

/// Captures samples for one volunteer.
#[derive(Clone)]
pub struct Geolocator {
    provider: Arc<dyn GeolocationProvider>,
    user_id: String,
    clock: Arc<dyn Clock>,
}

impl Geolocator {
    pub fn new(
        provider: Arc<dyn GeolocationProvider>,
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            user_id: user_id.into(),
            clock,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Request one sample.
    pub async fn get_current_sample(
        &self,
        options: &CaptureOptions,
    ) -> Result<LocationSample, CaptureError> {
        if self.provider.permission_state().await == PermissionState::Denied {
            return Err(CaptureError::PermissionDenied);
        }

        let position =
            match tokio::time::timeout(options.timeout, self.provider.current_position(options))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!("Geolocation timed out after {:?}", options.timeout);
                    return Err(CaptureError::Timeout);
                }
            };

        let age_ms = self.clock.now_ms().saturating_sub(position.timestamp);
        if age_ms > options.maximum_age.as_millis() as u64 {
            return Err(CaptureError::PositionUnavailable(format!(
                "latest fix is {}s old",
                age_ms / 1000
            )));
        }

        Ok(LocationSample::from_position(&self.user_id, &position))
    }

    /// Sample continuously, roughly every `interval_hint`.
    ///
    /// The callback receives every sample or typed failure. Dropping or
    /// stopping the returned handle ends the watch.
    pub fn start_watching<F>(
        &self,
        interval_hint: Duration,
        options: CaptureOptions,
        mut callback: F,
    ) -> WatchHandle
    where
        F: FnMut(Result<LocationSample, CaptureError>) + Send + 'static,
    {
        let gate = Arc::new(CallbackGate::new());
        let task_gate = Arc::clone(&gate);
        let geolocator = self.clone();
        let period = interval_hint.max(MIN_WATCH_INTERVAL);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if task_gate.is_closed() {
                    break;
                }
                let result = geolocator.get_current_sample(&options).await;
                task_gate.run(|| callback(result));
            }
        });

        let id = NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Location watch {} started ({:?})", id, period);
        WatchHandle {
            id,
            gate,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop a watch. No callback fires after this returns.
    pub fn stop_watching(&self, handle: &WatchHandle) {
        handle.stop();
    }
}

/// Handle to a running location watch.
#[derive(Debug)]
pub struct WatchHandle {
    id: u64,
    gate: Arc<CallbackGate>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stop(&self) {
        self.gate.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("Location watch {} stopped", self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.gate.is_closed()
    }

    /// Number of callbacks delivered so far
    pub fn delivered(&self) -> u64 {
        self.gate.delivered()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
