// RVOIS volunteer tracker core
//
// Location capture with accuracy and service-area checks, an offline queue
// that survives restarts and replays on reconnect, realtime table
// subscriptions and push notification plumbing.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod location;
pub mod notifications;
pub mod push;
pub mod realtime;
pub mod store;
pub mod tracking;

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use backend::{LocationSink, NotificationBackend, PushRegistry, RestClient, SendError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, TrackerConfig};
pub use error::{ErrorKind, RvoisError};
pub use location::{
    validate, CaptureError, GeolocationProvider, Geolocator, LocationSample, ValidationError,
};
pub use notifications::{NotificationEvent, NotificationFeed};
pub use push::{PushBridge, PushError, PushWorker};
pub use realtime::{
    ChangeEvent, ConnectionState, RealtimeClient, SubscriptionHandle, TopicFilter,
};
pub use store::{LocationQueue, QueueStats, StorageBackend};
pub use tracking::{BackgroundTracker, TrackerHandle, TrackerStats, TrackingError};

use realtime::{ReconnectHookHandle, RealtimeTransport, WebSocketTransport};
use store::{MemoryStorage, QueueDriver, SledStorage};

/// How long the queue driver sleeps when nothing is due
pub const QUEUE_IDLE_POLL: Duration = Duration::from_secs(30);
/// Notifications fetched when the bell (re)syncs
pub const NOTIFICATION_FETCH_LIMIT: usize = 50;

// ============================================================================
// COMPONENT WIRING
// ============================================================================

/// The collaborators the core is assembled from. Production code gets these
/// from [`RvoisCore::open`]; tests pass in-memory ones.
pub struct CoreParts {
    pub storage: Arc<dyn StorageBackend>,
    pub sink: Arc<dyn LocationSink>,
    pub notifications: Arc<dyn NotificationBackend>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub clock: Arc<dyn Clock>,
}

/// Everything a signed-in volunteer's device runs, behind one handle.
pub struct RvoisCore {
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    rest: Option<Arc<RestClient>>,
    realtime: Arc<RealtimeClient>,
    queue: Arc<LocationQueue>,
    feed: Arc<NotificationFeed>,
    driver: Mutex<Option<QueueDriver>>,
    tracker: Mutex<Option<TrackerHandle>>,
    feed_subscription: Mutex<Option<(SubscriptionHandle, ReconnectHookHandle)>>,
}

impl RvoisCore {
    /// Build the production stack: REST backend, websocket realtime and a
    /// sled store under `data_dir` (in-memory when `None`).
    pub fn open(config: TrackerConfig, data_dir: Option<&Path>) -> Result<Self, RvoisError> {
        config.validate()?;

        let storage: Arc<dyn StorageBackend> = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                    path: dir.display().to_string(),
                    source,
                })?;
                Arc::new(SledStorage::open(dir.join("store"))?)
            }
            None => Arc::new(MemoryStorage::new()),
        };

        let rest = Arc::new(RestClient::new(config.backend.clone())?);
        let endpoint = realtime::realtime_endpoint(&config.backend.base_url)?;
        let transport = Arc::new(WebSocketTransport::new(&endpoint, &config.backend.api_key)?);

        let parts = CoreParts {
            storage,
            sink: rest.clone(),
            notifications: rest.clone(),
            transport,
            clock: Arc::new(SystemClock),
        };
        let mut core = Self::assemble(config, parts)?;
        core.rest = Some(rest);
        Ok(core)
    }

    pub fn assemble(config: TrackerConfig, parts: CoreParts) -> Result<Self, RvoisError> {
        let realtime = Arc::new(RealtimeClient::new(parts.transport, config.realtime.clone()));
        realtime.set_access_token(config.backend.access_token.clone());

        let queue = Arc::new(LocationQueue::open(
            parts.storage,
            parts.sink,
            Arc::clone(&parts.clock),
            realtime.state_reader(),
            config.queue.clone(),
        )?);
        let feed = Arc::new(NotificationFeed::new(
            parts.notifications,
            Arc::clone(&parts.clock),
        ));

        Ok(Self {
            config,
            clock: parts.clock,
            rest: None,
            realtime,
            queue,
            feed,
            driver: Mutex::new(None),
            tracker: Mutex::new(None),
            feed_subscription: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn user_id(&self) -> Result<&str, RvoisError> {
        self.config.user_id.as_deref().ok_or_else(|| {
            RvoisError::Config(ConfigError::Invalid {
                field: "user_id",
                reason: "no volunteer is signed in".into(),
            })
        })
    }

    pub fn queue(&self) -> &Arc<LocationQueue> {
        &self.queue
    }

    pub fn realtime(&self) -> &Arc<RealtimeClient> {
        &self.realtime
    }

    pub fn feed(&self) -> &Arc<NotificationFeed> {
        &self.feed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.realtime.state()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect realtime and start replaying the offline queue. The first
    /// connect failure is returned; the queue keeps working offline.
    pub async fn connect(&self) -> Result<(), RvoisError> {
        {
            let mut driver = self.driver.lock();
            if driver.is_none() {
                *driver = Some(QueueDriver::spawn(Arc::clone(&self.queue), QUEUE_IDLE_POLL));
            }
        }
        self.realtime.connect().await?;
        if !self.queue.is_empty() {
            self.queue.on_network_restored().await;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.realtime.disconnect().await;
    }

    /// Start periodic location sharing for the signed-in volunteer.
    /// Replaces a tracker that is already running.
    pub fn start_tracking<E>(
        &self,
        provider: Arc<dyn GeolocationProvider>,
        on_error: E,
    ) -> Result<(), RvoisError>
    where
        E: FnMut(TrackingError) + Send + 'static,
    {
        let user_id = self.user_id()?.to_string();
        let geolocator = Geolocator::new(provider, user_id, Arc::clone(&self.clock));
        let handle = BackgroundTracker::start(
            geolocator,
            self.config.validator.clone(),
            Arc::clone(&self.queue),
            self.config.tracking.clone(),
            on_error,
        );
        if let Some(previous) = self.tracker.lock().replace(handle) {
            previous.stop();
        }
        Ok(())
    }

    pub fn stop_tracking(&self) {
        if let Some(handle) = self.tracker.lock().take() {
            handle.stop();
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker
            .lock()
            .as_ref()
            .is_some_and(TrackerHandle::is_running)
    }

    pub fn tracker_stats(&self) -> Option<TrackerStats> {
        self.tracker.lock().as_ref().map(TrackerHandle::stats)
    }

    /// Keep the notification bell live: subscribe to the volunteer's rows
    /// and refetch the list after every reconnect.
    pub async fn watch_notifications(&self) -> Result<(), RvoisError> {
        let user_id = self.user_id()?.to_string();
        let filter = TopicFilter::table(self.config.backend.notifications_table.clone())
            .where_eq("user_id", &user_id);

        let feed = Arc::clone(&self.feed);
        let subscription = self.realtime.subscribe(filter, move |change| {
            feed.apply_change(&change);
        });

        let hook = match &self.rest {
            Some(rest) => {
                self.sync_notifications(rest, &user_id).await;
                let rest = Arc::clone(rest);
                let feed = Arc::clone(&self.feed);
                self.realtime.on_reconnect(move || {
                    let rest = Arc::clone(&rest);
                    let feed = Arc::clone(&feed);
                    let user_id = user_id.clone();
                    tokio::spawn(async move {
                        match rest.fetch_notifications(&user_id, NOTIFICATION_FETCH_LIMIT).await {
                            Ok(events) => feed.reconcile(events),
                            Err(e) => tracing::warn!("Notification resync failed: {}", e),
                        }
                    });
                })
            }
            None => self.realtime.on_reconnect(|| {}),
        };

        *self.feed_subscription.lock() = Some((subscription, hook));
        Ok(())
    }

    async fn sync_notifications(&self, rest: &RestClient, user_id: &str) {
        match rest.fetch_notifications(user_id, NOTIFICATION_FETCH_LIMIT).await {
            Ok(events) => self.feed.reconcile(events),
            Err(e) => tracing::warn!("Initial notification fetch failed: {}", e),
        }
    }

    /// Stop everything. Queued updates stay on disk for the next start.
    pub async fn shutdown(&self) {
        self.stop_tracking();
        if let Some((subscription, hook)) = self.feed_subscription.lock().take() {
            subscription.unsubscribe();
            hook.remove();
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.stop();
        }
        self.realtime.disconnect().await;
        tracing::info!("RVOIS core shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockLocationSink, MockNotificationBackend};
    use crate::location::providers::FixedPositionProvider;
    use crate::realtime::MemoryTransport;

    fn core_with(sink: MockLocationSink, user: Option<&str>) -> (RvoisCore, realtime::MemoryServer) {
        let (transport, server) = MemoryTransport::pair();
        let config = TrackerConfig {
            user_id: user.map(str::to_string),
            ..Default::default()
        };
        let parts = CoreParts {
            storage: Arc::new(MemoryStorage::new()),
            sink: Arc::new(sink),
            notifications: Arc::new(MockNotificationBackend::new()),
            transport: Arc::new(transport),
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
        };
        (RvoisCore::assemble(config, parts).unwrap(), server)
    }

    #[tokio::test]
    async fn test_tracking_requires_user() {
        let (core, _server) = core_with(MockLocationSink::new(), None);
        let clock = Arc::new(ManualClock::new(0));
        let provider = Arc::new(FixedPositionProvider::new(10.7, 122.9, 5.0, clock));
        let err = core.start_tracking(provider, |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!core.is_tracking());
    }

    #[tokio::test]
    async fn test_offline_tracking_queues_samples() {
        let mut sink = MockLocationSink::new();
        sink.expect_send_location().never();
        let (core, _server) = core_with(sink, Some("vol-1"));
        let clock = Arc::new(ManualClock::new(0));
        let provider = Arc::new(FixedPositionProvider::new(10.7, 122.9, 5.0, clock));

        core.start_tracking(provider, |_| {}).unwrap();
        assert!(core.is_tracking());
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.stop_tracking();

        assert_eq!(core.connection_state(), ConnectionState::Disconnected);
        assert_eq!(core.queue().stats().queue_size, 1);
        assert!(!core.is_tracking());
    }
}
