//! Push notifications: device registration and incoming message handling

pub mod bridge;
pub mod worker;

pub use bridge::{
    PlatformSubscription, PushBridge, PushError, PushKeys, PushPlatform, PushSubscriptionRecord,
    SessionProvider,
};
pub use worker::{
    DisplayNotification, NotificationHandler, NotificationSink, PushPayload, PushWorker,
    WorkerError,
};
