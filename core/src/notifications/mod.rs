//! Notification bell: merged realtime and push deliveries

pub mod feed;

pub use feed::{
    FeedError, FeedItem, MarkAllReport, NotificationEvent, NotificationFeed, ReadState,
    DEFAULT_FEED_CAPACITY,
};
