// Tracking module: periodic background location sharing

pub mod scheduler;

pub use scheduler::{BackgroundTracker, TrackerHandle, TrackerStats, TrackingConfig, TrackingError};
