// Store module: durable local state and the offline location queue

pub mod backend;
pub mod queue;
pub mod retry;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
pub use queue::{
    FailureReason, FlushReport, LocationQueue, QueueConfig, QueueDriver, QueueError, QueueStats,
    QueueStatus, QueuedLocationUpdate, SubmitOutcome,
};
pub use retry::RetryPolicy;
