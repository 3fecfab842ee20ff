// Crate-wide error classification
//
// Each component keeps its own error enum. `ErrorKind` is the shared
// vocabulary callers switch on to decide what to show and whether to retry.

use crate::backend::{BackendSetupError, SendError};
use crate::config::ConfigError;
use crate::location::capture::CaptureError;
use crate::location::validator::ValidationError;
use crate::notifications::FeedError;
use crate::push::{PushError, WorkerError};
use crate::realtime::{RealtimeError, TransportError};
use crate::store::{QueueError, StorageError};
use crate::tracking::TrackingError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
    OutOfBounds,
    AccuracyTooLow,
    /// Transport failure or server 5xx; safe to retry
    NetworkFailure,
    /// Server refused the payload; retrying cannot succeed
    ValidationRejected,
    /// Realtime connection lost; the reconnect loop takes over
    TransportDropped,
    RegistrationFailed,
    NotAuthenticated,
    Storage,
    QueueFull,
    NotFound,
    Configuration,
    Protocol,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkFailure | ErrorKind::Timeout | ErrorKind::TransportDropped
        )
    }

    /// Errors the volunteer can fix themselves (grant permission, move,
    /// sign in). These get a specific message rather than a generic one.
    pub fn is_user_actionable(self) -> bool {
        matches!(
            self,
            ErrorKind::PermissionDenied
                | ErrorKind::OutOfBounds
                | ErrorKind::AccuracyTooLow
                | ErrorKind::NotAuthenticated
        )
    }
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::PermissionDenied => ErrorKind::PermissionDenied,
            CaptureError::PositionUnavailable(_) => ErrorKind::PositionUnavailable,
            CaptureError::Timeout => ErrorKind::Timeout,
        }
    }
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            ValidationError::AccuracyTooLow { .. } => ErrorKind::AccuracyTooLow,
        }
    }
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SendError::Network(_) => ErrorKind::NetworkFailure,
            SendError::Timeout => ErrorKind::Timeout,
            SendError::Rejected { status, .. } if *status == 401 || *status == 403 => {
                ErrorKind::NotAuthenticated
            }
            SendError::Rejected { .. } => ErrorKind::ValidationRejected,
            SendError::Gone { .. } => ErrorKind::NotFound,
        }
    }
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Storage(_) | QueueError::Codec(_) => ErrorKind::Storage,
            QueueError::QueueFull { .. } => ErrorKind::QueueFull,
            QueueError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

impl RealtimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RealtimeError::Transport(_) => ErrorKind::TransportDropped,
            RealtimeError::Protocol(_) | RealtimeError::InvalidTransition(_) => {
                ErrorKind::Protocol
            }
        }
    }
}

impl PushError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PushError::NotAuthenticated => ErrorKind::NotAuthenticated,
            PushError::PermissionDenied => ErrorKind::PermissionDenied,
            PushError::RegistrationFailed(_) => ErrorKind::RegistrationFailed,
        }
    }
}

impl TrackingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackingError::Capture(e) => e.kind(),
            TrackingError::Validation(e) => e.kind(),
            TrackingError::Queue(e) => e.kind(),
        }
    }
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::NotFound(_) => ErrorKind::NotFound,
            FeedError::Backend(e) => e.kind(),
        }
    }
}

/// Any error the crate can return, for callers that hold several components.
#[derive(Debug, Error)]
pub enum RvoisError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Setup(#[from] BackendSetupError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error(transparent)]
    Push(#[from] PushError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
    #[error(transparent)]
    Feed(#[from] FeedError),
}

impl From<TransportError> for RvoisError {
    fn from(err: TransportError) -> Self {
        RvoisError::Realtime(RealtimeError::Transport(err))
    }
}

impl RvoisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RvoisError::Config(_) | RvoisError::Setup(_) => ErrorKind::Configuration,
            RvoisError::Storage(_) => ErrorKind::Storage,
            RvoisError::Capture(e) => e.kind(),
            RvoisError::Validation(e) => e.kind(),
            RvoisError::Send(e) => e.kind(),
            RvoisError::Queue(e) => e.kind(),
            RvoisError::Realtime(e) => e.kind(),
            RvoisError::Push(e) => e.kind(),
            RvoisError::Worker(_) => ErrorKind::RegistrationFailed,
            RvoisError::Tracking(e) => e.kind(),
            RvoisError::Feed(e) => e.kind(),
        }
    }
}
