// Built-in geolocation providers for hosts without a platform location API
//
// FixedPositionProvider reports a single configured point (a staffed post, a
// command center). ReplayProvider plays back a recorded track one fix per
// request, which is how field exercises are rehearsed from the CLI.

use crate::clock::Clock;
use crate::location::capture::{CaptureError, CaptureOptions, GeolocationProvider, PermissionState};
use crate::location::sample::Position;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to read track file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid track point on line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Track file contains no points")]
    Empty,
}

/// Always reports the same point, stamped with the current time.
pub struct FixedPositionProvider {
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    clock: Arc<dyn Clock>,
}

impl FixedPositionProvider {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            clock,
        }
    }
}

#[async_trait]
impl GeolocationProvider for FixedPositionProvider {
    async fn permission_state(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn current_position(&self, _options: &CaptureOptions) -> Result<Position, CaptureError> {
        Ok(Position {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            heading: None,
            speed: None,
            timestamp: self.clock.now_ms(),
        })
    }
}

/// One recorded point of a replay track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_track_accuracy")]
    pub accuracy: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

fn default_track_accuracy() -> f64 {
    10.0
}

/// Plays back a recorded track, one point per capture.
pub struct ReplayProvider {
    track: Vec<TrackPoint>,
    remaining: Mutex<VecDeque<TrackPoint>>,
    looped: bool,
    clock: Arc<dyn Clock>,
}

impl ReplayProvider {
    pub fn new(track: Vec<TrackPoint>, looped: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            remaining: Mutex::new(track.iter().copied().collect()),
            track,
            looped,
            clock,
        }
    }

    /// Load a JSON-lines track. Blank lines and `#` comments are skipped.
    pub fn from_jsonl(
        path: impl AsRef<Path>,
        looped: bool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProviderError> {
        let contents = std::fs::read_to_string(path)?;
        let mut track = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let point: TrackPoint = serde_json::from_str(line).map_err(|source| {
                ProviderError::Parse {
                    line: idx + 1,
                    source,
                }
            })?;
            track.push(point);
        }
        if track.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(Self::new(track, looped, clock))
    }

    pub fn remaining(&self) -> usize {
        self.remaining.lock().len()
    }
}

#[async_trait]
impl GeolocationProvider for ReplayProvider {
    async fn permission_state(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn current_position(&self, _options: &CaptureOptions) -> Result<Position, CaptureError> {
        let mut remaining = self.remaining.lock();
        if remaining.is_empty() && self.looped {
            remaining.extend(self.track.iter().copied());
        }
        let point = remaining
            .pop_front()
            .ok_or_else(|| CaptureError::PositionUnavailable("replay track exhausted".into()))?;
        Ok(Position {
            latitude: point.latitude,
            longitude: point.longitude,
            accuracy: point.accuracy,
            heading: point.heading,
            speed: point.speed,
            timestamp: self.clock.now_ms(),
        })
    }
}
