// Location samples: one geolocation reading at a point in time

use serde::{Deserialize, Serialize};

/// A raw fix as reported by the platform geolocation API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    /// Platform time of measurement (unix ms)
    pub timestamp: u64,
}

/// A geolocation reading attributed to a volunteer.
///
/// Samples are immutable once created: fields are private and queue entries
/// carry a copy rather than a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    user_id: String,
    latitude: f64,
    longitude: f64,
    accuracy: f64,
    heading: Option<f64>,
    speed: Option<f64>,
    captured_at: u64,
}

impl LocationSample {
    pub fn new(
        user_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        accuracy: f64,
        captured_at: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            latitude,
            longitude,
            accuracy,
            heading: None,
            speed: None,
            captured_at,
        }
    }

    /// Build a sample from a platform fix. `captured_at` is the fix time.
    pub fn from_position(user_id: impl Into<String>, position: &Position) -> Self {
        Self {
            user_id: user_id.into(),
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy: position.accuracy,
            heading: position.heading,
            speed: position.speed,
            captured_at: position.timestamp,
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    pub fn captured_at(&self) -> u64 {
        self.captured_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_position_keeps_platform_time() {
        let pos = Position {
            latitude: 10.7,
            longitude: 122.9,
            accuracy: 12.0,
            heading: Some(90.0),
            speed: None,
            timestamp: 42,
        };
        let sample = LocationSample::from_position("vol-1", &pos);
        assert_eq!(sample.captured_at(), 42);
        assert_eq!(sample.heading(), Some(90.0));
        assert_eq!(sample.speed(), None);
        assert_eq!(sample.user_id(), "vol-1");
    }

    #[test]
    fn test_bincode_round_trip() {
        let sample = LocationSample::new("vol-1", 1.0, 2.0, 3.0, 4).with_speed(1.5);
        let bytes = bincode::serialize(&sample).unwrap();
        let back: LocationSample = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, sample);
    }
}
