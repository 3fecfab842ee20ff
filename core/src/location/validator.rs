//! Boundary and accuracy validation for location samples.
//!
//! [`validate`] is a pure function: the same sample and config always give
//! the same verdict. Rejected samples are never queued; the caller gets a
//! [`ValidationError`] it can show to the volunteer.

use crate::location::sample::LocationSample;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default worst acceptable accuracy radius
pub const DEFAULT_MAX_ACCURACY_M: f64 = 100.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Your position ({latitude:.5}, {longitude:.5}) is outside the service area; location sharing only covers the municipality")]
    OutOfBounds { latitude: f64, longitude: f64 },
    #[error("Location accuracy is too low ({accuracy_m:.0} m, need {max_accuracy_m:.0} m or better); move to open sky or enable high-accuracy mode")]
    AccuracyTooLow { accuracy_m: f64, max_accuracy_m: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// The configured service area (geofence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceArea {
    Polygon {
        vertices: Vec<GeoPoint>,
    },
    BoundingBox {
        min_latitude: f64,
        max_latitude: f64,
        min_longitude: f64,
        max_longitude: f64,
    },
}

impl ServiceArea {
    pub fn polygon(vertices: Vec<GeoPoint>) -> Self {
        ServiceArea::Polygon { vertices }
    }

    /// Whether the point lies inside the area.
    ///
    /// Polygons use ray casting; points exactly on an edge may land either
    /// way. Bounding boxes include their edges.
    pub fn contains(&self, point: GeoPoint) -> bool {
        match self {
            ServiceArea::Polygon { vertices } => point_in_polygon(point, vertices),
            ServiceArea::BoundingBox {
                min_latitude,
                max_latitude,
                min_longitude,
                max_longitude,
            } => {
                point.latitude >= *min_latitude
                    && point.latitude <= *max_latitude
                    && point.longitude >= *min_longitude
                    && point.longitude <= *max_longitude
            }
        }
    }

    /// Structural check used by config validation.
    pub fn check(&self) -> Result<(), String> {
        match self {
            ServiceArea::Polygon { vertices } => {
                if vertices.len() < 3 {
                    return Err(format!(
                        "service area polygon needs at least 3 vertices, got {}",
                        vertices.len()
                    ));
                }
                if vertices
                    .iter()
                    .any(|v| !valid_coordinates(v.latitude, v.longitude))
                {
                    return Err("service area polygon has an invalid vertex".to_string());
                }
                Ok(())
            }
            ServiceArea::BoundingBox {
                min_latitude,
                max_latitude,
                min_longitude,
                max_longitude,
            } => {
                if !valid_coordinates(*min_latitude, *min_longitude)
                    || !valid_coordinates(*max_latitude, *max_longitude)
                {
                    return Err("service area bounding box has invalid corners".to_string());
                }
                if min_latitude >= max_latitude || min_longitude >= max_longitude {
                    return Err("service area bounding box is empty".to_string());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// No area means any valid coordinate is accepted
    pub service_area: Option<ServiceArea>,
    /// Worst acceptable accuracy radius in meters
    pub max_accuracy_m: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            service_area: None,
            max_accuracy_m: DEFAULT_MAX_ACCURACY_M,
        }
    }
}

/// Validate a sample against the accuracy threshold and service area.
///
/// Accuracy is checked first: a fix that cannot be trusted cannot be placed
/// inside or outside the area either.
pub fn validate(sample: &LocationSample, config: &ValidatorConfig) -> Result<(), ValidationError> {
    let accuracy = sample.accuracy();
    if !accuracy.is_finite() || accuracy < 0.0 || accuracy > config.max_accuracy_m {
        return Err(ValidationError::AccuracyTooLow {
            accuracy_m: accuracy,
            max_accuracy_m: config.max_accuracy_m,
        });
    }

    let (latitude, longitude) = (sample.latitude(), sample.longitude());
    let out_of_bounds = ValidationError::OutOfBounds {
        latitude,
        longitude,
    };
    if !valid_coordinates(latitude, longitude) {
        return Err(out_of_bounds);
    }
    if let Some(area) = &config.service_area {
        if !area.contains(GeoPoint::new(latitude, longitude)) {
            return Err(out_of_bounds);
        }
    }
    Ok(())
}

fn valid_coordinates(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

fn point_in_polygon(point: GeoPoint, vertices: &[GeoPoint]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let (x, y) = (point.longitude, point.latitude);
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (xi, yi) = (vertices[i].longitude, vertices[i].latitude);
        let (xj, yj) = (vertices[j].longitude, vertices[j].latitude);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Unit square in (lon, lat) from (0,0) to (1,1)
    fn square() -> ServiceArea {
        ServiceArea::polygon(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ])
    }

    fn config(max_accuracy_m: f64) -> ValidatorConfig {
        ValidatorConfig {
            service_area: Some(square()),
            max_accuracy_m,
        }
    }

    fn sample(lat: f64, lon: f64, accuracy: f64) -> LocationSample {
        LocationSample::new("vol-1", lat, lon, accuracy, 0)
    }

    #[test]
    fn test_inside_polygon_accepted() {
        assert_eq!(validate(&sample(0.5, 0.5, 10.0), &config(50.0)), Ok(()));
    }

    #[test]
    fn test_outside_polygon_rejected() {
        let err = validate(&sample(1.5, 0.5, 10.0), &config(50.0)).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfBounds { .. }));
    }

    #[test]
    fn test_concave_polygon_notch_is_outside() {
        // U shape with the notch between lon 0.4..0.6 above lat 0.5
        let area = ServiceArea::polygon(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.6),
            GeoPoint::new(0.5, 0.6),
            GeoPoint::new(0.5, 0.4),
            GeoPoint::new(1.0, 0.4),
            GeoPoint::new(1.0, 0.0),
        ]);
        assert!(area.contains(GeoPoint::new(0.2, 0.5)));
        assert!(area.contains(GeoPoint::new(0.8, 0.2)));
        assert!(!area.contains(GeoPoint::new(0.8, 0.5)));
    }

    #[test]
    fn test_accuracy_checked_before_bounds() {
        let err = validate(&sample(5.0, 5.0, 500.0), &config(50.0)).unwrap_err();
        assert!(matches!(err, ValidationError::AccuracyTooLow { .. }));
    }

    #[test]
    fn test_accuracy_equal_to_threshold_accepted() {
        assert!(validate(&sample(0.5, 0.5, 50.0), &config(50.0)).is_ok());
    }

    #[test]
    fn test_nan_accuracy_rejected() {
        let err = validate(&sample(0.5, 0.5, f64::NAN), &config(50.0)).unwrap_err();
        assert!(matches!(err, ValidationError::AccuracyTooLow { .. }));
    }

    #[test]
    fn test_invalid_coordinates_out_of_bounds_without_area() {
        let cfg = ValidatorConfig::default();
        assert!(matches!(
            validate(&sample(95.0, 10.0, 5.0), &cfg),
            Err(ValidationError::OutOfBounds { .. })
        ));
        assert!(validate(&sample(45.0, 10.0, 5.0), &cfg).is_ok());
    }

    #[test]
    fn test_bounding_box() {
        let cfg = ValidatorConfig {
            service_area: Some(ServiceArea::BoundingBox {
                min_latitude: 10.0,
                max_latitude: 11.0,
                min_longitude: 122.0,
                max_longitude: 123.0,
            }),
            max_accuracy_m: 100.0,
        };
        assert!(validate(&sample(10.5, 122.5, 5.0), &cfg).is_ok());
        assert!(validate(&sample(11.5, 122.5, 5.0), &cfg).is_err());
    }

    #[test]
    fn test_area_check() {
        assert!(square().check().is_ok());
        assert!(ServiceArea::polygon(vec![GeoPoint::new(0.0, 0.0)]).check().is_err());
        let empty = ServiceArea::BoundingBox {
            min_latitude: 1.0,
            max_latitude: 1.0,
            min_longitude: 0.0,
            max_longitude: 2.0,
        };
        assert!(empty.check().is_err());
    }

    #[test]
    fn test_rejection_messages_are_actionable() {
        let err = validate(&sample(0.5, 0.5, 300.0), &config(50.0)).unwrap_err();
        assert!(err.to_string().contains("300 m"));
        let err = validate(&sample(2.0, 2.0, 5.0), &config(50.0)).unwrap_err();
        assert!(err.to_string().contains("outside the service area"));
    }

    proptest! {
        #[test]
        fn prop_accuracy_worse_than_threshold_rejected(
            lat in -1.0f64..2.0,
            lon in -1.0f64..2.0,
            threshold in 1.0f64..500.0,
            excess in 0.001f64..1000.0,
        ) {
            let verdict = validate(&sample(lat, lon, threshold + excess), &config(threshold));
            prop_assert!(
                matches!(verdict, Err(ValidationError::AccuracyTooLow { .. })),
                "verdict was {:?}",
                verdict
            );
        }

        #[test]
        fn prop_strictly_inside_accepted(lat in 0.001f64..0.999, lon in 0.001f64..0.999) {
            prop_assert_eq!(validate(&sample(lat, lon, 5.0), &config(50.0)), Ok(()));
        }

        #[test]
        fn prop_outside_rejected(
            lat in prop_oneof![-80.0f64..-0.001, 1.001f64..80.0],
            lon in -170.0f64..170.0,
        ) {
            let verdict = validate(&sample(lat, lon, 5.0), &config(50.0));
            prop_assert!(
                matches!(verdict, Err(ValidationError::OutOfBounds { .. })),
                "verdict was {:?}",
                verdict
            );
        }

        #[test]
        fn prop_validation_is_deterministic(
            lat in -2.0f64..2.0,
            lon in -2.0f64..2.0,
            accuracy in 0.0f64..200.0,
        ) {
            let s = sample(lat, lon, accuracy);
            let cfg = config(100.0);
            prop_assert_eq!(validate(&s, &cfg), validate(&s, &cfg));
        }
    }
}
