// Location module: capture, validation and built-in providers

pub mod capture;
pub mod providers;
pub mod sample;
pub mod validator;

pub use capture::{
    CaptureError, CaptureOptions, GeolocationProvider, Geolocator, PermissionState, WatchHandle,
};
pub use providers::{FixedPositionProvider, ProviderError, ReplayProvider, TrackPoint};
pub use sample::{LocationSample, Position};
pub use validator::{validate, GeoPoint, ServiceArea, ValidationError, ValidatorConfig};
