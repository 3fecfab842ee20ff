use async_trait::async_trait;
use parking_lot::Mutex;
use rvois_core::backend::{LocationSink, SendError};
use rvois_core::clock::ManualClock;
use rvois_core::error::ErrorKind;
use rvois_core::location::{
    GeoPoint, Geolocator, LocationSample, ReplayProvider, ServiceArea, TrackPoint,
    ValidatorConfig,
};
use rvois_core::realtime::{ConnectionState, ConnectionStateMachine};
use rvois_core::store::{LocationQueue, MemoryStorage, QueueConfig, QueueDriver};
use rvois_core::tracking::{BackgroundTracker, TrackingConfig};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<LocationSample>>,
}

#[async_trait]
impl LocationSink for RecordingSink {
    async fn send_location(&self, sample: &LocationSample) -> Result<(), SendError> {
        self.delivered.lock().push(sample.clone());
        Ok(())
    }
}

fn point(latitude: f64, longitude: f64, accuracy: f64) -> TrackPoint {
    TrackPoint {
        latitude,
        longitude,
        accuracy,
        heading: None,
        speed: None,
    }
}

fn municipality() -> ValidatorConfig {
    ValidatorConfig {
        service_area: Some(ServiceArea::polygon(vec![
            GeoPoint::new(10.60, 122.90),
            GeoPoint::new(10.60, 123.00),
            GeoPoint::new(10.80, 123.00),
            GeoPoint::new(10.80, 122.90),
        ])),
        max_accuracy_m: 50.0,
    }
}

#[tokio::test(start_paused = true)]
async fn test_tracker_queues_offline_and_replays_on_connect() {
    let clock = ManualClock::new(1_700_000_000_000);
    let track = vec![
        point(10.70, 122.95, 10.0),
        point(11.50, 122.95, 10.0), // outside the municipality
        point(10.71, 122.95, 10.0),
        point(10.72, 122.95, 400.0), // too inaccurate
        point(10.73, 122.95, 10.0),
    ];
    let provider = ReplayProvider::new(track, false, Arc::new(clock.clone()));
    let geolocator = Geolocator::new(Arc::new(provider), "vol-1", Arc::new(clock.clone()));

    let sink = Arc::new(RecordingSink::default());
    let machine = ConnectionStateMachine::new();
    let queue = Arc::new(
        LocationQueue::open(
            Arc::new(MemoryStorage::new()),
            sink.clone(),
            Arc::new(clock.clone()),
            machine.reader(),
            QueueConfig::default(),
        )
        .unwrap(),
    );
    let _driver = QueueDriver::spawn(Arc::clone(&queue), Duration::from_secs(30));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&errors);
    let tracker = BackgroundTracker::start(
        geolocator,
        municipality(),
        Arc::clone(&queue),
        TrackingConfig::default(),
        move |err| seen.lock().push(err.kind()),
    );

    // Ticks at 0, 30, 60, 90 and 120 seconds
    tokio::time::sleep(Duration::from_secs(125)).await;
    tracker.stop();

    let stats = tracker.stats();
    assert_eq!(stats.ticks, 5);
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.rejected, 2);
    assert_eq!(
        *errors.lock(),
        vec![ErrorKind::OutOfBounds, ErrorKind::AccuracyTooLow]
    );
    assert_eq!(queue.stats().queue_size, 3);
    assert!(sink.delivered.lock().is_empty());

    machine.transition(ConnectionState::Connecting).unwrap();
    machine.transition(ConnectionState::Connected).unwrap();
    for _ in 0..100 {
        if queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let latitudes: Vec<f64> = sink.delivered.lock().iter().map(|s| s.latitude()).collect();
    assert_eq!(latitudes, vec![10.70, 10.71, 10.73]);
    assert_eq!(queue.stats().queue_size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_online_tracking_sends_without_queueing() {
    let clock = ManualClock::new(0);
    let provider = ReplayProvider::new(vec![point(10.70, 122.95, 8.0)], true, Arc::new(clock.clone()));
    let geolocator = Geolocator::new(Arc::new(provider), "vol-2", Arc::new(clock.clone()));

    let sink = Arc::new(RecordingSink::default());
    let machine = ConnectionStateMachine::new();
    machine.transition(ConnectionState::Connecting).unwrap();
    machine.transition(ConnectionState::Connected).unwrap();
    let queue = Arc::new(
        LocationQueue::open(
            Arc::new(MemoryStorage::new()),
            sink.clone(),
            Arc::new(clock),
            machine.reader(),
            QueueConfig::default(),
        )
        .unwrap(),
    );

    let config = TrackingConfig {
        interval: Duration::from_secs(10),
        ..Default::default()
    };
    let tracker = BackgroundTracker::start(
        geolocator,
        municipality(),
        Arc::clone(&queue),
        config,
        |err| panic!("unexpected tracking error: {}", err),
    );
    tokio::time::sleep(Duration::from_secs(35)).await;
    drop(tracker);
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Ticks at 0, 10, 20 and 30 seconds; none after the handle is dropped
    assert_eq!(sink.delivered.lock().len(), 4);
    assert!(queue.is_empty());
    assert_eq!(queue.stats().success_rate, 1.0);
}
