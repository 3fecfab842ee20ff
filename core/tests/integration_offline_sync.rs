use async_trait::async_trait;
use parking_lot::Mutex;
use rvois_core::backend::{LocationSink, SendError};
use rvois_core::clock::ManualClock;
use rvois_core::location::LocationSample;
use rvois_core::realtime::{ConnectionState, ConnectionStateMachine};
use rvois_core::store::{LocationQueue, MemoryStorage, QueueConfig, QueueDriver, SubmitOutcome};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Records send calls and deliveries in arrival order. Latency is
/// configurable per volunteer or per sample, scripted failures per volunteer.
#[derive(Default)]
struct RecordingSink {
    started: Mutex<Vec<(String, u64)>>,
    delivered: Mutex<Vec<(String, u64)>>,
    latency: HashMap<String, Duration>,
    sample_latency: HashMap<u64, Duration>,
    failures: Mutex<HashMap<String, VecDeque<SendError>>>,
}

impl RecordingSink {
    fn with_latency(mut self, user: &str, latency: Duration) -> Self {
        self.latency.insert(user.to_string(), latency);
        self
    }

    fn with_sample_latency(mut self, captured_at: u64, latency: Duration) -> Self {
        self.sample_latency.insert(captured_at, latency);
        self
    }

    fn fail_next(self, user: &str, err: SendError) -> Self {
        self.failures
            .lock()
            .entry(user.to_string())
            .or_default()
            .push_back(err);
        self
    }

    fn delivered_for(&self, user: &str) -> Vec<u64> {
        self.delivered
            .lock()
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, t)| *t)
            .collect()
    }
}

#[async_trait]
impl LocationSink for RecordingSink {
    async fn send_location(&self, sample: &LocationSample) -> Result<(), SendError> {
        self.started
            .lock()
            .push((sample.user_id().to_string(), sample.captured_at()));
        let latency = self
            .sample_latency
            .get(&sample.captured_at())
            .or_else(|| self.latency.get(sample.user_id()));
        if let Some(latency) = latency {
            tokio::time::sleep(*latency).await;
        }
        let scripted = self
            .failures
            .lock()
            .get_mut(sample.user_id())
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        self.delivered
            .lock()
            .push((sample.user_id().to_string(), sample.captured_at()));
        Ok(())
    }
}

fn sample(user: &str, captured_at: u64) -> LocationSample {
    LocationSample::new(user, 10.6765, 122.9509, 12.0, captured_at)
}

fn connect(machine: &ConnectionStateMachine) {
    machine.transition(ConnectionState::Connecting).unwrap();
    machine.transition(ConnectionState::Connected).unwrap();
}

#[tokio::test]
async fn test_offline_samples_replay_in_order_on_reconnect() {
    let sink = Arc::new(RecordingSink::default());
    let machine = ConnectionStateMachine::new();
    let clock = ManualClock::new(1_700_000_000_000);
    let queue = LocationQueue::open(
        Arc::new(MemoryStorage::new()),
        sink.clone(),
        Arc::new(clock.clone()),
        machine.reader(),
        QueueConfig::default(),
    )
    .unwrap();

    for t in [1_000, 2_000, 3_000] {
        let outcome = queue.submit(sample("vol-u", t)).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
    }
    assert_eq!(queue.stats().queue_size, 3);
    assert!(sink.delivered.lock().is_empty());

    connect(&machine);
    let report = queue.on_network_restored().await;
    assert_eq!(report.delivered, 3);

    assert_eq!(sink.delivered_for("vol-u"), vec![1_000, 2_000, 3_000]);
    assert!(queue.is_empty());
    let stats = queue.stats();
    assert_eq!(stats.queue_size, 0);
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(stats.last_sync_time, Some(1_700_000_000_000));
}

#[tokio::test(start_paused = true)]
async fn test_per_user_order_holds_under_staggered_latency() {
    let sink = Arc::new(
        RecordingSink::default()
            .with_latency("slow", Duration::from_millis(300))
            .with_latency("fast", Duration::from_millis(5)),
    );
    let queue = LocationQueue::open(
        Arc::new(MemoryStorage::new()),
        sink.clone(),
        Arc::new(ManualClock::new(0)),
        rvois_core::realtime::ConnectionStateReader::constant(ConnectionState::Connected),
        QueueConfig::default(),
    )
    .unwrap();

    for t in 1..=4 {
        queue.enqueue(sample("slow", t)).unwrap();
        queue.enqueue(sample("fast", t)).unwrap();
    }
    let report = queue.flush().await;
    assert_eq!(report.delivered, 8);

    assert_eq!(sink.delivered_for("slow"), vec![1, 2, 3, 4]);
    assert_eq!(sink.delivered_for("fast"), vec![1, 2, 3, 4]);
    // The fast lane is not held back by the slow one
    let order = sink.delivered.lock().clone();
    assert_eq!(order[0].0, "fast");
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_follows_enqueue_order_not_completion() {
    let sink = Arc::new(
        RecordingSink::default()
            .with_sample_latency(1, Duration::from_millis(300))
            .with_sample_latency(2, Duration::from_millis(100))
            .with_sample_latency(3, Duration::from_millis(5)),
    );
    let config = QueueConfig {
        per_user_ordering: false,
        ..Default::default()
    };
    let queue = LocationQueue::open(
        Arc::new(MemoryStorage::new()),
        sink.clone(),
        Arc::new(ManualClock::new(0)),
        rvois_core::realtime::ConnectionStateReader::constant(ConnectionState::Connected),
        config,
    )
    .unwrap();

    for t in [1, 2, 3] {
        queue.enqueue(sample("vol-u", t)).unwrap();
    }
    let report = queue.flush().await;
    assert_eq!(report.delivered, 3);

    let started: Vec<u64> = sink.started.lock().iter().map(|(_, t)| *t).collect();
    assert_eq!(started, vec![1, 2, 3]);
    // Completions arrive in latency order
    assert_eq!(sink.delivered_for("vol-u"), vec![3, 2, 1]);
}

#[tokio::test]
async fn test_retryable_failure_keeps_order_across_flushes() {
    let sink = Arc::new(
        RecordingSink::default().fail_next("vol-u", SendError::Network("connection reset".into())),
    );
    let clock = ManualClock::new(0);
    let queue = LocationQueue::open(
        Arc::new(MemoryStorage::new()),
        sink.clone(),
        Arc::new(clock.clone()),
        rvois_core::realtime::ConnectionStateReader::constant(ConnectionState::Connected),
        QueueConfig::default(),
    )
    .unwrap();

    for t in [10, 20, 30] {
        queue.enqueue(sample("vol-u", t)).unwrap();
    }

    let first = queue.flush().await;
    assert_eq!(first.retrying, 1);
    assert_eq!(first.deferred, 2);

    // Still inside the first backoff window
    let early = queue.flush().await;
    assert_eq!(early.dispatched, 0);
    assert!(sink.delivered.lock().is_empty());

    clock.advance(Duration::from_secs(2));
    let report = queue.flush().await;
    assert_eq!(report.delivered, 3);
    assert_eq!(sink.delivered_for("vol-u"), vec![10, 20, 30]);
    assert_eq!(queue.stats().queue_size, 0);
}

#[tokio::test]
async fn test_driver_replays_when_connection_returns() {
    let sink = Arc::new(RecordingSink::default());
    let machine = ConnectionStateMachine::new();
    let queue = Arc::new(
        LocationQueue::open(
            Arc::new(MemoryStorage::new()),
            sink.clone(),
            Arc::new(ManualClock::new(5_000)),
            machine.reader(),
            QueueConfig::default(),
        )
        .unwrap(),
    );
    queue.submit(sample("vol-u", 1)).await.unwrap();
    queue.submit(sample("vol-u", 2)).await.unwrap();

    let driver = QueueDriver::spawn(Arc::clone(&queue), Duration::from_secs(60));
    connect(&machine);

    for _ in 0..200 {
        if queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    driver.stop();

    assert!(queue.is_empty());
    assert_eq!(sink.delivered_for("vol-u"), vec![1, 2]);
}
