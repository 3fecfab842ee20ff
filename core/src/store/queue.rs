// Offline location queue: durable store-and-forward for location writes
//
// Every valid sample that cannot be delivered right away is persisted here
// and replayed when the network returns. Delivery is at-least-once: an item
// is deleted only after the backend acknowledged it.
//
// Ordering: items are dispatched oldest-first by admission sequence. Sends
// for one volunteer are serialized so the backend sees monotonic capture
// times; different volunteers are dispatched concurrently on the same task.

use crate::backend::{LocationSink, SendError};
use crate::clock::Clock;
use crate::clock::duration_ms;
use crate::location::sample::LocationSample;
use crate::realtime::state::{ConnectionState, ConnectionStateReader};
use crate::store::backend::{StorageBackend, StorageError};
use crate::store::retry::RetryPolicy;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

const QUEUE_PREFIX: &[u8] = b"locq_";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Queue record encoding failed: {0}")]
    Codec(String),
    #[error("Offline queue is full ({limit} items)")]
    QueueFull { limit: usize },
    #[error("No queued update with id {0}")]
    NotFound(String),
}

impl From<bincode::Error> for QueueError {
    fn from(err: bincode::Error) -> Self {
        QueueError::Codec(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    /// Per-send timeout; a timed-out send counts as a network failure
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    /// Items awaiting delivery or inspection before enqueue is refused
    pub max_items: usize,
    /// Number of recent send outcomes the success rate is computed over
    pub stats_window: usize,
    /// Serialize sends per volunteer
    pub per_user_ordering: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(10),
            max_items: 10_000,
            stats_window: 50,
            per_user_ordering: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sending,
    Failed,
    Delivered,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Sending => write!(f, "sending"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::Delivered => write!(f, "delivered"),
        }
    }
}

/// Why an item stopped being retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The backend refused the payload
    Rejected { status: u16, message: String },
    /// Retryable failures hit the attempt ceiling
    RetriesExhausted,
}

/// A sample wrapped with delivery-tracking metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedLocationUpdate {
    pub id: String,
    /// Admission order
    pub seq: u64,
    pub sample: LocationSample,
    pub queued_at: u64,
    /// Failed send attempts so far
    pub attempts: u32,
    pub status: QueueStatus,
    /// Earliest time the next automatic attempt may happen
    pub next_attempt_at: u64,
    pub failure: Option<FailureReason>,
    pub last_error: Option<String>,
}

impl QueuedLocationUpdate {
    fn storage_key(&self) -> Vec<u8> {
        format!(
            "{}{:020}_{}",
            String::from_utf8_lossy(QUEUE_PREFIX),
            self.seq,
            self.id
        )
        .into_bytes()
    }

    fn is_due(&self, now: u64) -> bool {
        self.status == QueueStatus::Pending && self.next_attempt_at <= now
    }

    fn awaiting_delivery(&self) -> bool {
        matches!(self.status, QueueStatus::Pending | QueueStatus::Sending)
    }
}

/// Read-only snapshot for diagnostics views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items awaiting delivery (pending or in flight)
    pub queue_size: usize,
    /// Items that failed terminally and wait for an operator
    pub failed_items: usize,
    /// Fraction of recent sends that succeeded; 1.0 before any send
    pub success_rate: f64,
    /// Last successful delivery (unix ms)
    pub last_sync_time: Option<u64>,
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub dispatched: usize,
    pub delivered: usize,
    /// Failed this cycle, will be retried after backoff
    pub retrying: usize,
    /// Moved to terminal failure this cycle
    pub failed: usize,
    /// Left untouched because an earlier item for the same user failed
    pub deferred: usize,
    /// Another flush was running; nothing was done
    pub already_running: bool,
}

/// Result of handing a fresh sample to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Sent immediately, never persisted
    Delivered,
    /// Persisted for later delivery
    Queued { id: String },
}

enum Disposition {
    Delivered,
    Retrying,
    Failed,
}

struct QueueState {
    items: BTreeMap<u64, QueuedLocationUpdate>,
    next_seq: u64,
    outcomes: VecDeque<bool>,
    last_sync_time: Option<u64>,
}

/// Durable offline queue for location updates.
pub struct LocationQueue {
    storage: Arc<dyn StorageBackend>,
    sink: Arc<dyn LocationSink>,
    clock: Arc<dyn Clock>,
    connection: ConnectionStateReader,
    config: QueueConfig,
    state: Mutex<QueueState>,
    flushing: AtomicBool,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LocationQueue {
    /// Open the queue, reloading whatever a previous process left behind.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        sink: Arc<dyn LocationSink>,
        clock: Arc<dyn Clock>,
        connection: ConnectionStateReader,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let mut items = BTreeMap::new();
        for (key, value) in storage.scan_prefix(QUEUE_PREFIX)? {
            match bincode::deserialize::<QueuedLocationUpdate>(&value) {
                Ok(mut item) => {
                    if item.status == QueueStatus::Sending {
                        // Crashed mid-send; the backend may or may not have it
                        item.status = QueueStatus::Pending;
                        storage.put(&key, &bincode::serialize(&item)?)?;
                    }
                    items.insert(item.seq, item);
                }
                Err(e) => {
                    tracing::warn!(
                        "Dropping unreadable queue record {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                    storage.remove(&key)?;
                }
            }
        }
        storage.flush()?;

        let next_seq = items.keys().next_back().map(|s| s + 1).unwrap_or(1);
        if !items.is_empty() {
            tracing::info!("Offline queue reloaded {} item(s)", items.len());
        }

        Ok(Self {
            storage,
            sink,
            clock,
            connection,
            config,
            state: Mutex::new(QueueState {
                items,
                next_seq,
                outcomes: VecDeque::new(),
                last_sync_time: None,
            }),
            flushing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a sample as `Pending`. Durable before this returns.
    pub fn enqueue(&self, sample: LocationSample) -> Result<String, QueueError> {
        let now = self.clock.now_ms();
        self.admit(sample, now, |_| {})
    }

    /// Hand a freshly validated sample to the queue.
    ///
    /// When connected and the volunteer has no backlog the sample is sent
    /// straight away; otherwise it is persisted behind the backlog.
    pub async fn submit(&self, sample: LocationSample) -> Result<SubmitOutcome, QueueError> {
        if self.connection.current() != ConnectionState::Connected {
            let id = self.enqueue(sample)?;
            tracing::debug!("Offline; queued location update {}", id);
            return Ok(SubmitOutcome::Queued { id });
        }

        if self.has_backlog_for(sample.user_id()) {
            let id = self.enqueue(sample)?;
            self.flush().await;
            return Ok(SubmitOutcome::Queued { id });
        }

        match self.send_with_timeout(&sample).await {
            Ok(()) => {
                let now = self.clock.now_ms();
                let mut state = self.state.lock();
                self.push_outcome(&mut state, true);
                state.last_sync_time = Some(now);
                Ok(SubmitOutcome::Delivered)
            }
            Err(err) => {
                let now = self.clock.now_ms();
                {
                    let mut state = self.state.lock();
                    self.push_outcome(&mut state, false);
                }
                let id = self.admit(sample, now, |item| self.apply_failure(item, &err, now))?;
                tracing::warn!("Immediate location send failed ({}); queued as {}", err, id);
                Ok(SubmitOutcome::Queued { id })
            }
        }
    }

    fn admit<F>(&self, sample: LocationSample, now: u64, prepare: F) -> Result<String, QueueError>
    where
        F: FnOnce(&mut QueuedLocationUpdate),
    {
        let mut state = self.state.lock();
        if state.items.len() >= self.config.max_items {
            return Err(QueueError::QueueFull {
                limit: self.config.max_items,
            });
        }

        let mut item = QueuedLocationUpdate {
            id: uuid::Uuid::new_v4().to_string(),
            seq: state.next_seq,
            sample,
            queued_at: now,
            attempts: 0,
            status: QueueStatus::Pending,
            next_attempt_at: now,
            failure: None,
            last_error: None,
        };
        prepare(&mut item);

        self.storage
            .put(&item.storage_key(), &bincode::serialize(&item)?)?;
        self.storage.flush()?;

        state.next_seq += 1;
        let id = item.id.clone();
        state.items.insert(item.seq, item);
        Ok(id)
    }

    /// Send every due `Pending` item, oldest first.
    pub async fn flush(&self) -> FlushReport {
        if self.flushing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Flush already in progress; skipping");
            return FlushReport {
                already_running: true,
                ..Default::default()
            };
        }
        let _guard = FlushGuard(&self.flushing);

        let now = self.clock.now_ms();
        let mut report = FlushReport::default();
        let batch: Vec<QueuedLocationUpdate> = {
            let mut state = self.state.lock();
            let mut batch = Vec::new();
            // Users whose oldest undelivered item is still backing off
            let mut blocked: HashSet<String> = HashSet::new();
            for item in state.items.values_mut() {
                let user = item.sample.user_id();
                if self.config.per_user_ordering && blocked.contains(user) {
                    if item.status == QueueStatus::Pending {
                        report.deferred += 1;
                    }
                    continue;
                }
                if item.is_due(now) {
                    item.status = QueueStatus::Sending;
                    self.persist(item);
                    batch.push(item.clone());
                } else if item.status == QueueStatus::Pending {
                    blocked.insert(user.to_string());
                }
            }
            batch
        };

        if batch.is_empty() {
            return report;
        }

        let lanes = self.build_lanes(batch);
        for lane in join_all(lanes.into_iter().map(|lane| self.drain_lane(lane))).await {
            report.dispatched += lane.dispatched;
            report.delivered += lane.delivered;
            report.retrying += lane.retrying;
            report.failed += lane.failed;
            report.deferred += lane.deferred;
        }

        tracing::info!(
            "Queue flush: {} sent, {} delivered, {} retrying, {} failed, {} deferred",
            report.dispatched,
            report.delivered,
            report.retrying,
            report.failed,
            report.deferred
        );
        report
    }

    /// Connectivity came back; replay the backlog.
    pub async fn on_network_restored(&self) -> FlushReport {
        tracing::info!("Network restored; flushing offline queue");
        self.flush().await
    }

    fn build_lanes(&self, batch: Vec<QueuedLocationUpdate>) -> Vec<Vec<QueuedLocationUpdate>> {
        if !self.config.per_user_ordering {
            return batch.into_iter().map(|item| vec![item]).collect();
        }
        let mut lanes: Vec<Vec<QueuedLocationUpdate>> = Vec::new();
        for item in batch {
            match lanes
                .iter_mut()
                .find(|lane| lane[0].sample.user_id() == item.sample.user_id())
            {
                Some(lane) => lane.push(item),
                None => lanes.push(vec![item]),
            }
        }
        lanes
    }

    async fn drain_lane(&self, lane: Vec<QueuedLocationUpdate>) -> FlushReport {
        let mut report = FlushReport::default();
        let mut items = lane.into_iter();
        while let Some(item) = items.next() {
            report.dispatched += 1;
            let result = self.send_with_timeout(&item.sample).await;
            match self.record_result(item.seq, result) {
                Disposition::Delivered => report.delivered += 1,
                Disposition::Failed => report.failed += 1,
                Disposition::Retrying => {
                    report.retrying += 1;
                    if self.config.per_user_ordering {
                        let rest: Vec<u64> = items.by_ref().map(|i| i.seq).collect();
                        report.deferred += rest.len();
                        self.release(&rest);
                        break;
                    }
                }
            }
        }
        report
    }

    async fn send_with_timeout(&self, sample: &LocationSample) -> Result<(), SendError> {
        match tokio::time::timeout(self.config.send_timeout, self.sink.send_location(sample)).await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        }
    }

    fn record_result(&self, seq: u64, result: Result<(), SendError>) -> Disposition {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.push_outcome(&mut state, result.is_ok());

        match result {
            Ok(()) => {
                state.last_sync_time = Some(now);
                if let Some(mut item) = state.items.remove(&seq) {
                    item.status = QueueStatus::Delivered;
                    if let Err(e) = self.storage.remove(&item.storage_key()) {
                        tracing::error!("Failed to remove delivered item {}: {}", item.id, e);
                    }
                    let _ = self.storage.flush();
                    tracing::debug!("Delivered queued location update {}", item.id);
                }
                Disposition::Delivered
            }
            Err(err) => {
                let Some(item) = state.items.get_mut(&seq) else {
                    // Removed by an operator while in flight
                    return if err.is_retryable() {
                        Disposition::Retrying
                    } else {
                        Disposition::Failed
                    };
                };
                self.apply_failure(item, &err, now);
                self.persist(item);
                if item.status == QueueStatus::Failed {
                    tracing::error!(
                        "Location update {} failed terminally after {} attempt(s): {}",
                        item.id,
                        item.attempts,
                        err
                    );
                    Disposition::Failed
                } else {
                    tracing::warn!(
                        "Location update {} attempt {} failed ({}); next try in {:?}",
                        item.id,
                        item.attempts,
                        err,
                        Duration::from_millis(item.next_attempt_at.saturating_sub(now))
                    );
                    Disposition::Retrying
                }
            }
        }
    }

    fn apply_failure(&self, item: &mut QueuedLocationUpdate, err: &SendError, now: u64) {
        item.attempts += 1;
        item.last_error = Some(err.to_string());
        if !err.is_retryable() {
            let (status, message) = match err {
                SendError::Rejected { status, message } => (*status, message.clone()),
                SendError::Gone { status } => (*status, "gone".to_string()),
                _ => (0, err.to_string()),
            };
            item.status = QueueStatus::Failed;
            item.failure = Some(FailureReason::Rejected { status, message });
        } else if !self.config.retry.should_retry(item.attempts) {
            item.status = QueueStatus::Failed;
            item.failure = Some(FailureReason::RetriesExhausted);
        } else {
            item.status = QueueStatus::Pending;
            item.next_attempt_at = now + self.config.retry.delay_for(item.attempts).as_millis() as u64;
        }
    }

    /// Return in-flight items to `Pending` without counting an attempt.
    fn release(&self, seqs: &[u64]) {
        let mut state = self.state.lock();
        for seq in seqs {
            if let Some(item) = state.items.get_mut(seq) {
                item.status = QueueStatus::Pending;
                self.persist(item);
            }
        }
    }

    fn persist(&self, item: &QueuedLocationUpdate) {
        let result = bincode::serialize(item)
            .map_err(QueueError::from)
            .and_then(|bytes| Ok(self.storage.put(&item.storage_key(), &bytes)?))
            .and_then(|_| Ok(self.storage.flush()?));
        if let Err(e) = result {
            tracing::error!("Failed to persist queue item {}: {}", item.id, e);
        }
    }

    fn push_outcome(&self, state: &mut QueueState, success: bool) {
        state.outcomes.push_back(success);
        while state.outcomes.len() > self.config.stats_window.max(1) {
            state.outcomes.pop_front();
        }
    }

    fn has_backlog_for(&self, user_id: &str) -> bool {
        self.state
            .lock()
            .items
            .values()
            .any(|i| i.awaiting_delivery() && i.sample.user_id() == user_id)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let queue_size = state
            .items
            .values()
            .filter(|i| i.awaiting_delivery())
            .count();
        let failed_items = state
            .items
            .values()
            .filter(|i| i.status == QueueStatus::Failed)
            .count();
        let success_rate = if state.outcomes.is_empty() {
            1.0
        } else {
            state.outcomes.iter().filter(|ok| **ok).count() as f64 / state.outcomes.len() as f64
        };
        QueueStats {
            queue_size,
            failed_items,
            success_rate,
            last_sync_time: state.last_sync_time,
        }
    }

    /// All retained items in admission order.
    pub fn items(&self) -> Vec<QueuedLocationUpdate> {
        self.state.lock().items.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<QueuedLocationUpdate> {
        self.state
            .lock()
            .items
            .values()
            .find(|i| i.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest backoff deadline among pending items.
    pub fn next_due_at(&self) -> Option<u64> {
        self.state
            .lock()
            .items
            .values()
            .filter(|i| i.status == QueueStatus::Pending)
            .map(|i| i.next_attempt_at)
            .min()
    }

    /// Operator action: delete an item regardless of state.
    pub fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let Some(seq) = state.items.values().find(|i| i.id == id).map(|i| i.seq) else {
            return Err(QueueError::NotFound(id.to_string()));
        };
        if let Some(item) = state.items.get(&seq) {
            self.storage.remove(&item.storage_key())?;
            self.storage.flush()?;
        }
        state.items.remove(&seq);
        Ok(())
    }

    /// Operator action: put a terminally failed item back in line.
    /// Returns `false` when the item is not in the failed state.
    pub fn retry(&self, id: &str) -> Result<bool, QueueError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let Some(item) = state.items.values_mut().find(|i| i.id == id) else {
            return Err(QueueError::NotFound(id.to_string()));
        };
        if item.status != QueueStatus::Failed {
            return Ok(false);
        }
        item.status = QueueStatus::Pending;
        item.attempts = 0;
        item.failure = None;
        item.next_attempt_at = now;
        self.storage
            .put(&item.storage_key(), &bincode::serialize(&*item)?)?;
        self.storage.flush()?;
        Ok(true)
    }

    /// Operator action: drop every terminally failed item.
    pub fn purge_failed(&self) -> Result<usize, QueueError> {
        self.purge_where(|item| item.status == QueueStatus::Failed)
    }

    /// Drop items admitted more than `max_age` ago (in-flight items are kept).
    pub fn purge_older_than(&self, max_age: Duration) -> Result<usize, QueueError> {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX));
        self.purge_where(|item| item.status != QueueStatus::Sending && item.queued_at < cutoff)
    }

    fn purge_where<F>(&self, predicate: F) -> Result<usize, QueueError>
    where
        F: Fn(&QueuedLocationUpdate) -> bool,
    {
        let mut state = self.state.lock();
        let doomed: Vec<u64> = state
            .items
            .values()
            .filter(|i| predicate(i))
            .map(|i| i.seq)
            .collect();
        for seq in &doomed {
            if let Some(item) = state.items.get(seq) {
                self.storage.remove(&item.storage_key())?;
            }
            state.items.remove(seq);
        }
        self.storage.flush()?;
        Ok(doomed.len())
    }
}

/// Background driver that replays the queue when the connection comes back
/// and when backoff deadlines expire.
pub struct QueueDriver {
    task: JoinHandle<()>,
}

impl QueueDriver {
    /// `idle_poll` bounds how long the driver sleeps when nothing is due.
    pub fn spawn(queue: Arc<LocationQueue>, idle_poll: Duration) -> Self {
        let mut connection = queue.connection.clone();
        let task = tokio::spawn(async move {
            loop {
                let wait = match queue.next_due_at() {
                    Some(due) => Duration::from_millis(due.saturating_sub(queue.clock.now_ms()))
                        .clamp(Duration::from_millis(100), idle_poll),
                    None => idle_poll,
                };

                tokio::select! {
                    change = connection.changed() => {
                        match change {
                            Some(ConnectionState::Connected) => {
                                queue.on_network_restored().await;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(wait) => {
                        if connection.is_connected() {
                            let now = queue.clock.now_ms();
                            if queue.next_due_at().is_some_and(|due| due <= now) {
                                queue.flush().await;
                            }
                        }
                    }
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for QueueDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
