// Background tracking scheduler: capture, validate, submit on a fixed period
//
// Ticks never overlap: the next one waits until the current tick's capture
// and submit have finished. A slow tick delays the schedule instead of
// piling up work.

use crate::clock::duration_ms;
use crate::gate::CallbackGate;
use crate::location::capture::{CaptureError, CaptureOptions, Geolocator};
use crate::location::sample::LocationSample;
use crate::location::validator::{validate, ValidationError, ValidatorConfig};
use crate::store::queue::{LocationQueue, QueueError, SubmitOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    pub capture: CaptureOptions,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            capture: CaptureOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerStats {
    pub ticks: u64,
    /// Samples that passed validation
    pub accepted: u64,
    /// Accepted samples sent without queueing
    pub delivered: u64,
    /// Accepted samples left in the offline queue
    pub queued: u64,
    pub capture_failures: u64,
    pub rejected: u64,
    pub queue_failures: u64,
    pub last_sample: Option<LocationSample>,
}

pub struct BackgroundTracker;

impl BackgroundTracker {
    /// Start tracking. The first tick runs immediately.
    pub fn start<E>(
        geolocator: Geolocator,
        validator: ValidatorConfig,
        queue: Arc<LocationQueue>,
        config: TrackingConfig,
        mut on_error: E,
    ) -> TrackerHandle
    where
        E: FnMut(TrackingError) + Send + 'static,
    {
        let gate = Arc::new(CallbackGate::new());
        let stop = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(TrackerStats::default()));

        let task_gate = Arc::clone(&gate);
        let task_stop = Arc::clone(&stop);
        let task_stats = Arc::clone(&stats);
        let period = config.interval.max(Duration::from_secs(1));

        tracing::info!(
            "Tracking {} every {:?}",
            geolocator.user_id(),
            period
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_stop.notified() => break,
                }
                if task_gate.is_closed() {
                    break;
                }

                let outcome = run_tick(&geolocator, &validator, &queue, &config.capture).await;
                task_gate.run(|| {
                    let mut stats = task_stats.lock();
                    stats.ticks += 1;
                    match outcome {
                        Ok((sample, submitted)) => {
                            stats.accepted += 1;
                            match submitted {
                                SubmitOutcome::Delivered => stats.delivered += 1,
                                SubmitOutcome::Queued { .. } => stats.queued += 1,
                            }
                            stats.last_sample = Some(sample);
                        }
                        Err(err) => {
                            match &err {
                                TrackingError::Capture(_) => stats.capture_failures += 1,
                                TrackingError::Validation(_) => stats.rejected += 1,
                                TrackingError::Queue(_) => stats.queue_failures += 1,
                            }
                            drop(stats);
                            tracing::warn!("Tracking tick failed: {}", err);
                            on_error(err);
                        }
                    }
                });
            }
            tracing::debug!("Tracker loop ended");
        });

        TrackerHandle { gate, stop, stats }
    }
}

async fn run_tick(
    geolocator: &Geolocator,
    validator: &ValidatorConfig,
    queue: &LocationQueue,
    options: &CaptureOptions,
) -> Result<(LocationSample, SubmitOutcome), TrackingError> {
    let sample = geolocator.get_current_sample(options).await?;
    validate(&sample, validator)?;
    let outcome = queue.submit(sample.clone()).await?;
    Ok((sample, outcome))
}

/// Handle to a running tracker. Dropping it stops tracking.
pub struct TrackerHandle {
    gate: Arc<CallbackGate>,
    stop: Arc<Notify>,
    stats: Arc<Mutex<TrackerStats>>,
}

impl TrackerHandle {
    /// Stop tracking. No tick is counted and no error callback runs after
    /// this returns; a submit already in flight is allowed to finish.
    pub fn stop(&self) {
        if !self.gate.is_closed() {
            self.gate.close();
            self.stop.notify_one();
            tracing::info!("Tracking stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.gate.is_closed()
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats.lock().clone()
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
