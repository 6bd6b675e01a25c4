//! Interval scheduler for batch sync passes.
//!
//! Every tick starts a new pass whether or not earlier passes have finished,
//! up to `max_concurrent_syncs` running at once. A tick that would exceed the
//! bound is dropped, not queued. Late ticks fire immediately (no misfire
//! window).
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::coordinator::{SyncReport, Syncer};
use crate::config::Config;

/// What happened to one firing.
#[derive(Debug)]
pub enum FireOutcome {
    /// A pass was spawned; the handle resolves to its report.
    Started(JoinHandle<SyncReport>),
    /// The instance bound was reached.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub started: u64,
    pub dropped: u64,
}

pub struct Scheduler {
    syncer: Arc<Syncer>,
    period: Duration,
    max_instances: usize,
    permits: Arc<Semaphore>,
    started: AtomicU64,
    dropped: AtomicU64,
}

impl Scheduler {
    pub fn new(syncer: Arc<Syncer>, config: &Config) -> Self {
        Self::with_interval(syncer, config.sync_interval(), config.max_concurrent_syncs)
    }

    pub fn with_interval(syncer: Arc<Syncer>, period: Duration, max_instances: usize) -> Self {
        let max_instances = max_instances.max(1);
        Self {
            syncer,
            period,
            max_instances,
            permits: Arc::new(Semaphore::new(max_instances)),
            started: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Passes currently in flight.
    pub fn running_instances(&self) -> usize {
        self.max_instances - self.permits.available_permits()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            started: self.started.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Start one batch pass now, unless the instance bound is reached.
    pub fn fire(&self) -> FireOutcome {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    running = self.running_instances(),
                    max = self.max_instances,
                    "Sync pass still running at instance limit, dropping this firing"
                );
                return FireOutcome::Dropped;
            }
        };

        self.started.fetch_add(1, Ordering::Relaxed);
        let syncer = Arc::clone(&self.syncer);
        FireOutcome::Started(tokio::spawn(async move {
            let _permit = permit;
            syncer.sync_all().await
        }))
    }

    /// Fire every period until `shutdown` turns true (or its sender is
    /// dropped), then wait for in-flight passes to finish.
    ///
    /// The first pass runs one full period after start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.period.as_secs(),
            max_instances = self.max_instances,
            "Scheduler started"
        );

        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Burst);
        // The first tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.fire();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            running = self.running_instances(),
            "Scheduler stopping, waiting for running passes"
        );
        // Holding every permit means no pass is left
        let _ = self.permits.acquire_many(self.max_instances as u32).await;
        tracing::info!(stats = ?self.stats(), "Scheduler stopped");
    }
}
