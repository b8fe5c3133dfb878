//! Periodic retention for one log.

use crate::cleaner::{expire_pcs_events, CleanupOutcome};
use crate::error::{CompactionError, Result};
use drip_core::{millis_to_datetime, SharedClock};
use drip_store::{LogStore, RetentionBoundary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How long entries are kept and how often the cleaner looks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Entries whose wall clock is older than this (in milliseconds) expire.
    pub retention_ms: u64,
    /// Time between cleanup passes (in milliseconds).
    pub interval_ms: u64,
}

impl RetentionPolicy {
    pub fn new(retention: Duration, interval: Duration) -> Self {
        Self {
            retention_ms: duration_millis(retention),
            interval_ms: duration_millis(interval),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_ms: 24 * 60 * 60 * 1000,
            interval_ms: 60 * 1000,
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Totals for a cleaner run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanerStats {
    pub passes: u64,
    pub deleted: u64,
    pub boundary: Option<RetentionBoundary>,
}

/// Handle to a running cleaner.
#[derive(Debug)]
pub struct CleanerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<CleanerStats>>>,
}

impl CleanerHandle {
    pub async fn stop(mut self) -> Result<CleanerStats> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait for the cleaner to end; it only ends on its own after an error.
    pub async fn join(mut self) -> Result<CleanerStats> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| CompactionError::TaskFailed(format!("task panicked: {e}")))?,
            None => Ok(CleanerStats::default()),
        }
    }
}

/// Run [`expire_pcs_events`] on the log of `source` every
/// `policy.interval`, with `now - policy.retention` as the cutoff.
///
/// The first pass runs immediately. A failed pass ends the cleaner.
pub fn spawn_cleaner<S>(
    store: Arc<S>,
    source: impl Into<String>,
    policy: RetentionPolicy,
    clock: SharedClock,
) -> CleanerHandle
where
    S: LogStore,
{
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(cleaner_loop(store, source.into(), policy, clock, shutdown_rx));
    CleanerHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn cleaner_loop<S: LogStore>(
    store: Arc<S>,
    source: String,
    policy: RetentionPolicy,
    clock: SharedClock,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<CleanerStats> {
    let mut stats = CleanerStats::default();
    let mut ticker = tokio::time::interval(policy.interval().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let retention_ms = i64::try_from(policy.retention_ms).unwrap_or(i64::MAX);
    info!(
        source = %source,
        retention_ms = policy.retention_ms,
        interval_ms = policy.interval_ms,
        "Cleaner started"
    );

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let until = millis_to_datetime(clock.now().timestamp_millis().saturating_sub(retention_ms));
        stats.passes += 1;
        match expire_pcs_events(&*store, &source, until).await {
            Ok(CleanupOutcome::Expired { deleted, boundary }) => {
                stats.deleted += deleted;
                stats.boundary = Some(boundary);
            }
            Ok(CleanupOutcome::NothingToClean) => debug!(source = %source, "Nothing to expire"),
            Err(err) => {
                warn!(source = %source, error = %err, class = %err.class(), "Cleanup pass failed");
                return Err(err);
            }
        }
    }

    info!(source = %source, passes = stats.passes, deleted = stats.deleted, "Cleaner stopped");
    Ok(stats)
}
