//! Expiry of old log entries.
//!
//! Retention always cuts a contiguous prefix of the log and never removes the
//! newest entry, so every still-valid CEA cursor keeps an anchor to compare
//! against.

use crate::error::Result;
use chrono::{DateTime, Utc};
use drip_store::{LogStore, RetentionBoundary};
use tracing::{debug, info};

/// Result of one cleanup pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The log is empty, nothing is old enough, or only the newest entry
    /// qualified.
    NothingToClean,
    /// A prefix was removed; `boundary` is the last removed entry.
    Expired { deleted: u64, boundary: RetentionBoundary },
}

impl CleanupOutcome {
    pub fn deleted(&self) -> u64 {
        match self {
            CleanupOutcome::NothingToClean => 0,
            CleanupOutcome::Expired { deleted, .. } => *deleted,
        }
    }
}

/// Delete the entries of the log of `source` whose wall clock is older than
/// `until`, keeping the newest entry.
pub async fn expire_pcs_events<S>(
    store: &S,
    source: &str,
    until: DateTime<Utc>,
) -> Result<CleanupOutcome>
where
    S: LogStore + ?Sized,
{
    let Some(max_key) = store.last_key(source).await? else {
        debug!(source, "Log is empty");
        return Ok(CleanupOutcome::NothingToClean);
    };
    let Some(candidate) = store.last_key_before_wall_clock(source, until).await? else {
        debug!(source, until = %until, "No entries older than cutoff");
        return Ok(CleanupOutcome::NothingToClean);
    };
    let Some(anchor) = store.key_before(source, max_key).await? else {
        return Ok(CleanupOutcome::NothingToClean);
    };

    let through = candidate.min(anchor);
    match store.delete_through(source, through).await? {
        Some((deleted, boundary)) => {
            info!(source, deleted, boundary = %boundary.key, "Expired log entries");
            Ok(CleanupOutcome::Expired { deleted, boundary })
        }
        None => Ok(CleanupOutcome::NothingToClean),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_core::{millis_to_datetime, ClusterTime, EntryIdGenerator};
    use drip_store::{MemoryStore, PcsEvent};

    async fn log_with_wall_clocks(store: &MemoryStore, wall_clocks: &[i64]) {
        let mut ids = EntryIdGenerator::new();
        let events: Vec<_> = wall_clocks
            .iter()
            .enumerate()
            .map(|(n, w)| {
                PcsEvent::noop(
                    ids.next_id().unwrap(),
                    ClusterTime::new(n as u32 + 1, 0),
                    millis_to_datetime(*w),
                )
            })
            .collect();
        store.append("c", &events).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_log() {
        let store = MemoryStore::new();
        let outcome = expire_pcs_events(&store, "c", millis_to_datetime(i64::MAX)).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::NothingToClean);
    }

    #[tokio::test]
    async fn test_single_entry_is_never_deleted() {
        let store = MemoryStore::new();
        log_with_wall_clocks(&store, &[1_000]).await;
        let outcome = expire_pcs_events(&store, "c", millis_to_datetime(9_000_000)).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::NothingToClean);
        assert_eq!(store.log_len("c"), 1);
    }

    #[tokio::test]
    async fn test_cutoff_limits_prefix() {
        let store = MemoryStore::new();
        log_with_wall_clocks(&store, &[1_000, 2_000, 3_000, 4_000]).await;

        let outcome = expire_pcs_events(&store, "c", millis_to_datetime(2_500)).await.unwrap();
        assert_eq!(outcome.deleted(), 2);
        match outcome {
            CleanupOutcome::Expired { boundary, .. } => {
                assert_eq!(boundary.key.cluster_time, ClusterTime::new(2, 0));
                assert_eq!(boundary.wall_clock, millis_to_datetime(2_000));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.log_len("c"), 2);
    }

    #[tokio::test]
    async fn test_future_cutoff_keeps_newest() {
        let store = MemoryStore::new();
        log_with_wall_clocks(&store, &[1_000, 2_000, 3_000]).await;
        let outcome = expire_pcs_events(&store, "c", millis_to_datetime(1_000_000)).await.unwrap();
        assert_eq!(outcome.deleted(), 2);
        assert_eq!(store.log_len("c"), 1);

        // A second pass has nothing left to remove.
        let again = expire_pcs_events(&store, "c", millis_to_datetime(1_000_000)).await.unwrap();
        assert_eq!(again, CleanupOutcome::NothingToClean);
    }

    #[tokio::test]
    async fn test_cutoff_before_everything() {
        let store = MemoryStore::new();
        log_with_wall_clocks(&store, &[5_000, 6_000]).await;
        let outcome = expire_pcs_events(&store, "c", millis_to_datetime(5_000)).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::NothingToClean);
        assert_eq!(store.log_len("c"), 2);
    }
}
