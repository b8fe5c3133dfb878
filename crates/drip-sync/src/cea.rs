//! Change Event Application: replay of a log into subset-relative events.
//!
//! A pass reads the log strictly after the cursor and strictly before the
//! gate, `lower_bound(max_key.cluster_time)`. Entries sharing the newest
//! cluster time may belong to a commit that is still being written, so they
//! wait for a later pass. Within that range three ordered queries run side by
//! side:
//!
//! ```text
//! s1 = insertions and updates whose after image matches      -> Addition
//! s2 = subtract(updates with matching before,
//!               updates with matching after)                 -> Subtraction
//! s3 = deletions whose before image matches                  -> Subtraction
//! out = union(s1, union(s2, s3))
//! ```
//!
//! When the merged output is exhausted, the newest noop between the last
//! emitted entry and the gate is reported once, so an idle reader still
//! advances its cursor.

use crate::error::{Result, SyncError};
use crate::event::{CsEvent, CsOp};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use drip_core::{ordered_subtract, ordered_union, OrderKey};
use drip_store::{
    CeaCursor, CollectionId, Image, LogStore, PcsEvent, PcsKind, PcsOp, PcsQuery, RetentionBoundary,
    Rule, SourceStore, Store, StoreError,
};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// The subset a reader follows.
///
/// `after` selects documents by their post-image, `before` by their
/// pre-image. They are normally the same filter; `before` is kept separate
/// because it cannot be derived from an arbitrary `after` filter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CeaRule {
    pub after: Rule,
    pub before: Rule,
}

impl CeaRule {
    pub fn new(after: Rule, before: Rule) -> Self {
        Self { after, before }
    }

    /// One filter for both images.
    pub fn symmetric(rule: Rule) -> Self {
        Self {
            after: rule.clone(),
            before: rule,
        }
    }
}

/// Replay the log of `source` strictly after `cursor`.
///
/// Fails with [`SyncError::CollectionMismatch`] when the collection was
/// recreated since the cursor was issued or since the log was written, and
/// with [`SyncError::CeaCursorNotFound`] when retention has passed the
/// cursor.
pub fn drip_cea_resume<S: Store>(
    store: Arc<S>,
    source: impl Into<String>,
    cursor: CeaCursor,
    rule: CeaRule,
) -> BoxStream<'static, Result<CsEvent>> {
    resume_stream(store, source.into(), cursor, rule).boxed()
}

/// Replay the log of `source` from its first entry with a wall clock at or
/// after `point`.
///
/// Yields nothing when every entry is older than `point`. Fails with
/// [`SyncError::CollectionMismatch`] when the log was written for an earlier
/// generation of the collection, and with [`SyncError::CeaCursorNotFound`]
/// when entries at or after `point` have already been expired.
pub fn drip_cea_start<S: Store>(
    store: Arc<S>,
    source: impl Into<String>,
    point: DateTime<Utc>,
    rule: CeaRule,
) -> BoxStream<'static, Result<CsEvent>> {
    start_stream(store, source.into(), point, rule).boxed()
}

/// Identity of the current generation of `source`, checked against the one a
/// cursor was issued for.
pub(crate) async fn current_generation<S>(
    store: &S,
    source: &str,
    expected: CollectionId,
) -> Result<CollectionId>
where
    S: SourceStore + ?Sized,
{
    let found = match store.collection_id(source).await {
        Ok(id) => Some(id),
        Err(StoreError::CollectionNotFound(_)) => None,
        Err(err) => return Err(err.into()),
    };
    match found {
        Some(id) if id == expected => Ok(id),
        found => Err(SyncError::CollectionMismatch { expected, found }),
    }
}

fn resume_stream<S: Store>(
    store: Arc<S>,
    source: String,
    cursor: CeaCursor,
    rule: CeaRule,
) -> impl Stream<Item = Result<CsEvent>> + Send + 'static {
    try_stream! {
        let current = current_generation(&*store, &source, cursor.collection_id).await?;
        ensure_log_generation(&*store, &source, current).await?;
        ensure_retained(&*store, &source, cursor.key).await?;
        for await event in replay(store, source, cursor, rule) {
            yield event?;
        }
    }
}

fn start_stream<S: Store>(
    store: Arc<S>,
    source: String,
    point: DateTime<Utc>,
    rule: CeaRule,
) -> impl Stream<Item = Result<CsEvent>> + Send + 'static {
    try_stream! {
        let collection_id = store.collection_id(&source).await?;
        ensure_log_generation(&*store, &source, collection_id).await?;
        if let Some(boundary) = store.retention_boundary(&source).await? {
            expired_since(boundary, point)?;
        }
        let first = store.first_entry_at_or_after_wall_clock(&source, point).await?;
        if let Some(first) = first {
            let cursor = CeaCursor::new(collection_id, first.just_before());
            debug!(source = %source, point = %point, cursor = %cursor, "Derived replay cursor");
            for await event in replay(store, source, cursor, rule) {
                yield event?;
            }
        }
    }
}

/// Fails when the log was written for another generation of the source.
async fn ensure_log_generation<S>(store: &S, source: &str, current: CollectionId) -> Result<()>
where
    S: LogStore + ?Sized,
{
    match store.log_collection_id(source).await? {
        Some(bound) if bound != current => Err(SyncError::CollectionMismatch {
            expected: bound,
            found: Some(current),
        }),
        _ => Ok(()),
    }
}

/// Fails when entries at or after `point` were expired.
fn expired_since(boundary: RetentionBoundary, point: DateTime<Utc>) -> Result<()> {
    if boundary.wall_clock >= point {
        Err(SyncError::CeaCursorNotFound {
            cursor: OrderKey::MIN,
            boundary: boundary.key,
        })
    } else {
        Ok(())
    }
}

async fn ensure_retained<S>(store: &S, source: &str, key: OrderKey) -> Result<()>
where
    S: LogStore + ?Sized,
{
    match store.retention_boundary(source).await? {
        Some(boundary) if boundary.covers(&key) => Err(SyncError::CeaCursorNotFound {
            cursor: key,
            boundary: boundary.key,
        }),
        _ => Ok(()),
    }
}

/// One gated pass over `(cursor, gate)`.
fn replay<S: Store>(
    store: Arc<S>,
    source: String,
    cursor: CeaCursor,
    rule: CeaRule,
) -> impl Stream<Item = Result<CsEvent>> + Send + 'static {
    try_stream! {
        let collection_id = cursor.collection_id;
        if let Some(max_key) = store.last_key(&source).await? {
            let gate = OrderKey::lower_bound(max_key.cluster_time);
            let range = PcsQuery::between(cursor.key, gate);

            let matched = store
                .scan_log(
                    &source,
                    range
                        .clone()
                        .kinds(&[PcsKind::Insertion, PcsKind::Update])
                        .matching(Image::After, rule.after.clone()),
                )
                .map(move |r| {
                    r.map_err(SyncError::from).and_then(|e| addition(collection_id, e))
                });

            let left_by_update = ordered_subtract(
                store.scan_log(
                    &source,
                    range
                        .clone()
                        .kinds(&[PcsKind::Update])
                        .matching(Image::Before, rule.before.clone()),
                ),
                store.scan_log(
                    &source,
                    range
                        .clone()
                        .kinds(&[PcsKind::Update])
                        .matching(Image::After, rule.after.clone()),
                ),
            )
            .map(move |r| r.map_err(SyncError::from).and_then(|e| subtraction(collection_id, e)));

            let deleted = store
                .scan_log(
                    &source,
                    range.kinds(&[PcsKind::Deletion]).matching(Image::Before, rule.before.clone()),
                )
                .map(move |r| {
                    r.map_err(SyncError::from).and_then(|e| subtraction(collection_id, e))
                });

            let mut last = cursor.key;
            let mut emitted = 0usize;
            for await event in ordered_union(matched, ordered_union(left_by_update, deleted)) {
                let event = event?;
                last = event.cursor.key;
                emitted += 1;
                yield event;
            }

            // Entries removed while the pass ran would be silently missing.
            ensure_retained(&*store, &source, cursor.key).await?;

            if let Some(noop) = store.last_noop_between(&source, last, gate).await? {
                yield CsEvent::new(CeaCursor::new(collection_id, noop.key()), CsOp::Noop);
            }
            debug!(source = %source, emitted, gate = %gate, "Replay pass finished");
        }
    }
}

fn addition(collection_id: CollectionId, event: PcsEvent) -> Result<CsEvent> {
    let cursor = CeaCursor::new(collection_id, event.key());
    let kind = event.kind();
    match event.op {
        PcsOp::Insertion { after, .. } | PcsOp::Update { after, .. } => {
            Ok(CsEvent::new(cursor, CsOp::Addition { full: after }))
        }
        _ => Err(unexpected(kind, cursor)),
    }
}

fn subtraction(collection_id: CollectionId, event: PcsEvent) -> Result<CsEvent> {
    let cursor = CeaCursor::new(collection_id, event.key());
    let kind = event.kind();
    match event.op {
        PcsOp::Update { key, .. } | PcsOp::Deletion { key, .. } => {
            Ok(CsEvent::new(cursor, CsOp::Subtraction { id: key }))
        }
        _ => Err(unexpected(kind, cursor)),
    }
}

fn unexpected(kind: PcsKind, cursor: CeaCursor) -> SyncError {
    StoreError::MalformedEntry(format!("unexpected {:?} entry at {}", kind, cursor.key)).into()
}
