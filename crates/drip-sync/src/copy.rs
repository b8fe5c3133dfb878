//! Collection Copy: a resumable, causally consistent snapshot of a source.
//!
//! A fresh copy first performs a majority read in a new causal session and
//! reports the observed cluster time `B` as its start marker. Replay started
//! from `B` then covers every write the scan may have missed. The scan pages
//! through the rule-filtered source in ascending key order inside the same
//! session, so the cluster times reported by successive batches never go
//! backwards.

use crate::cea::current_generation;
use crate::error::{Result, SyncError};
use async_stream::try_stream;
use drip_core::ClusterTime;
use drip_store::{CcCursor, CeaCursor, Document, DocumentKey, Rule, SourceStore};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Configuration for a collection copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Documents per batch.
    pub batch_size: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// What a caller keeps to continue an interrupted copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcResume {
    pub cursor: CcCursor,
    /// Cluster time of the last batch received.
    pub cluster_time: ClusterTime,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CcItem {
    /// Emitted once, first, by a fresh copy. Replay from `cea_cursor`
    /// afterwards.
    Start {
        cea_cursor: CeaCursor,
        cluster_time: ClusterTime,
    },
    Batch {
        documents: Vec<Document>,
        cluster_time: ClusterTime,
        /// Resume point after this batch.
        cursor: CcCursor,
    },
}

/// A batch already serialized as a JSON array, ready to forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCcBatch {
    pub payload: Vec<u8>,
    pub count: usize,
    pub cluster_time: ClusterTime,
    pub cursor: CcCursor,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawCcItem {
    Start {
        cea_cursor: CeaCursor,
        cluster_time: ClusterTime,
    },
    Batch(RawCcBatch),
}

/// Copy the documents of `source` matching `rule`.
///
/// With `resume`, the copy continues after `resume.cursor` and does not emit
/// a start marker; the cursor must belong to the current generation of the
/// collection. A copy that finds no documents still yields one empty batch.
pub fn drip_cc<S: SourceStore>(
    store: Arc<S>,
    source: impl Into<String>,
    rule: Rule,
    resume: Option<CcResume>,
    config: CopyConfig,
) -> BoxStream<'static, Result<CcItem>> {
    copy_stream(store, source.into(), rule, resume, config).boxed()
}

/// [`drip_cc`] with batches serialized to JSON bytes.
pub fn drip_cc_raw<S: SourceStore>(
    store: Arc<S>,
    source: impl Into<String>,
    rule: Rule,
    resume: Option<CcResume>,
    config: CopyConfig,
) -> BoxStream<'static, Result<RawCcItem>> {
    copy_stream(store, source.into(), rule, resume, config)
        .map(|item| item.and_then(into_raw))
        .boxed()
}

fn into_raw(item: CcItem) -> Result<RawCcItem> {
    match item {
        CcItem::Start {
            cea_cursor,
            cluster_time,
        } => Ok(RawCcItem::Start {
            cea_cursor,
            cluster_time,
        }),
        CcItem::Batch {
            documents,
            cluster_time,
            cursor,
        } => {
            let payload = serde_json::to_vec(&documents)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            Ok(RawCcItem::Batch(RawCcBatch {
                payload,
                count: documents.len(),
                cluster_time,
                cursor,
            }))
        }
    }
}

fn copy_stream<S: SourceStore>(
    store: Arc<S>,
    source: String,
    rule: Rule,
    resume: Option<CcResume>,
    config: CopyConfig,
) -> impl Stream<Item = Result<CcItem>> + Send + 'static {
    try_stream! {
        let batch_size = config.batch_size.max(1);
        let mut session = store.start_session().await?;
        let collection_id = match &resume {
            Some(resume) => {
                current_generation(&*store, &source, resume.cursor.collection_id).await?
            }
            None => store.collection_id(&source).await?,
        };

        let mut cursor = match resume {
            Some(resume) => {
                session.advance_cluster_time(resume.cluster_time);
                debug!(
                    source = %source,
                    last_key = ?resume.cursor.last_key,
                    "Resuming collection copy"
                );
                resume.cursor
            }
            None => {
                let start = store.majority_read_time(&mut session).await?;
                debug!(source = %source, cluster_time = %start, "Starting collection copy");
                yield CcItem::Start {
                    cea_cursor: CeaCursor::at_cluster_time(collection_id, start),
                    cluster_time: start,
                };
                CcCursor::new(collection_id)
            }
        };

        let mut batches = 0usize;
        loop {
            let (documents, cluster_time) = store
                .scan_source(&mut session, &source, &rule, cursor.last_key.as_ref(), batch_size)
                .await?;
            let Some(last) = documents.last() else {
                if batches == 0 {
                    yield CcItem::Batch {
                        documents,
                        cluster_time,
                        cursor: cursor.clone(),
                    };
                }
                break;
            };
            let last_key = DocumentKey::of(last)?;
            cursor = cursor.advanced_to(last_key);
            let complete = documents.len() < batch_size;
            batches += 1;
            yield CcItem::Batch {
                documents,
                cluster_time,
                cursor: cursor.clone(),
            };
            if complete {
                break;
            }
        }
        debug!(source = %source, batches, "Collection copy finished");
    }
}
