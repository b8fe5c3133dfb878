//! The persister: a live change feed, durably appended to a log.
//!
//! One persister runs per watched source. On start it refuses a log bound to
//! an earlier generation of the source, then loads the metadata record and
//! resumes the feed after the saved token, or opens it at "now" when there is
//! none. Every wait cycle either delivers a data event, which
//! is translated and buffered, or comes back empty.
//!
//! Empty cycles drive liveness markers. A cycle in which the feed position
//! moved without data leaves a noop candidate; if the following cycle is
//! empty as well, the candidate is written as a `Noop` together with the
//! newer token. A candidate sharing its cluster-time second with the last
//! noop only refreshes the token.

use crate::buffer::FlushBuffer;
use crate::config::PersisterConfig;
use crate::error::{PersistError, Result};
use chrono::{DateTime, Utc};
use drip_core::{EntryIdGenerator, SharedClock, SystemClock};
use drip_delta::encode;
use drip_store::{
    ChangeEvent, ChangeKind, FeedPosition, OperationType, PcsEvent, PcsOp, ResumeToken, Store,
    StoreError, WatchOptions,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a finished run accomplished.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersisterSummary {
    /// Whether the run resumed from a saved token.
    pub resumed: bool,
    /// Data and noop entries written.
    pub events_written: u64,
    pub noops_written: u64,
    pub batches_written: u64,
    /// The token saved by the last write of this run.
    pub last_token: Option<ResumeToken>,
}

/// Handle to a running persister.
#[derive(Debug)]
pub struct PersisterHandle {
    source: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<PersisterSummary>>>,
}

impl PersisterHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the run has ended, cleanly or not.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Close the feed, write what is buffered and wait for the run to end.
    pub async fn stop(mut self) -> Result<PersisterSummary> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait for the run to end on its own (a fatal or propagated error).
    pub async fn join(mut self) -> Result<PersisterSummary> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| PersistError::TaskFailed(format!("task panicked: {e}")))?,
            None => Ok(PersisterSummary::default()),
        }
    }
}

/// Start persisting `source` with the system clock.
pub fn run_persister<S: Store>(
    store: Arc<S>,
    source: impl Into<String>,
    config: PersisterConfig,
) -> PersisterHandle {
    Persister::new(store, source).config(config).spawn()
}

/// Persister builder.
pub struct Persister<S> {
    store: Arc<S>,
    source: String,
    config: PersisterConfig,
    clock: SharedClock,
}

impl<S: Store> Persister<S> {
    pub fn new(store: Arc<S>, source: impl Into<String>) -> Self {
        Self {
            store,
            source: source.into(),
            config: PersisterConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: PersisterConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock stamping noop entries.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> PersisterHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let source = self.source.clone();
        let task = tokio::spawn(self.run(shutdown_rx));
        PersisterHandle {
            source,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<PersisterSummary> {
        self.check_generation().await?;
        let saved = self.store.load_resume_token(&self.source).await?;
        let resumed = saved.is_some();
        let options = WatchOptions {
            resume_after: saved.clone(),
            before_images: true,
            operation_types: OperationType::DATA.to_vec(),
        };
        let mut feed = self.store.watch(&self.source, options).await?;
        match &saved {
            Some(token) => info!(source = %self.source, token = %token, "Persister resumed"),
            None => info!(source = %self.source, "Persister started fresh"),
        }

        let buffer = FlushBuffer::new(
            Arc::clone(&self.store),
            self.source.clone(),
            self.config.max_batch_size,
        );
        let mut ids = EntryIdGenerator::new();
        let mut noops = NoopTracker::new(feed.position());
        let mut noops_written = 0u64;

        let outcome: Result<()> = loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(source = %self.source, "Stop requested");
                    feed.close();
                    break Ok(());
                }
                next = feed.next_within(self.config.max_await()) => next,
            };

            match next {
                Ok(Some(change)) => {
                    noops.data_seen(feed.position());
                    let token = change.token.clone();
                    let event = match self.translate(change, &mut ids) {
                        Ok(event) => event,
                        Err(err) => break Err(err),
                    };
                    if let Err(err) = buffer.push(event, token).await {
                        break Err(err);
                    }
                }
                Ok(None) => match noops.idle(feed.position(), self.clock.now()) {
                    NoopDecision::Wait => {}
                    NoopDecision::Emit { candidate, token } => {
                        let Some(id) = ids.next_id() else {
                            break Err(PersistError::IdSpaceExhausted);
                        };
                        let noop = PcsEvent::noop(
                            id,
                            candidate.position.cluster_time,
                            candidate.wall_clock,
                        );
                        debug!(
                            source = %self.source,
                            cluster_time = %noop.cluster_time,
                            "Writing noop"
                        );
                        noops_written += 1;
                        if let Err(err) = buffer.push(noop, token).await {
                            break Err(err);
                        }
                    }
                    NoopDecision::Refresh { token } => {
                        if let Err(err) = buffer.push_token(token) {
                            break Err(err);
                        }
                    }
                },
                Err(StoreError::CursorKilled) => {
                    info!(source = %self.source, "Change feed closed");
                    break Ok(());
                }
                Err(err) => break Err(err.into()),
            }
        };

        feed.close();
        let closed = buffer.close().await;
        match (outcome, closed) {
            (Ok(()), Ok(stats)) => {
                let summary = PersisterSummary {
                    resumed,
                    events_written: stats.events,
                    noops_written,
                    batches_written: stats.batches,
                    last_token: stats.last_token,
                };
                info!(
                    source = %self.source,
                    events = summary.events_written,
                    noops = summary.noops_written,
                    batches = summary.batches_written,
                    "Persister stopped"
                );
                Ok(summary)
            }
            (Ok(()), Err(err)) => {
                warn!(source = %self.source, error = %err, "Persister failed while draining");
                Err(err)
            }
            (Err(err), _) => {
                warn!(
                    source = %self.source,
                    error = %err,
                    class = %err.class(),
                    "Persister failed"
                );
                Err(err)
            }
        }
    }

    /// A log bound to an earlier generation of the source is never extended
    /// with entries of the current one.
    async fn check_generation(&self) -> Result<()> {
        let current = match self.store.collection_id(&self.source).await {
            Ok(id) => id,
            Err(StoreError::CollectionNotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        match self.store.log_collection_id(&self.source).await? {
            Some(log) if log != current => {
                warn!(
                    source = %self.source,
                    log = %log,
                    current = %current,
                    "Log belongs to a dropped collection"
                );
                Err(PersistError::LogGenerationMismatch { log, current })
            }
            _ => Ok(()),
        }
    }

    fn translate(&self, change: ChangeEvent, ids: &mut EntryIdGenerator) -> Result<PcsEvent> {
        let op = match change.kind {
            ChangeKind::Insert { key, after } => PcsOp::Insertion { key, after },
            ChangeKind::Update {
                key,
                before,
                after,
                description,
            } => PcsOp::Update {
                key,
                before,
                after,
                diff: Some(encode(&description)),
            },
            ChangeKind::Replace { key, before, after } => PcsOp::Update {
                key,
                before,
                after,
                diff: None,
            },
            ChangeKind::Delete { key, before } => PcsOp::Deletion { key, before },
            ChangeKind::Invalidate { operation } => {
                return Err(PersistError::CollectionInvalidated {
                    collection: self.source.clone(),
                    operation,
                })
            }
        };
        let id = ids.next_id().ok_or(PersistError::IdSpaceExhausted)?;
        Ok(PcsEvent::new(id, change.cluster_time, change.wall_clock, op))
    }
}

/// A position the feed reached without delivering data.
#[derive(Clone, Debug, PartialEq)]
pub struct NoopCandidate {
    pub position: FeedPosition,
    pub wall_clock: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NoopDecision {
    /// Nothing to write this cycle.
    Wait,
    /// Write `candidate` as a noop and save `token`.
    Emit { candidate: NoopCandidate, token: ResumeToken },
    /// Save `token` only.
    Refresh { token: ResumeToken },
}

/// Noop spacing state across wait cycles.
#[derive(Clone, Debug)]
pub struct NoopTracker {
    last_position: Option<FeedPosition>,
    candidate: Option<NoopCandidate>,
    last_noop_second: Option<u32>,
}

impl NoopTracker {
    pub fn new(position: Option<FeedPosition>) -> Self {
        Self {
            last_position: position,
            candidate: None,
            last_noop_second: None,
        }
    }

    /// A data event arrived.
    pub fn data_seen(&mut self, position: Option<FeedPosition>) {
        self.candidate = None;
        self.last_position = position;
    }

    /// A cycle ended without data.
    pub fn idle(&mut self, position: Option<FeedPosition>, now: DateTime<Utc>) -> NoopDecision {
        let moved = position.is_some() && position != self.last_position;
        let decision = match (self.candidate.take(), &position) {
            (Some(candidate), Some(current)) => {
                if self.last_noop_second == Some(candidate.position.cluster_time.t) {
                    NoopDecision::Refresh {
                        token: current.token.clone(),
                    }
                } else {
                    self.last_noop_second = Some(candidate.position.cluster_time.t);
                    NoopDecision::Emit {
                        candidate,
                        token: current.token.clone(),
                    }
                }
            }
            (None, Some(current)) if moved => {
                self.candidate = Some(NoopCandidate {
                    position: current.clone(),
                    wall_clock: now,
                });
                NoopDecision::Wait
            }
            _ => NoopDecision::Wait,
        };
        self.last_position = position;
        decision
    }
}
