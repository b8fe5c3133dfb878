//! Single-slot write sequencer.
//!
//! One writer task owns every write to a log. Batches reach it through an
//! ordered channel and are applied one at a time in submission order, so the
//! log never observes a later batch before an earlier one settles.
//!
//! After a failed write the writer is poisoned: every later batch is answered
//! with the same error instead of being written, which keeps the log a gap-free
//! prefix of what was submitted.

use crate::error::{PersistError, Result};
use drip_store::{LogStore, PcsEvent, ResumeToken};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One unit of work for the writer.
///
/// The events are appended first, then `token` is saved. A batch with no
/// events is a token-only write; one with neither is a barrier that settles
/// once everything submitted before it has.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    pub events: Vec<PcsEvent>,
    pub token: Option<ResumeToken>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.token.is_none()
    }
}

/// Totals reported by the writer when it stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches: u64,
    pub events: u64,
    pub last_token: Option<ResumeToken>,
}

enum Command {
    Write(WriteBatch, oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<WriterStats>),
}

/// Handle to the writer task.
#[derive(Clone)]
pub struct WriteSequencer {
    tx: mpsc::UnboundedSender<Command>,
}

impl WriteSequencer {
    /// Spawn the writer for the log of `source`.
    pub fn spawn<S: LogStore>(store: Arc<S>, source: String) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(writer_loop(store, source, rx));
        (Self { tx }, task)
    }

    /// Queue `batch` behind everything submitted so far.
    ///
    /// Submission order is fixed when this returns; the receiver resolves
    /// once the batch has been written.
    pub fn submit(&self, batch: WriteBatch) -> oneshot::Receiver<Result<()>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        // A closed writer drops the ack, which the receiver reports.
        let _ = self.tx.send(Command::Write(batch, ack_tx));
        ack_rx
    }

    /// Submit `batch` and wait for it to settle.
    pub async fn write(&self, batch: WriteBatch) -> Result<()> {
        settle(self.submit(batch)).await
    }

    /// Stop the writer after everything already submitted.
    pub async fn stop(&self) -> Result<WriterStats> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Stop(ack_tx))
            .map_err(|_| PersistError::WriterClosed)?;
        ack_rx.await.map_err(|_| PersistError::WriterClosed)
    }
}

/// Wait for a submitted batch.
pub async fn settle(ack: oneshot::Receiver<Result<()>>) -> Result<()> {
    ack.await.map_err(|_| PersistError::WriterClosed)?
}

async fn writer_loop<S: LogStore>(
    store: Arc<S>,
    source: String,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut stats = WriterStats::default();
    let mut poisoned: Option<PersistError> = None;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(batch, ack) => {
                let result = match &poisoned {
                    Some(err) => Err(err.clone()),
                    None => write_batch(&*store, &source, &batch).await,
                };
                match &result {
                    Ok(()) if !batch.is_empty() => {
                        stats.batches += 1;
                        stats.events += batch.events.len() as u64;
                        if batch.token.is_some() {
                            stats.last_token = batch.token.clone();
                        }
                        debug!(source = %source, events = batch.events.len(), "Wrote batch");
                    }
                    Ok(()) => {}
                    Err(err) if poisoned.is_none() => {
                        warn!(source = %source, error = %err, "Batch write failed");
                        poisoned = Some(err.clone());
                    }
                    Err(_) => {}
                }
                let _ = ack.send(result);
            }
            Command::Stop(ack) => {
                let _ = ack.send(stats.clone());
                break;
            }
        }
    }
}

async fn write_batch<S: LogStore>(store: &S, source: &str, batch: &WriteBatch) -> Result<()> {
    if !batch.events.is_empty() {
        store.append(source, &batch.events).await?;
    }
    if let Some(token) = &batch.token {
        store.save_resume_token(source, token).await?;
    }
    Ok(())
}
