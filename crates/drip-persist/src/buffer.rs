//! Flush buffer coalescing events into batch writes.
//!
//! A push that brings the buffer to `max_batch_size` writes the buffered
//! events and waits for the write. A smaller push schedules a flush on the
//! next scheduler tick, unless one is already scheduled, so a burst of pushes
//! made without yielding lands in one write. A scheduled flush that fails is
//! reported by the next push or flush.

use crate::error::{PersistError, Result};
use crate::sequencer::{settle, WriteBatch, WriteSequencer, WriterStats};
use drip_store::{LogStore, PcsEvent, ResumeToken};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Default)]
struct Pending {
    events: Vec<PcsEvent>,
    token: Option<ResumeToken>,
    scheduled: bool,
    failure: Option<PersistError>,
}

struct Shared {
    pending: Mutex<Pending>,
    sequencer: WriteSequencer,
}

impl Shared {
    /// Hand the pending batch to the writer. Taking and submitting happen
    /// under one lock so batches are submitted in the order they were taken.
    fn submit_pending(&self) -> Option<tokio::sync::oneshot::Receiver<Result<()>>> {
        let mut pending = self.pending.lock();
        pending.scheduled = false;
        let batch = WriteBatch {
            events: std::mem::take(&mut pending.events),
            token: pending.token.take(),
        };
        if batch.is_empty() {
            return None;
        }
        Some(self.sequencer.submit(batch))
    }

    async fn scheduled_flush(self: Arc<Self>) {
        tokio::task::yield_now().await;
        if let Some(ack) = self.submit_pending() {
            if let Err(err) = settle(ack).await {
                let mut pending = self.pending.lock();
                pending.failure.get_or_insert(err);
            }
        }
    }
}

pub struct FlushBuffer {
    shared: Arc<Shared>,
    max_batch_size: usize,
    writer: JoinHandle<()>,
}

impl FlushBuffer {
    /// Create a buffer writing to the log of `source` through its own
    /// sequencer.
    pub fn new<S: LogStore>(store: Arc<S>, source: String, max_batch_size: usize) -> Self {
        let (sequencer, writer) = WriteSequencer::spawn(store, source);
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending::default()),
                sequencer,
            }),
            max_batch_size: max_batch_size.max(1),
            writer,
        }
    }

    /// Buffer `event`, observed at `token`.
    pub async fn push(&self, event: PcsEvent, token: ResumeToken) -> Result<()> {
        self.take_failure()?;
        let full = {
            let mut pending = self.shared.pending.lock();
            pending.events.push(event);
            pending.token = Some(token);
            pending.events.len() >= self.max_batch_size
        };
        if full {
            self.flush().await
        } else {
            self.schedule();
            Ok(())
        }
    }

    /// Record a newer resume token with nothing to append.
    pub fn push_token(&self, token: ResumeToken) -> Result<()> {
        self.take_failure()?;
        self.shared.pending.lock().token = Some(token);
        self.schedule();
        Ok(())
    }

    /// Write everything buffered and wait until every earlier write settled.
    pub async fn flush(&self) -> Result<()> {
        self.take_failure()?;
        let ack = match self.shared.submit_pending() {
            Some(ack) => ack,
            // Barrier: settles after any scheduled flush already submitted.
            None => self.shared.sequencer.submit(WriteBatch::default()),
        };
        settle(ack).await?;
        self.take_failure()
    }

    pub fn len(&self) -> usize {
        self.shared.pending.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush, then stop the writer.
    ///
    /// A writer task that panicked is reported as [`PersistError::TaskFailed`]
    /// ahead of the closed-channel errors it caused.
    pub async fn close(self) -> Result<WriterStats> {
        let flushed = self.flush().await;
        let stats = self.shared.sequencer.stop().await;
        if let Err(err) = self.writer.await {
            warn!(error = %err, "Writer task failed");
            return Err(PersistError::TaskFailed(format!("writer task failed: {err}")));
        }
        flushed?;
        stats
    }

    fn schedule(&self) {
        {
            let mut pending = self.shared.pending.lock();
            if pending.scheduled {
                return;
            }
            pending.scheduled = true;
        }
        tokio::spawn(Arc::clone(&self.shared).scheduled_flush());
    }

    fn take_failure(&self) -> Result<()> {
        match self.shared.pending.lock().failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
