//! Backing-store seams.
//!
//! Replication only talks to the store through these traits. The source side
//! ([`SourceStore`], [`ChangeFeed`]) reads the watched collection; the log side
//! ([`LogStore`]) owns the Persisted Change Stream, its metadata record and
//! its retention boundary.

use crate::change::{ChangeEvent, OperationType};
use crate::cursor::{CollectionId, FeedPosition, ResumeToken, RetentionBoundary};
use crate::document::{Document, DocumentKey};
use crate::error::Result;
use crate::event::{PcsEvent, PcsKind};
use crate::rule::Rule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drip_core::{ClusterTime, OrderKey};
use futures::stream::BoxStream;
use std::time::Duration;

/// A causally consistent session.
///
/// Reads issued in a session never observe a state older than its cluster
/// time, and the cluster time only moves forward.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CausalSession {
    cluster_time: Option<ClusterTime>,
}

impl CausalSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.cluster_time
    }

    /// Move the session's cluster time forward to at least `to`.
    pub fn advance_cluster_time(&mut self, to: ClusterTime) {
        if self.cluster_time.map_or(true, |ct| ct < to) {
            self.cluster_time = Some(to);
        }
    }
}

/// How to open a change feed.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchOptions {
    /// Resume strictly after this token; `None` starts from now.
    pub resume_after: Option<ResumeToken>,
    /// Deliver pre-images for updates, replaces and deletes.
    pub before_images: bool,
    /// Data operations to deliver. Invalidations are always delivered.
    pub operation_types: Vec<OperationType>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            resume_after: None,
            before_images: true,
            operation_types: OperationType::DATA.to_vec(),
        }
    }
}

/// Which image of a log entry a [`PcsQuery`] filter applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Image {
    Before,
    After,
}

/// A range scan over a log: entries strictly between `after` and `before`,
/// restricted to `kinds` and, optionally, to entries whose `image` satisfies
/// a rule.
#[derive(Clone, Debug, PartialEq)]
pub struct PcsQuery {
    pub after: OrderKey,
    pub before: OrderKey,
    pub kinds: Vec<PcsKind>,
    pub filter: Option<(Image, Rule)>,
}

impl PcsQuery {
    /// Every entry in `(after, before)`.
    pub fn between(after: OrderKey, before: OrderKey) -> Self {
        Self {
            after,
            before,
            kinds: vec![PcsKind::Insertion, PcsKind::Update, PcsKind::Deletion, PcsKind::Noop],
            filter: None,
        }
    }

    pub fn kinds(mut self, kinds: &[PcsKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn matching(mut self, image: Image, rule: Rule) -> Self {
        self.filter = Some((image, rule));
        self
    }

    /// Whether `event` belongs to the result.
    pub fn admits(&self, event: &PcsEvent) -> Result<bool> {
        let key = event.key();
        if key <= self.after || key >= self.before || !self.kinds.contains(&event.kind()) {
            return Ok(false);
        }
        match &self.filter {
            None => Ok(true),
            Some((image, rule)) => {
                let doc = match image {
                    Image::Before => event.before(),
                    Image::After => event.after(),
                };
                match doc {
                    Some(doc) => rule.matches(doc),
                    None => Ok(false),
                }
            }
        }
    }
}

/// Ascending stream of log entries.
pub type LogStream = BoxStream<'static, Result<PcsEvent>>;

/// Read access to source collections.
#[async_trait]
pub trait SourceStore: Send + Sync + 'static {
    /// Identity of the current generation of `source`.
    async fn collection_id(&self, source: &str) -> Result<CollectionId>;

    async fn start_session(&self) -> Result<CausalSession>;

    /// Perform a majority-durable read in `session` and return the cluster
    /// time it observed. The session advances to that time.
    async fn majority_read_time(&self, session: &mut CausalSession) -> Result<ClusterTime>;

    /// Up to `limit` documents of `source` satisfying `rule` with key
    /// strictly greater than `after`, ascending by key, read under majority
    /// concern in `session`. Also returns the cluster time of the read.
    async fn scan_source(
        &self,
        session: &mut CausalSession,
        source: &str,
        rule: &Rule,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<(Vec<Document>, ClusterTime)>;

    /// Open a change feed on `source`.
    async fn watch(&self, source: &str, options: WatchOptions) -> Result<Box<dyn ChangeFeed>>;
}

/// A live change feed.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait up to `wait` for the next data event.
    ///
    /// Returns `Ok(None)` when the wait elapsed without one; the feed's
    /// position may still have moved.
    async fn next_within(&mut self, wait: Duration) -> Result<Option<ChangeEvent>>;

    /// Current position, including progress made without data events.
    fn position(&self) -> Option<FeedPosition>;

    /// Release the feed. Further reads fail with `CursorKilled`.
    fn close(&mut self);
}

/// The Persisted Change Stream of each source, with its metadata.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Append already-ordered entries.
    ///
    /// The first append to a log binds it to the generation of `source`
    /// current at that moment, when the source exists. The binding never
    /// changes afterwards.
    async fn append(&self, source: &str, events: &[PcsEvent]) -> Result<()>;

    /// The source generation the log was written for, once bound.
    async fn log_collection_id(&self, source: &str) -> Result<Option<CollectionId>>;

    async fn save_resume_token(&self, source: &str, token: &ResumeToken) -> Result<()>;

    async fn load_resume_token(&self, source: &str) -> Result<Option<ResumeToken>>;

    async fn last_key(&self, source: &str) -> Result<Option<OrderKey>>;

    /// Greatest key strictly less than `key`.
    async fn key_before(&self, source: &str, key: OrderKey) -> Result<Option<OrderKey>>;

    /// Greatest key whose entry's wall clock is strictly before `until`.
    async fn last_key_before_wall_clock(
        &self,
        source: &str,
        until: DateTime<Utc>,
    ) -> Result<Option<OrderKey>>;

    /// Smallest key whose entry's wall clock is at or after `point`.
    async fn first_entry_at_or_after_wall_clock(
        &self,
        source: &str,
        point: DateTime<Utc>,
    ) -> Result<Option<OrderKey>>;

    /// Lazily scan the entries admitted by `query`, ascending.
    fn scan_log(&self, source: &str, query: PcsQuery) -> LogStream;

    /// The latest noop strictly between `after` and `before`.
    async fn last_noop_between(
        &self,
        source: &str,
        after: OrderKey,
        before: OrderKey,
    ) -> Result<Option<PcsEvent>>;

    /// Atomically delete every entry at or before `key` and record the last
    /// deleted entry as the retention boundary. Returns the new boundary, or
    /// `None` when nothing was deleted.
    async fn delete_through(
        &self,
        source: &str,
        key: OrderKey,
    ) -> Result<Option<(u64, RetentionBoundary)>>;

    async fn retention_boundary(&self, source: &str) -> Result<Option<RetentionBoundary>>;
}

/// A store serving both sides.
pub trait Store: SourceStore + LogStore {}

impl<T: SourceStore + LogStore> Store for T {}
