//! In-memory reference store.
//!
//! [`MemoryStore`] implements every store seam in process:
//!
//! - source collections with a generation id that changes on drop/re-create
//! - a hybrid cluster clock: `t` follows the wall clock's seconds, `i`
//!   counts commits within a second; every write of a transaction shares one
//!   cluster time
//! - a capped oplog backing the change feeds. [`MemoryStore::tick`] records
//!   an idle entry that advances feed positions without data. Entries past
//!   the capacity are discarded oldest first, and
//!   [`MemoryStore::truncate_oplog`] discards them all; either way older
//!   resume tokens expire
//! - one Persisted Change Stream per source, kept as stored documents and
//!   decoded on every read, plus its retention boundary
//! - the metadata collection, holding each log's resume token and the
//!   source generation the log is bound to
//!
//! Cloning a `MemoryStore` yields another handle to the same data.

use crate::change::{ChangeEvent, OperationType, RawChange};
use crate::cursor::{CollectionId, FeedPosition, ResumeToken, RetentionBoundary};
use crate::document::{into_document, Document, DocumentKey, ID_FIELD};
use crate::error::{Result, StoreError};
use crate::event::PcsEvent;
use crate::naming::{pcs_collection, METADATA_COLLECTION};
use crate::rule::Rule;
use crate::store::{
    CausalSession, ChangeFeed, LogStore, LogStream, PcsQuery, SourceStore, WatchOptions,
};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drip_core::{ClusterTime, OrderKey, SharedClock, SystemClock};
use drip_delta::{apply_update_description, UpdateDescription};
use futures::Stream;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Log entries decoded per lock acquisition while scanning.
const SCAN_PAGE: usize = 64;

/// Oplog entries kept before the oldest are discarded.
pub const DEFAULT_OPLOG_CAPACITY: usize = 65_536;

const RESUME_TOKEN_FIELD: &str = "resumeToken";
const COLLECTION_ID_FIELD: &str = "collectionId";

/// One write of a [`MemoryStore::transaction`].
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    Insert(Value),
    Update(DocumentKey, UpdateDescription),
    Replace(Value),
    Delete(DocumentKey),
}

#[derive(Clone, Debug)]
struct DataChange {
    operation: OperationType,
    key: DocumentKey,
    before: Option<Document>,
    after: Option<Document>,
    description: Option<UpdateDescription>,
}

#[derive(Clone, Debug)]
enum OplogBody {
    /// Periodic idle entry; moves feeds forward without data.
    Tick,
    Change { source: String, change: DataChange },
    Drop { source: String },
    /// Delivered verbatim to feeds on `source`.
    Raw { source: String, value: Value },
}

#[derive(Clone, Debug)]
struct OplogEntry {
    seq: u64,
    cluster_time: ClusterTime,
    wall_clock: DateTime<Utc>,
    body: OplogBody,
}

#[derive(Clone, Debug)]
struct SourceCollection {
    id: CollectionId,
    docs: BTreeMap<DocumentKey, Document>,
}

impl SourceCollection {
    fn new() -> Self {
        Self {
            id: CollectionId::generate(),
            docs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct PcsLog {
    entries: BTreeMap<OrderKey, Document>,
    boundary: Option<RetentionBoundary>,
}

#[derive(Debug, Default)]
struct State {
    last_cluster_time: ClusterTime,
    collections: HashMap<String, SourceCollection>,
    oplog: VecDeque<OplogEntry>,
    /// Highest sequence number handed out; zero before the first entry.
    last_seq: u64,
    /// Every entry up to and including this sequence number is gone.
    truncated_through: u64,
    oplog_capacity: usize,
    /// Keyed by PCS collection name.
    logs: HashMap<String, PcsLog>,
    /// The metadata collection, keyed by source name.
    metadata: HashMap<String, Document>,
    append_failures: usize,
}

impl State {
    fn next_cluster_time(&mut self, wall_clock: DateTime<Utc>) -> ClusterTime {
        let secs = wall_clock.timestamp().clamp(0, u32::MAX as i64) as u32;
        let next = if secs > self.last_cluster_time.t {
            ClusterTime::new(secs, 1)
        } else {
            ClusterTime::new(self.last_cluster_time.t, self.last_cluster_time.i.saturating_add(1))
        };
        self.last_cluster_time = next;
        next
    }

    fn push_oplog(
        &mut self,
        cluster_time: ClusterTime,
        wall_clock: DateTime<Utc>,
        body: OplogBody,
    ) -> u64 {
        self.last_seq += 1;
        self.oplog.push_back(OplogEntry {
            seq: self.last_seq,
            cluster_time,
            wall_clock,
            body,
        });
        self.trim_oplog();
        self.last_seq
    }

    fn trim_oplog(&mut self) {
        while self.oplog.len() > self.oplog_capacity {
            if let Some(dropped) = self.oplog.pop_front() {
                self.truncated_through = dropped.seq;
            }
        }
    }

    fn log(&self, source: &str) -> Option<&PcsLog> {
        self.logs.get(&pcs_collection(source))
    }

    fn log_mut(&mut self, source: &str) -> &mut PcsLog {
        self.logs.entry(pcs_collection(source)).or_default()
    }

    fn metadata_mut(&mut self, source: &str) -> &mut Document {
        self.metadata.entry(source.to_string()).or_insert_with(|| {
            let mut record = Document::new();
            record.insert(ID_FIELD.to_string(), Value::String(source.to_string()));
            record
        })
    }

    fn check_token(&self, seq: u64, token: &ResumeToken) -> Result<()> {
        if seq < self.truncated_through {
            return Err(StoreError::InvalidResumeToken(format!(
                "token {} is no longer in the oplog",
                token
            )));
        }
        if seq > self.last_seq {
            return Err(StoreError::InvalidResumeToken(format!(
                "token {} is ahead of the oplog",
                token
            )));
        }
        Ok(())
    }
}

struct Inner {
    state: RwLock<State>,
    clock: SharedClock,
    oplog_tx: watch::Sender<u64>,
}

/// In-process store for tests and simulation.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("MemoryStore")
            .field("cluster_time", &state.last_cluster_time)
            .field("collections", &state.collections.len())
            .field("oplog_len", &state.oplog.len())
            .finish()
    }
}

fn token_for(seq: u64) -> ResumeToken {
    ResumeToken::new(format!("{:016x}", seq))
}

fn parse_token(token: &ResumeToken) -> Result<u64> {
    let raw = token.as_str();
    if raw.len() != 16 {
        return Err(StoreError::InvalidResumeToken(format!("malformed token {}", token)));
    }
    u64::from_str_radix(raw, 16)
        .map_err(|_| StoreError::InvalidResumeToken(format!("malformed token {}", token)))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        let (oplog_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    oplog_capacity: DEFAULT_OPLOG_CAPACITY,
                    ..State::default()
                }),
                clock,
                oplog_tx,
            }),
        }
    }

    pub fn clock(&self) -> SharedClock {
        Arc::clone(&self.inner.clock)
    }

    /// The latest cluster time handed out.
    pub fn cluster_time(&self) -> ClusterTime {
        self.inner.state.read().last_cluster_time
    }

    /// Create `source` if it does not exist, returning its id.
    pub fn create_collection(&self, source: &str) -> CollectionId {
        let mut state = self.inner.state.write();
        state
            .collections
            .entry(source.to_string())
            .or_insert_with(SourceCollection::new)
            .id
    }

    pub fn drop_collection(&self, source: &str) -> Result<ClusterTime> {
        let (seq, cluster_time) = {
            let mut state = self.inner.state.write();
            if state.collections.remove(source).is_none() {
                return Err(StoreError::CollectionNotFound(source.to_string()));
            }
            let wall_clock = self.inner.clock.now();
            let cluster_time = state.next_cluster_time(wall_clock);
            let seq = state.push_oplog(
                cluster_time,
                wall_clock,
                OplogBody::Drop {
                    source: source.to_string(),
                },
            );
            (seq, cluster_time)
        };
        self.inner.oplog_tx.send_replace(seq);
        debug!(source, %cluster_time, "Dropped collection");
        Ok(cluster_time)
    }

    pub fn insert(&self, source: &str, doc: Value) -> Result<ClusterTime> {
        self.transaction(source, vec![Write::Insert(doc)])
    }

    pub fn update(
        &self,
        source: &str,
        key: impl Into<DocumentKey>,
        description: UpdateDescription,
    ) -> Result<ClusterTime> {
        self.transaction(source, vec![Write::Update(key.into(), description)])
    }

    pub fn replace(&self, source: &str, doc: Value) -> Result<ClusterTime> {
        self.transaction(source, vec![Write::Replace(doc)])
    }

    pub fn delete(&self, source: &str, key: impl Into<DocumentKey>) -> Result<ClusterTime> {
        self.transaction(source, vec![Write::Delete(key.into())])
    }

    /// Apply `writes` atomically. Every write commits at the same cluster
    /// time and none is applied if any fails. A missing collection is
    /// created on commit.
    pub fn transaction(&self, source: &str, writes: Vec<Write>) -> Result<ClusterTime> {
        let (seq, cluster_time) = {
            let mut state = self.inner.state.write();
            if writes.is_empty() {
                return Ok(state.last_cluster_time);
            }

            let mut docs = state
                .collections
                .get(source)
                .map(|c| c.docs.clone())
                .unwrap_or_default();
            let changes = writes
                .into_iter()
                .map(|w| apply_write(&mut docs, w))
                .collect::<Result<Vec<_>>>()?;

            state
                .collections
                .entry(source.to_string())
                .or_insert_with(SourceCollection::new)
                .docs = docs;

            let wall_clock = self.inner.clock.now();
            let cluster_time = state.next_cluster_time(wall_clock);
            let mut seq = state.last_seq;
            for change in changes {
                seq = state.push_oplog(
                    cluster_time,
                    wall_clock,
                    OplogBody::Change {
                        source: source.to_string(),
                        change,
                    },
                );
            }
            (seq, cluster_time)
        };
        self.inner.oplog_tx.send_replace(seq);
        Ok(cluster_time)
    }

    /// Record an idle oplog entry, as a replica set's periodic no-op writer
    /// would.
    pub fn tick(&self) -> ClusterTime {
        let (seq, cluster_time) = {
            let mut state = self.inner.state.write();
            let wall_clock = self.inner.clock.now();
            let cluster_time = state.next_cluster_time(wall_clock);
            (state.push_oplog(cluster_time, wall_clock, OplogBody::Tick), cluster_time)
        };
        self.inner.oplog_tx.send_replace(seq);
        cluster_time
    }

    /// Keep at most `capacity` oplog entries, discarding the oldest first.
    /// Feeds and tokens positioned before the kept range expire.
    pub fn set_oplog_capacity(&self, capacity: usize) {
        let mut state = self.inner.state.write();
        state.oplog_capacity = capacity.max(1);
        state.trim_oplog();
    }

    pub fn oplog_len(&self) -> usize {
        self.inner.state.read().oplog.len()
    }

    /// Discard the whole oplog. Tokens older than the newest position stop
    /// being resumable.
    pub fn truncate_oplog(&self) {
        let mut state = self.inner.state.write();
        state.oplog.clear();
        state.truncated_through = state.last_seq;
        debug!(through = state.last_seq, "Truncated oplog");
    }

    /// Deliver `value` verbatim to feeds on `source`.
    pub fn inject_raw_change(&self, source: &str, value: Value) {
        let seq = {
            let mut state = self.inner.state.write();
            let wall_clock = self.inner.clock.now();
            let cluster_time = state.next_cluster_time(wall_clock);
            state.push_oplog(
                cluster_time,
                wall_clock,
                OplogBody::Raw {
                    source: source.to_string(),
                    value,
                },
            )
        };
        self.inner.oplog_tx.send_replace(seq);
    }

    /// Make the next `n` appends fail with a transient error.
    pub fn fail_next_appends(&self, n: usize) {
        self.inner.state.write().append_failures = n;
    }

    /// Current contents of `source`, ascending by key.
    pub fn documents(&self, source: &str) -> Vec<Document> {
        self.inner
            .state
            .read()
            .collections
            .get(source)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored form of every entry in the log of `source`, ascending.
    pub fn log_documents(&self, source: &str) -> Vec<Document> {
        self.inner
            .state
            .read()
            .log(source)
            .map(|log| log.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn log_len(&self, source: &str) -> usize {
        self.inner.state.read().log(source).map_or(0, |log| log.entries.len())
    }

    /// Store a raw document in the log of `source`, bypassing validation of
    /// everything but its `_id`.
    pub fn insert_log_document(&self, source: &str, doc: Document) -> Result<()> {
        let key: OrderKey = doc
            .get(ID_FIELD)
            .cloned()
            .ok_or_else(|| StoreError::MalformedEntry("log document has no `_id`".into()))
            .and_then(|id| {
                serde_json::from_value(id).map_err(|e| StoreError::MalformedEntry(e.to_string()))
            })?;
        self.inner.state.write().log_mut(source).entries.insert(key, doc);
        Ok(())
    }

    /// The stored metadata record of `source`.
    pub fn metadata_record(&self, source: &str) -> Option<Document> {
        self.inner.state.read().metadata.get(source).cloned()
    }

    /// Names of every collection the store holds, including logs and the
    /// metadata collection once it has a record.
    pub fn collection_names(&self) -> Vec<String> {
        let state = self.inner.state.read();
        let mut names: Vec<String> = state.collections.keys().cloned().collect();
        names.extend(state.logs.keys().cloned());
        if !state.metadata.is_empty() {
            names.push(METADATA_COLLECTION.to_string());
        }
        names.sort();
        names
    }

    fn read_page(&self, source: &str, after: OrderKey, before: OrderKey) -> Result<Vec<PcsEvent>> {
        if after >= before {
            return Ok(Vec::new());
        }
        let state = self.inner.state.read();
        match state.log(source) {
            None => Ok(Vec::new()),
            Some(log) => log
                .entries
                .range((Excluded(after), Excluded(before)))
                .take(SCAN_PAGE)
                .map(|(_, doc)| PcsEvent::from_document(doc))
                .collect(),
        }
    }

    fn read_events_rev<F>(
        &self,
        source: &str,
        upper: std::ops::Bound<OrderKey>,
        mut pick: F,
    ) -> Result<Option<PcsEvent>>
    where
        F: FnMut(&PcsEvent) -> bool,
    {
        let state = self.inner.state.read();
        let Some(log) = state.log(source) else {
            return Ok(None);
        };
        for (_, doc) in log.entries.range((Unbounded, upper)).rev() {
            let event = PcsEvent::from_document(doc)?;
            if pick(&event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

fn apply_write(docs: &mut BTreeMap<DocumentKey, Document>, write: Write) -> Result<DataChange> {
    match write {
        Write::Insert(value) => {
            let (key, after) = into_document(value)?;
            if docs.contains_key(&key) {
                return Err(StoreError::DuplicateKey(key.to_string()));
            }
            docs.insert(key.clone(), after.clone());
            Ok(DataChange {
                operation: OperationType::Insert,
                key,
                before: None,
                after: Some(after),
                description: None,
            })
        }
        Write::Update(key, description) => {
            let before = docs
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::DocumentNotFound(key.to_string()))?;
            let updated = apply_update_description(&Value::Object(before.clone()), &description)?;
            let (new_key, after) = into_document(updated)?;
            if new_key != key {
                return Err(StoreError::MalformedDocument(format!(
                    "update may not change `_id` of {}",
                    key
                )));
            }
            docs.insert(key.clone(), after.clone());
            Ok(DataChange {
                operation: OperationType::Update,
                key,
                before: Some(before),
                after: Some(after),
                description: Some(description),
            })
        }
        Write::Replace(value) => {
            let (key, after) = into_document(value)?;
            let before = docs
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::DocumentNotFound(key.to_string()))?;
            docs.insert(key.clone(), after.clone());
            Ok(DataChange {
                operation: OperationType::Replace,
                key,
                before: Some(before),
                after: Some(after),
                description: None,
            })
        }
        Write::Delete(key) => {
            let before = docs
                .remove(&key)
                .ok_or_else(|| StoreError::DocumentNotFound(key.to_string()))?;
            Ok(DataChange {
                operation: OperationType::Delete,
                key,
                before: Some(before),
                after: None,
                description: None,
            })
        }
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn collection_id(&self, source: &str) -> Result<CollectionId> {
        self.inner
            .state
            .read()
            .collections
            .get(source)
            .map(|c| c.id)
            .ok_or_else(|| StoreError::CollectionNotFound(source.to_string()))
    }

    async fn start_session(&self) -> Result<CausalSession> {
        Ok(CausalSession::new())
    }

    async fn majority_read_time(&self, session: &mut CausalSession) -> Result<ClusterTime> {
        let current = self.inner.state.read().last_cluster_time;
        let observed = session.cluster_time().map_or(current, |ct| ct.max(current));
        session.advance_cluster_time(observed);
        Ok(observed)
    }

    async fn scan_source(
        &self,
        session: &mut CausalSession,
        source: &str,
        rule: &Rule,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<(Vec<Document>, ClusterTime)> {
        let (docs, current) = {
            let state = self.inner.state.read();
            let collection = state
                .collections
                .get(source)
                .ok_or_else(|| StoreError::CollectionNotFound(source.to_string()))?;
            let lower = match after {
                Some(key) => Excluded(key),
                None => Unbounded,
            };
            let mut docs = Vec::new();
            for (_, doc) in collection.docs.range::<DocumentKey, _>((lower, Unbounded)) {
                if docs.len() >= limit {
                    break;
                }
                if rule.matches(doc)? {
                    docs.push(doc.clone());
                }
            }
            (docs, state.last_cluster_time)
        };
        let observed = session.cluster_time().map_or(current, |ct| ct.max(current));
        session.advance_cluster_time(observed);
        Ok((docs, observed))
    }

    async fn watch(&self, source: &str, options: WatchOptions) -> Result<Box<dyn ChangeFeed>> {
        let (position, cluster_time) = {
            let state = self.inner.state.read();
            match &options.resume_after {
                Some(token) => {
                    let seq = parse_token(token)?;
                    state.check_token(seq, token)?;
                    let cluster_time = state
                        .oplog
                        .iter()
                        .find(|e| e.seq == seq)
                        .map_or(state.last_cluster_time, |e| e.cluster_time);
                    (seq, cluster_time)
                }
                None => (state.last_seq, state.last_cluster_time),
            }
        };
        debug!(source, position, "Opened change feed");
        Ok(Box::new(MemoryFeed {
            inner: Arc::clone(&self.inner),
            source: source.to_string(),
            options,
            position,
            position_time: cluster_time,
            rx: self.inner.oplog_tx.subscribe(),
            closed: false,
        }))
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, source: &str, events: &[PcsEvent]) -> Result<()> {
        let docs = events
            .iter()
            .map(|e| Ok((e.key(), e.to_document()?)))
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.inner.state.write();
        if state.append_failures > 0 {
            state.append_failures -= 1;
            return Err(StoreError::Transient("injected append failure".into()));
        }
        if docs.is_empty() {
            return Ok(());
        }
        state.log_mut(source).entries.extend(docs);

        if let Some(current) = state.collections.get(source).map(|c| c.id) {
            let record = state.metadata_mut(source);
            if !record.contains_key(COLLECTION_ID_FIELD) {
                record.insert(COLLECTION_ID_FIELD.to_string(), serde_json::to_value(current)?);
                debug!(source, collection_id = %current, "Bound log to collection");
            }
        }
        Ok(())
    }

    async fn log_collection_id(&self, source: &str) -> Result<Option<CollectionId>> {
        let state = self.inner.state.read();
        match state.metadata.get(source).and_then(|r| r.get(COLLECTION_ID_FIELD)) {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone()).map(Some).map_err(|e| {
                StoreError::MalformedDocument(format!(
                    "metadata record of {} has collectionId {}: {}",
                    source, raw, e
                ))
            }),
        }
    }

    async fn save_resume_token(&self, source: &str, token: &ResumeToken) -> Result<()> {
        let mut state = self.inner.state.write();
        state
            .metadata_mut(source)
            .insert(RESUME_TOKEN_FIELD.to_string(), Value::String(token.as_str().to_string()));
        Ok(())
    }

    async fn load_resume_token(&self, source: &str) -> Result<Option<ResumeToken>> {
        let state = self.inner.state.read();
        match state.metadata.get(source) {
            None => Ok(None),
            Some(record) => match record.get(RESUME_TOKEN_FIELD) {
                Some(Value::String(raw)) => Ok(Some(ResumeToken::new(raw.clone()))),
                None | Some(Value::Null) => Ok(None),
                Some(other) => Err(StoreError::MalformedDocument(format!(
                    "metadata record of {} has resumeToken {}",
                    source, other
                ))),
            },
        }
    }

    async fn last_key(&self, source: &str) -> Result<Option<OrderKey>> {
        Ok(self
            .inner
            .state
            .read()
            .log(source)
            .and_then(|log| log.entries.keys().next_back().copied()))
    }

    async fn key_before(&self, source: &str, key: OrderKey) -> Result<Option<OrderKey>> {
        Ok(self
            .inner
            .state
            .read()
            .log(source)
            .and_then(|log| log.entries.range(..key).next_back().map(|(k, _)| *k)))
    }

    async fn last_key_before_wall_clock(
        &self,
        source: &str,
        until: DateTime<Utc>,
    ) -> Result<Option<OrderKey>> {
        Ok(self
            .read_events_rev(source, Unbounded, |e| e.wall_clock < until)?
            .map(|e| e.key()))
    }

    async fn first_entry_at_or_after_wall_clock(
        &self,
        source: &str,
        point: DateTime<Utc>,
    ) -> Result<Option<OrderKey>> {
        let state = self.inner.state.read();
        let Some(log) = state.log(source) else {
            return Ok(None);
        };
        for doc in log.entries.values() {
            let event = PcsEvent::from_document(doc)?;
            if event.wall_clock >= point {
                return Ok(Some(event.key()));
            }
        }
        Ok(None)
    }

    fn scan_log(&self, source: &str, query: PcsQuery) -> LogStream {
        Box::pin(scan_pages(self.clone(), source.to_string(), query))
    }

    async fn last_noop_between(
        &self,
        source: &str,
        after: OrderKey,
        before: OrderKey,
    ) -> Result<Option<PcsEvent>> {
        if after >= before {
            return Ok(None);
        }
        Ok(self
            .read_events_rev(source, Excluded(before), |e| e.is_noop())?
            .filter(|e| e.key() > after))
    }

    async fn delete_through(
        &self,
        source: &str,
        key: OrderKey,
    ) -> Result<Option<(u64, RetentionBoundary)>> {
        let mut state = self.inner.state.write();
        let log = state.log_mut(source);

        let doomed: Vec<OrderKey> =
            log.entries.range((Unbounded, Included(key))).map(|(k, _)| *k).collect();
        let Some(last) = doomed.last().copied() else {
            return Ok(None);
        };
        let last_entry = log
            .entries
            .get(&last)
            .ok_or_else(|| StoreError::MalformedEntry(format!("entry {} vanished", last)))
            .and_then(PcsEvent::from_document)?;

        for k in &doomed {
            log.entries.remove(k);
        }
        let boundary = RetentionBoundary {
            key: last,
            wall_clock: last_entry.wall_clock,
        };
        log.boundary = Some(boundary);
        Ok(Some((doomed.len() as u64, boundary)))
    }

    async fn retention_boundary(&self, source: &str) -> Result<Option<RetentionBoundary>> {
        Ok(self.inner.state.read().log(source).and_then(|log| log.boundary))
    }
}

/// Page through a log, taking the lock once per page.
fn scan_pages(
    store: MemoryStore,
    source: String,
    query: PcsQuery,
) -> impl Stream<Item = Result<PcsEvent>> {
    try_stream! {
        let mut after = query.after;
        loop {
            let page = store.read_page(&source, after, query.before)?;
            let exhausted = page.len() < SCAN_PAGE;
            for event in page {
                after = event.key();
                if query.admits(&event)? {
                    yield event;
                }
            }
            if exhausted {
                break;
            }
        }
    }
}

/// Change feed over a [`MemoryStore`] oplog.
struct MemoryFeed {
    inner: Arc<Inner>,
    source: String,
    options: WatchOptions,
    /// Sequence number of the last oplog entry consumed.
    position: u64,
    position_time: ClusterTime,
    rx: watch::Receiver<u64>,
    closed: bool,
}

impl MemoryFeed {
    /// Consume oplog entries up to the next one this feed delivers.
    fn poll_oplog(&mut self) -> Result<Option<ChangeEvent>> {
        let inner = Arc::clone(&self.inner);
        let state = inner.state.read();
        state.check_token(self.position, &token_for(self.position))?;

        let start = self.position;
        for entry in state.oplog.iter().skip_while(|e| e.seq <= start) {
            self.position = entry.seq;
            self.position_time = entry.cluster_time;
            match &entry.body {
                OplogBody::Tick => {}
                OplogBody::Change { source, change } if *source == self.source => {
                    if self.options.operation_types.contains(&change.operation) {
                        return self.render(entry, change).map(Some);
                    }
                }
                OplogBody::Drop { source } if *source == self.source => {
                    let raw = RawChange {
                        token: token_for(entry.seq),
                        operation_type: OperationType::Drop,
                        cluster_time: entry.cluster_time,
                        wall_time: Some(entry.wall_clock.timestamp_millis()),
                        document_key: None,
                        full_document: None,
                        full_document_before_change: None,
                        update_description: None,
                    };
                    return ChangeEvent::from_raw(serde_json::to_value(raw)?).map(Some);
                }
                OplogBody::Raw { source, value } if *source == self.source => {
                    return ChangeEvent::from_raw(value.clone()).map(Some);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    fn render(&self, entry: &OplogEntry, change: &DataChange) -> Result<ChangeEvent> {
        let mut document_key = Document::new();
        document_key.insert(ID_FIELD.to_string(), change.key.to_value());
        let raw = RawChange {
            token: token_for(entry.seq),
            operation_type: change.operation,
            cluster_time: entry.cluster_time,
            wall_time: Some(entry.wall_clock.timestamp_millis()),
            document_key: Some(document_key),
            full_document: change.after.clone(),
            full_document_before_change: if self.options.before_images {
                change.before.clone()
            } else {
                None
            },
            update_description: change.description.clone(),
        };
        ChangeEvent::from_raw(serde_json::to_value(raw)?)
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next_within(&mut self, wait: Duration) -> Result<Option<ChangeEvent>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.closed {
                return Err(StoreError::CursorKilled);
            }
            self.rx.borrow_and_update();
            if let Some(event) = self.poll_oplog()? {
                return Ok(Some(event));
            }
            match tokio::time::timeout_at(deadline, self.rx.changed()).await {
                Err(_) => return Ok(None),
                Ok(Err(_)) => return Err(StoreError::CursorKilled),
                Ok(Ok(())) => {}
            }
        }
    }

    fn position(&self) -> Option<FeedPosition> {
        Some(FeedPosition {
            token: token_for(self.position),
            cluster_time: self.position_time,
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use drip_core::{EntryId, ManualClock};
    use futures::TryStreamExt;
    use serde_json::json;

    fn store_at(millis: i64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::from_millis(millis));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_cluster_time_follows_wall_clock() {
        let (store, clock) = store_at(3_000);
        assert_eq!(store.insert("c", json!({"_id": 1})).unwrap(), ClusterTime::new(3, 1));
        assert_eq!(store.insert("c", json!({"_id": 2})).unwrap(), ClusterTime::new(3, 2));
        clock.set_millis(5_500);
        assert_eq!(store.tick(), ClusterTime::new(5, 1));
        // A clock moving backwards never moves cluster time backwards.
        clock.set_millis(1_000);
        assert_eq!(store.tick(), ClusterTime::new(5, 2));
    }

    #[test]
    fn test_transaction_is_all_or_nothing() {
        let (store, _) = store_at(1_000);
        store.insert("c", json!({"_id": 1})).unwrap();
        let err = store
            .transaction(
                "c",
                vec![Write::Insert(json!({"_id": 2})), Write::Insert(json!({"_id": 1}))],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert_eq!(store.documents("c").len(), 1);
    }

    #[test]
    fn test_drop_and_recreate_changes_identity() {
        let (store, _) = store_at(1_000);
        let first = store.create_collection("c");
        store.drop_collection("c").unwrap();
        let second = store.create_collection("c");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_feed_delivers_after_resume_token() {
        let (store, _) = store_at(1_000);
        store.insert("c", json!({"_id": 1})).unwrap();

        let mut feed = store.watch("c", WatchOptions::default()).await.unwrap();
        store.insert("other", json!({"_id": 9})).unwrap();
        store.update("c", 1i64, UpdateDescription::new().set("a", json!(1))).unwrap();

        let event = feed.next_within(Duration::from_millis(50)).await.unwrap().unwrap();
        match &event.kind {
            ChangeKind::Update { before, after, .. } => {
                assert_eq!(Value::Object(before.clone()), json!({"_id": 1}));
                assert_eq!(Value::Object(after.clone()), json!({"_id": 1, "a": 1}));
            }
            other => panic!("unexpected {:?}", other),
        }

        store.delete("c", 1i64).unwrap();
        let mut resumed = store
            .watch(
                "c",
                WatchOptions {
                    resume_after: Some(event.token.clone()),
                    ..WatchOptions::default()
                },
            )
            .await
            .unwrap();
        let next = resumed.next_within(Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(matches!(next.kind, ChangeKind::Delete { .. }));
    }

    #[tokio::test]
    async fn test_idle_tick_moves_position_without_data() {
        let (store, _) = store_at(1_000);
        let mut feed = store.watch("c", WatchOptions::default()).await.unwrap();
        let before = feed.position().unwrap();
        store.tick();
        assert!(feed.next_within(Duration::from_millis(20)).await.unwrap().is_none());
        let after = feed.position().unwrap();
        assert_ne!(before.token, after.token);
        assert!(after.cluster_time > before.cluster_time);
    }

    #[tokio::test]
    async fn test_truncated_oplog_expires_token() {
        let (store, _) = store_at(1_000);
        store.insert("c", json!({"_id": 1})).unwrap();
        let mut feed = store.watch("c", WatchOptions::default()).await.unwrap();
        let old = feed.position().unwrap().token;
        store.insert("c", json!({"_id": 2})).unwrap();
        assert!(feed.next_within(Duration::from_millis(20)).await.unwrap().is_some());
        store.insert("c", json!({"_id": 3})).unwrap();
        store.truncate_oplog();

        let err = store
            .watch(
                "c",
                WatchOptions {
                    resume_after: Some(old),
                    ..WatchOptions::default()
                },
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::InvalidResumeToken(_)));
    }

    #[tokio::test]
    async fn test_capped_oplog_expires_lagging_feed() {
        let (store, _) = store_at(1_000);
        store.set_oplog_capacity(3);
        let mut lagging = store.watch("c", WatchOptions::default()).await.unwrap();
        let mut current = store.watch("c", WatchOptions::default()).await.unwrap();

        for id in 0..5i64 {
            store.insert("c", json!({"_id": id})).unwrap();
            assert!(current.next_within(Duration::from_millis(20)).await.unwrap().is_some());
        }
        assert_eq!(store.oplog_len(), 3);

        let err = lagging.next_within(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidResumeToken(_)));
    }

    #[tokio::test]
    async fn test_closed_feed_is_killed() {
        let store = MemoryStore::new();
        let mut feed = store.watch("c", WatchOptions::default()).await.unwrap();
        feed.close();
        assert_eq!(
            feed.next_within(Duration::from_millis(5)).await.unwrap_err(),
            StoreError::CursorKilled
        );
    }

    fn noop(t: u32, raw_id: u128, millis: i64) -> PcsEvent {
        PcsEvent::noop(
            EntryId::from_ulid(ulid::Ulid(raw_id)),
            ClusterTime::new(t, 0),
            drip_core::millis_to_datetime(millis),
        )
    }

    #[tokio::test]
    async fn test_log_queries() {
        let store = MemoryStore::new();
        let events: Vec<PcsEvent> = (1..=5).map(|t| noop(t, t as u128, t as i64 * 1_000)).collect();
        store.append("c", &events).await.unwrap();

        assert_eq!(store.last_key("c").await.unwrap(), Some(events[4].key()));
        assert_eq!(store.key_before("c", events[4].key()).await.unwrap(), Some(events[3].key()));
        assert_eq!(
            store
                .last_key_before_wall_clock("c", drip_core::millis_to_datetime(3_000))
                .await
                .unwrap(),
            Some(events[1].key())
        );
        assert_eq!(
            store
                .first_entry_at_or_after_wall_clock("c", drip_core::millis_to_datetime(3_000))
                .await
                .unwrap(),
            Some(events[2].key())
        );
        assert_eq!(
            store
                .last_noop_between("c", events[0].key(), events[3].key())
                .await
                .unwrap()
                .map(|e| e.key()),
            Some(events[2].key())
        );

        let scanned: Vec<PcsEvent> = store
            .scan_log("c", PcsQuery::between(events[0].key(), events[4].key()))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(scanned, events[1..4].to_vec());
    }

    #[tokio::test]
    async fn test_scan_spans_pages() {
        let store = MemoryStore::new();
        let events: Vec<PcsEvent> = (1..=150u32).map(|t| noop(t, 1, 0)).collect();
        store.append("c", &events).await.unwrap();
        let everything =
            PcsQuery::between(OrderKey::MIN, OrderKey::lower_bound(ClusterTime::new(1_000, 0)));
        let scanned: Vec<PcsEvent> = store
            .scan_log("c", everything)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(scanned.len(), 150);
    }

    #[tokio::test]
    async fn test_delete_through_records_boundary() {
        let store = MemoryStore::new();
        let events: Vec<PcsEvent> = (1..=4).map(|t| noop(t, 1, t as i64)).collect();
        store.append("c", &events).await.unwrap();

        let (deleted, boundary) =
            store.delete_through("c", events[1].key()).await.unwrap().unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(boundary.key, events[1].key());
        assert_eq!(boundary.wall_clock.timestamp_millis(), 2);
        assert_eq!(store.log_len("c"), 2);
        assert_eq!(store.retention_boundary("c").await.unwrap(), Some(boundary));
        assert!(store.delete_through("c", events[1].key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_log_entry_fails_reads() {
        let store = MemoryStore::new();
        let good = noop(1, 1, 0);
        let mut bad = noop(2, 1, 0).to_document().unwrap();
        bad.insert("o".into(), json!("?"));
        store.append("c", &[good]).await.unwrap();
        store.insert_log_document("c", bad).unwrap();

        let everything =
            PcsQuery::between(OrderKey::MIN, OrderKey::lower_bound(ClusterTime::new(9, 0)));
        let result: Result<Vec<PcsEvent>> = store.scan_log("c", everything).try_collect().await;
        assert!(matches!(result, Err(StoreError::MalformedEntry(_))));
    }

    #[tokio::test]
    async fn test_injected_append_failure_is_transient() {
        let store = MemoryStore::new();
        store.fail_next_appends(1);
        let err = store.append("c", &[noop(1, 1, 0)]).await.unwrap_err();
        assert!(err.class().is_retryable());
        store.append("c", &[noop(1, 1, 0)]).await.unwrap();
        assert_eq!(store.log_len("c"), 1);
    }

    #[tokio::test]
    async fn test_resume_token_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_resume_token("c").await.unwrap(), None);
        store.save_resume_token("c", &ResumeToken::new("00000000000000aa")).await.unwrap();
        assert_eq!(
            store.load_resume_token("c").await.unwrap(),
            Some(ResumeToken::new("00000000000000aa"))
        );
        assert!(store.collection_names().contains(&METADATA_COLLECTION.to_string()));
    }

    #[tokio::test]
    async fn test_first_append_binds_log_generation() {
        let store = MemoryStore::new();
        store.append("c", &[noop(1, 1, 1_000)]).await.unwrap();
        assert_eq!(store.log_collection_id("c").await.unwrap(), None);

        let first = store.create_collection("d");
        store.append("d", &[noop(1, 1, 1_000)]).await.unwrap();
        store.save_resume_token("d", &ResumeToken::new("0000000000000001")).await.unwrap();
        assert_eq!(store.log_collection_id("d").await.unwrap(), Some(first));

        store.drop_collection("d").unwrap();
        let second = store.create_collection("d");
        store.append("d", &[noop(2, 2, 2_000)]).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.log_collection_id("d").await.unwrap(), Some(first));
        assert_eq!(
            store.load_resume_token("d").await.unwrap(),
            Some(ResumeToken::new("0000000000000001"))
        );
    }
}
