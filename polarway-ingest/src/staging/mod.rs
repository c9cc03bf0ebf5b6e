//! Raw staging, collector state and typed-record persistence
//!
//! The collector writes fetched payloads into a *generation* opened with
//! [`StagingStore::begin_run`]. Nothing written under a generation is visible to
//! readers until [`StagingStore::publish`] swaps it in as the identity's current
//! set; an aborted generation is discarded. Readers only ever see complete
//! generations.
//!
//! Records may carry a unit key. On publish, a keyed record is dropped when a
//! later record of the same generation has the same key, so a unit fetched again
//! by an incremental run replaces its carried-over copy instead of doubling it.

pub mod fs;
pub mod memory;

use crate::error::{IngestError, Result};
use crate::identity::CollectionIdentity;
use crate::state::CollectorState;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

pub use fs::{default_store_dir, FsSink, FsStore};
pub use memory::{MemorySink, MemoryStore};

/// One fetched unit of external data.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub identity: Arc<CollectionIdentity>,
    /// Request parameters that produced this unit
    pub source_input: Value,
    /// Opaque payload, usually a JSON document
    pub payload: Bytes,
    /// 1-based insertion order within its generation; renumbered when
    /// superseded records are dropped on publish
    pub sequence: u64,
    /// Stable identity of the unit at the source, if the fetcher provides one
    pub key: Option<String>,
}

impl RawRecord {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// How a new generation starts out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Start empty; publishing supersedes the current set (full sync)
    Replace,
    /// Start from a copy of the current set; new records are appended and
    /// supersede carried records with the same key (incremental sync)
    Append,
}

/// Handle on an open generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunToken {
    pub run_id: Uuid,
    pub identity: Arc<CollectionIdentity>,
}

impl RunToken {
    pub fn new(identity: Arc<CollectionIdentity>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            identity,
        }
    }
}

pub type RawRecordStream<'a> = Pin<Box<dyn Stream<Item = Result<RawRecord>> + Send + 'a>>;

/// Append/replace-only store of raw payloads, partitioned by identity.
///
/// `put` may be called concurrently for the same token. `publish` and `abort`
/// are called once per token, after every writer has finished.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Open a new generation for `identity`.
    async fn begin_run(&self, identity: Arc<CollectionIdentity>, mode: GenerationMode) -> Result<RunToken>;

    /// Append one payload to the generation.
    async fn put(
        &self,
        token: &RunToken,
        payload: Bytes,
        source_input: Value,
        key: Option<String>,
    ) -> Result<RawRecord>;

    /// Make the generation the identity's current set, returning its size.
    ///
    /// Keyed records superseded by a later record with the same key are dropped.
    async fn publish(&self, token: &RunToken) -> Result<u64>;

    /// Discard the generation. The current set is left as it was.
    async fn abort(&self, token: &RunToken) -> Result<()>;

    /// Stream the current set in insertion order. Every call starts from the top.
    fn list_all(&self, identity: &CollectionIdentity) -> RawRecordStream<'_>;
}

/// Persistence for [`CollectorState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self, identity: &CollectionIdentity) -> Result<Option<CollectorState>>;

    async fn save_state(&self, state: &CollectorState) -> Result<()>;
}

/// Destination for extracted records.
#[async_trait]
pub trait RecordSink<T: Send + 'static>: Send + Sync {
    /// Replace everything stored for `identity` with `records`.
    async fn replace(&self, identity: &CollectionIdentity, records: Vec<T>) -> Result<usize>;
}

/// Keep only the last record per key, in insertion order, and renumber.
pub(crate) fn drop_superseded(records: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut seen = HashSet::new();
    let mut kept: Vec<RawRecord> = records
        .into_iter()
        .rev()
        .filter(|record| match &record.key {
            Some(key) => seen.insert(key.clone()),
            None => true,
        })
        .collect();
    kept.reverse();
    for (idx, record) in kept.iter_mut().enumerate() {
        record.sequence = idx as u64 + 1;
    }
    kept
}

pub(crate) fn unknown_run(token: &RunToken) -> IngestError {
    IngestError::Store(format!(
        "no open generation {} for {}",
        token.run_id, token.identity
    ))
}
