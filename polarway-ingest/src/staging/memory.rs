//! In-memory backends

use super::{drop_superseded, unknown_run, GenerationMode, RawRecord, RawRecordStream, RecordSink, RunToken, StagingStore, StateStore};
use crate::error::Result;
use crate::identity::CollectionIdentity;
use crate::state::CollectorState;
use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Partition {
    published: Arc<Vec<RawRecord>>,
    pending: HashMap<Uuid, Vec<RawRecord>>,
}

/// Staging and state store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, Partition>>,
    states: RwLock<HashMap<String, CollectorState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current set for `identity` (empty if nothing was published).
    pub fn published(&self, identity: &CollectionIdentity) -> Arc<Vec<RawRecord>> {
        self.partitions
            .read()
            .get(&identity.key())
            .map(|p| p.published.clone())
            .unwrap_or_default()
    }

    /// Number of generations opened but neither published nor aborted.
    pub fn open_generations(&self, identity: &CollectionIdentity) -> usize {
        self.partitions
            .read()
            .get(&identity.key())
            .map_or(0, |p| p.pending.len())
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn begin_run(&self, identity: Arc<CollectionIdentity>, mode: GenerationMode) -> Result<RunToken> {
        let token = RunToken::new(identity);
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(token.identity.key()).or_default();
        let initial = match mode {
            GenerationMode::Replace => Vec::new(),
            GenerationMode::Append => partition.published.as_ref().clone(),
        };
        partition.pending.insert(token.run_id, initial);
        Ok(token)
    }

    async fn put(
        &self,
        token: &RunToken,
        payload: Bytes,
        source_input: Value,
        key: Option<String>,
    ) -> Result<RawRecord> {
        let mut partitions = self.partitions.write();
        let pending = partitions
            .get_mut(&token.identity.key())
            .and_then(|p| p.pending.get_mut(&token.run_id))
            .ok_or_else(|| unknown_run(token))?;

        let record = RawRecord {
            identity: token.identity.clone(),
            source_input,
            payload,
            sequence: pending.len() as u64 + 1,
            key,
        };
        pending.push(record.clone());
        Ok(record)
    }

    async fn publish(&self, token: &RunToken) -> Result<u64> {
        let mut partitions = self.partitions.write();
        let partition = partitions
            .get_mut(&token.identity.key())
            .ok_or_else(|| unknown_run(token))?;
        let records = partition
            .pending
            .remove(&token.run_id)
            .ok_or_else(|| unknown_run(token))?;

        let records = drop_superseded(records);
        let count = records.len() as u64;
        partition.published = Arc::new(records);
        debug!(identity = %token.identity, records = count, "generation published");
        Ok(count)
    }

    async fn abort(&self, token: &RunToken) -> Result<()> {
        if let Some(partition) = self.partitions.write().get_mut(&token.identity.key()) {
            partition.pending.remove(&token.run_id);
        }
        Ok(())
    }

    fn list_all(&self, identity: &CollectionIdentity) -> RawRecordStream<'_> {
        let snapshot = self.published(identity);
        let s = stream! {
            for record in snapshot.iter() {
                yield Ok(record.clone());
            }
        };
        Box::pin(s)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_state(&self, identity: &CollectionIdentity) -> Result<Option<CollectorState>> {
        Ok(self.states.read().get(&identity.key()).cloned())
    }

    async fn save_state(&self, state: &CollectorState) -> Result<()> {
        self.states
            .write()
            .insert(state.identity_key.clone(), state.clone());
        Ok(())
    }
}

/// Typed-record sink held in process memory.
pub struct MemorySink<T> {
    records: RwLock<HashMap<String, Vec<T>>>,
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &CollectionIdentity) -> Vec<T> {
        self.records
            .read()
            .get(&identity.key())
            .cloned()
            .unwrap_or_default()
    }

    /// Pre-populate output for `identity`.
    pub fn seed(&self, identity: &CollectionIdentity, records: Vec<T>) {
        self.records.write().insert(identity.key(), records);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> RecordSink<T> for MemorySink<T> {
    async fn replace(&self, identity: &CollectionIdentity, records: Vec<T>) -> Result<usize> {
        let count = records.len();
        self.records.write().insert(identity.key(), records);
        Ok(count)
    }
}
