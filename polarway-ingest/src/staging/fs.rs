//! Filesystem backends
//!
//! Layout under the base directory, one folder per identity named after the
//! SHA-256 of its key:
//!
//! ```text
//! <base>/<sha256(identity key)>/
//!     identity.json         identity the folder belongs to
//!     pending-<run>.jsonl   generation being written
//!     current.jsonl         last published generation
//!     state.json            collector state
//!     typed.json            extracted records
//! ```
//!
//! Publishing renames the pending file over `current.jsonl`, rewriting it first when
//! keyed records were superseded; state and typed output are written to a temporary
//! file first and renamed into place.

use super::{unknown_run, GenerationMode, RawRecord, RawRecordStream, RecordSink, RunToken, StagingStore, StateStore};
use crate::error::{IngestError, Result};
use crate::identity::CollectionIdentity;
use crate::state::CollectorState;
use async_stream::stream;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use uuid::Uuid;

const CURRENT_FILE: &str = "current.jsonl";
const STATE_FILE: &str = "state.json";
const TYPED_FILE: &str = "typed.json";

/// One line of a generation file.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    sequence: u64,
    source_input: Value,
    /// base64 of the raw payload
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

struct PendingGeneration {
    writer: BufWriter<std::fs::File>,
    path: PathBuf,
    next_sequence: u64,
    /// Latest sequence staged under each key
    keys: HashMap<String, u64>,
    /// Sequences replaced by a later record with the same key
    superseded: HashSet<u64>,
}

impl PendingGeneration {
    fn track(&mut self, key: Option<&str>, sequence: u64) {
        if let Some(key) = key {
            if let Some(previous) = self.keys.insert(key.to_string(), sequence) {
                self.superseded.insert(previous);
            }
        }
    }
}

/// Default base directory for the filesystem store.
pub fn default_store_dir() -> PathBuf {
    std::env::var("POLARWAY_INGEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("polarway_ingest"))
}

fn identity_dir(base_dir: &Path, identity_key: &str) -> PathBuf {
    let digest = Sha256::digest(identity_key.as_bytes());
    base_dir.join(format!("{:x}", digest))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Write `pending` to `current` without the superseded sequences, renumbering
/// the survivors.
fn compact(pending: &Path, current: &Path, superseded: &HashSet<u64>) -> Result<()> {
    let tmp = current.with_extension("tmp");
    let reader = std::io::BufReader::new(std::fs::File::open(pending)?);
    let mut writer = BufWriter::new(std::fs::File::create(&tmp)?);

    let mut sequence = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut stored: StoredRecord = serde_json::from_str(&line)?;
        if superseded.contains(&stored.sequence) {
            continue;
        }
        sequence += 1;
        stored.sequence = sequence;
        serde_json::to_writer(&mut writer, &stored)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    std::fs::rename(&tmp, current)?;
    Ok(())
}

/// Staging and state store on the local filesystem.
pub struct FsStore {
    base_dir: PathBuf,
    pending: Mutex<HashMap<Uuid, PendingGeneration>>,
}

impl FsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Folder holding everything stored for `identity`.
    pub fn identity_dir(&self, identity: &CollectionIdentity) -> PathBuf {
        identity_dir(&self.base_dir, &identity.key())
    }

    fn ensure_identity_dir(&self, identity: &CollectionIdentity) -> Result<PathBuf> {
        let dir = self.identity_dir(identity);
        std::fs::create_dir_all(&dir)?;
        let marker = dir.join("identity.json");
        if !marker.exists() {
            write_atomic(&marker, &serde_json::to_vec_pretty(identity)?)?;
        }
        Ok(dir)
    }
}

#[async_trait]
impl StagingStore for FsStore {
    async fn begin_run(&self, identity: Arc<CollectionIdentity>, mode: GenerationMode) -> Result<RunToken> {
        let dir = self.ensure_identity_dir(&identity)?;
        let token = RunToken::new(identity);
        let path = dir.join(format!("pending-{}.jsonl", token.run_id));
        let current = dir.join(CURRENT_FILE);

        let file = std::fs::File::create(&path)?;
        let mut generation = PendingGeneration {
            writer: BufWriter::new(file),
            path,
            next_sequence: 1,
            keys: HashMap::new(),
            superseded: HashSet::new(),
        };
        if mode == GenerationMode::Append && current.exists() {
            let reader = std::io::BufReader::new(std::fs::File::open(&current)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let stored: StoredRecord = serde_json::from_str(&line)?;
                generation.track(stored.key.as_deref(), stored.sequence);
                generation.writer.write_all(line.as_bytes())?;
                generation.writer.write_all(b"\n")?;
                generation.next_sequence = stored.sequence + 1;
            }
        }
        debug!(
            identity = %token.identity,
            path = %generation.path.display(),
            carried = generation.next_sequence - 1,
            ?mode,
            "generation opened"
        );

        self.pending.lock().insert(token.run_id, generation);
        Ok(token)
    }

    async fn put(
        &self,
        token: &RunToken,
        payload: Bytes,
        source_input: Value,
        key: Option<String>,
    ) -> Result<RawRecord> {
        let mut pending = self.pending.lock();
        let generation = pending
            .get_mut(&token.run_id)
            .ok_or_else(|| unknown_run(token))?;

        let sequence = generation.next_sequence;
        let line = serde_json::to_vec(&StoredRecord {
            sequence,
            source_input: source_input.clone(),
            payload: BASE64.encode(&payload),
            key: key.clone(),
        })?;
        generation.writer.write_all(&line)?;
        generation.writer.write_all(b"\n")?;
        generation.next_sequence += 1;
        generation.track(key.as_deref(), sequence);

        Ok(RawRecord {
            identity: token.identity.clone(),
            source_input,
            payload,
            sequence,
            key,
        })
    }

    async fn publish(&self, token: &RunToken) -> Result<u64> {
        let generation = self
            .pending
            .lock()
            .remove(&token.run_id)
            .ok_or_else(|| unknown_run(token))?;

        let PendingGeneration {
            mut writer,
            path,
            next_sequence,
            superseded,
            ..
        } = generation;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        let current = self.identity_dir(&token.identity).join(CURRENT_FILE);
        if superseded.is_empty() {
            std::fs::rename(&path, &current)?;
        } else {
            compact(&path, &current, &superseded)?;
            std::fs::remove_file(&path)?;
        }

        let count = next_sequence - 1 - superseded.len() as u64;
        debug!(identity = %token.identity, records = count, "generation published");
        Ok(count)
    }

    async fn abort(&self, token: &RunToken) -> Result<()> {
        let generation = self.pending.lock().remove(&token.run_id);
        if let Some(generation) = generation {
            let path = generation.path.clone();
            drop(generation);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn list_all(&self, identity: &CollectionIdentity) -> RawRecordStream<'_> {
        let path = self.identity_dir(identity).join(CURRENT_FILE);
        let identity = Arc::new(identity.clone());

        let s = stream! {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    yield Err(IngestError::from(e));
                    return;
                }
            };

            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let decoded = serde_json::from_str::<StoredRecord>(&line)
                            .map_err(IngestError::from)
                            .and_then(|stored| {
                                let payload = BASE64.decode(stored.payload.as_bytes()).map_err(|e| {
                                    IngestError::Store(format!(
                                        "corrupt payload at record #{}: {}",
                                        stored.sequence, e
                                    ))
                                })?;
                                Ok(RawRecord {
                                    identity: identity.clone(),
                                    source_input: stored.source_input,
                                    payload: Bytes::from(payload),
                                    sequence: stored.sequence,
                                    key: stored.key,
                                })
                            });
                        let failed = decoded.is_err();
                        yield decoded;
                        if failed {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(IngestError::from(e));
                        break;
                    }
                }
            }
        };
        Box::pin(s)
    }
}

#[async_trait]
impl StateStore for FsStore {
    async fn load_state(&self, identity: &CollectionIdentity) -> Result<Option<CollectorState>> {
        let path = self.identity_dir(identity).join(STATE_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_state(&self, state: &CollectorState) -> Result<()> {
        let dir = identity_dir(&self.base_dir, &state.identity_key);
        std::fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(STATE_FILE), &serde_json::to_vec_pretty(state)?)
    }
}

/// Typed-record sink writing one JSON array per identity.
pub struct FsSink<T> {
    base_dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> FsSink<T> {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            _marker: PhantomData,
        })
    }

    /// Records currently stored for `identity`.
    pub fn load(&self, identity: &CollectionIdentity) -> Result<Vec<T>> {
        let path = identity_dir(&self.base_dir, &identity.key()).join(TYPED_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<T> RecordSink<T> for FsSink<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn replace(&self, identity: &CollectionIdentity, records: Vec<T>) -> Result<usize> {
        let dir = identity_dir(&self.base_dir, &identity.key());
        std::fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(TYPED_FILE), &serde_json::to_vec(&records)?)?;
        Ok(records.len())
    }
}
