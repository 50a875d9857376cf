// crates/core/src/persistence.rs
//! Checkpoint and current-job persistence.
//!
//! Keys follow the layout the rest of the tooling already reads:
//! - `checkpoint_{jobId}`: serialized result rows for one job
//! - `current{Kind}JobId`: the job a kind's controls act on

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::types::{JobKind, Row};

/// String key-value storage. Implementations must be safe to share between
/// the watcher task and the CLI.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store, used by tests and by `--ephemeral` watches.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // No operation leaves the map half-written, so a poisoned lock is safe
    // to keep using.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.entries.read().unwrap_or_else(|e| {
            warn!("memory store lock poisoned, recovering");
            PoisonError::into_inner(e)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.entries.write().unwrap_or_else(|e| {
            warn!("memory store lock poisoned, recovering");
            PoisonError::into_inner(e)
        })
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.write().remove(key);
        Ok(())
    }
}

/// One JSON file per key under a state directory. Writes go through a
/// temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.contains("..");
        if !valid {
            return Err(StoreError::InvalidKey { key: key.to_string() });
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        tmp.write_all(value.as_bytes())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

/// A persisted snapshot of a job's result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: String,
    pub rows: Vec<Row>,
    pub saved_at: DateTime<Utc>,
}

/// Older clients stored the bare row array.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredCheckpoint {
    Full(Checkpoint),
    Rows(Vec<Row>),
}

pub fn checkpoint_key(job_id: &str) -> String {
    format!("checkpoint_{job_id}")
}

pub fn current_job_key(kind: JobKind) -> String {
    format!("current{}JobId", kind.key_name())
}

/// Checkpoint and current-job access for one job kind.
#[derive(Clone)]
pub struct PersistenceAdapter {
    kind: JobKind,
    store: Arc<dyn KeyValueStore>,
}

impl PersistenceAdapter {
    pub fn new(kind: JobKind, store: Arc<dyn KeyValueStore>) -> Self {
        Self { kind, store }
    }

    /// Persist `rows` for `job_id`. Returns false without writing when there
    /// is no job id or nothing to save.
    pub fn save_checkpoint(&self, job_id: &str, rows: &[Row]) -> bool {
        if job_id.is_empty() {
            warn!(kind = %self.kind, "no job id, checkpoint not saved");
            return false;
        }
        if rows.is_empty() {
            warn!(kind = %self.kind, job_id, "no results to checkpoint");
            return false;
        }

        let checkpoint = Checkpoint {
            job_id: job_id.to_string(),
            rows: rows.to_vec(),
            saved_at: Utc::now(),
        };
        let json = match serde_json::to_string(&checkpoint) {
            Ok(json) => json,
            Err(e) => {
                error!(kind = %self.kind, job_id, "failed to serialize checkpoint: {e}");
                return false;
            }
        };
        match self.store.set(&checkpoint_key(job_id), &json) {
            Ok(()) => {
                info!(kind = %self.kind, job_id, rows = rows.len(), "checkpoint saved");
                true
            }
            Err(e) => {
                error!(kind = %self.kind, job_id, "failed to save checkpoint: {e}");
                false
            }
        }
    }

    /// Full stored checkpoint, if any. Unreadable or unparseable entries
    /// are errors; `StoreError::Corrupt` names the key.
    pub fn read_checkpoint(&self, job_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        if job_id.is_empty() {
            return Ok(None);
        }
        let key = checkpoint_key(job_id);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        match serde_json::from_str::<StoredCheckpoint>(&raw) {
            Ok(StoredCheckpoint::Full(checkpoint)) => Ok(Some(checkpoint)),
            Ok(StoredCheckpoint::Rows(rows)) => Ok(Some(Checkpoint {
                job_id: job_id.to_string(),
                rows,
                saved_at: DateTime::<Utc>::default(),
            })),
            Err(e) => Err(StoreError::Corrupt {
                key,
                message: e.to_string(),
            }),
        }
    }

    /// Like [`read_checkpoint`](Self::read_checkpoint), with failures logged
    /// and treated as absent.
    pub fn load_checkpoint_entry(&self, job_id: &str) -> Option<Checkpoint> {
        match self.read_checkpoint(job_id) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(kind = %self.kind, job_id, "failed to load checkpoint: {e}");
                None
            }
        }
    }

    /// Stored rows for `job_id`; an empty snapshot counts as absent.
    pub fn load_checkpoint(&self, job_id: &str) -> Option<Vec<Row>> {
        self.load_checkpoint_entry(job_id)
            .map(|c| c.rows)
            .filter(|rows| !rows.is_empty())
    }

    pub fn clear_checkpoint(&self, job_id: &str) {
        if job_id.is_empty() {
            return;
        }
        match self.store.remove(&checkpoint_key(job_id)) {
            Ok(()) => debug!(kind = %self.kind, job_id, "checkpoint cleared"),
            Err(e) => error!(kind = %self.kind, job_id, "failed to clear checkpoint: {e}"),
        }
    }

    pub fn current_job_id(&self) -> Option<String> {
        match self.store.get(&current_job_key(self.kind)) {
            Ok(value) => value
                .and_then(|raw| serde_json::from_str::<String>(&raw).ok().or(Some(raw)))
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            Err(e) => {
                error!(kind = %self.kind, "failed to read current job id: {e}");
                None
            }
        }
    }

    pub fn set_current_job_id(&self, job_id: &str) {
        let value = serde_json::Value::String(job_id.to_string()).to_string();
        if let Err(e) = self.store.set(&current_job_key(self.kind), &value) {
            error!(kind = %self.kind, job_id, "failed to record current job id: {e}");
        }
    }

    pub fn clear_current_job_id(&self) {
        if let Err(e) = self.store.remove(&current_job_key(self.kind)) {
            error!(kind = %self.kind, "failed to clear current job id: {e}");
        }
    }
}
