//! Replica progress persistence on the primary.
//!
//! Each database directory carries a `replica-progress.json` recording the
//! last TXID every replica acknowledged. Retention uses the minimum so a
//! known replica is not forced into a snapshot by compaction.

use crate::error::{KiteError, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::db::write_json_atomic;

const REPLICA_PROGRESS_FILE_NAME: &str = "replica-progress.json";
const REPLICA_PROGRESS_LOCK_FILE_NAME: &str = "replica-progress.lock";
const REPLICA_PROGRESS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaProgress {
  pub applied_txid: u64,
  pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplicaProgressEnvelope {
  version: u32,
  #[serde(default)]
  replicas: HashMap<String, ReplicaProgress>,
}

pub fn load_replica_progress(db_dir: &Path) -> Result<HashMap<String, ReplicaProgress>> {
  fs::create_dir_all(db_dir)?;
  with_progress_lock(db_dir, || read_progress_file(&progress_file_path(db_dir)))
}

pub fn upsert_replica_progress(
  db_dir: &Path,
  replica_id: &str,
  applied_txid: u64,
  updated_at_ms: u64,
) -> Result<()> {
  fs::create_dir_all(db_dir)?;
  with_progress_lock(db_dir, || {
    let file_path = progress_file_path(db_dir);
    let mut progress = read_progress_file(&file_path)?;
    progress.insert(
      replica_id.to_string(),
      ReplicaProgress {
        applied_txid,
        updated_at_ms,
      },
    );
    write_progress_file(&file_path, &progress)
  })
}

/// Forget replicas whose last acknowledgement is older than `cutoff_ms`.
pub fn prune_replica_progress(db_dir: &Path, cutoff_ms: u64) -> Result<usize> {
  fs::create_dir_all(db_dir)?;
  with_progress_lock(db_dir, || {
    let file_path = progress_file_path(db_dir);
    let mut progress = read_progress_file(&file_path)?;
    let before = progress.len();
    progress.retain(|_, entry| entry.updated_at_ms >= cutoff_ms);
    let removed = before - progress.len();
    if removed > 0 {
      write_progress_file(&file_path, &progress)?;
    }
    Ok(removed)
  })
}

/// Lowest acknowledged TXID across all known replicas.
pub fn min_applied_txid(progress: &HashMap<String, ReplicaProgress>) -> Option<u64> {
  progress.values().map(|entry| entry.applied_txid).min()
}

fn progress_file_path(db_dir: &Path) -> PathBuf {
  db_dir.join(REPLICA_PROGRESS_FILE_NAME)
}

fn lock_file_path(db_dir: &Path) -> PathBuf {
  db_dir.join(REPLICA_PROGRESS_LOCK_FILE_NAME)
}

fn read_progress_file(path: &Path) -> Result<HashMap<String, ReplicaProgress>> {
  if !path.exists() {
    return Ok(HashMap::new());
  }

  let bytes = fs::read(path)?;
  let envelope: ReplicaProgressEnvelope = serde_json::from_slice(&bytes).map_err(|error| {
    KiteError::Serialization(format!("decode replica progress envelope: {error}"))
  })?;

  if envelope.version != REPLICA_PROGRESS_VERSION {
    return Err(KiteError::VersionMismatch {
      required: envelope.version,
      current: REPLICA_PROGRESS_VERSION,
    });
  }

  Ok(envelope.replicas)
}

fn write_progress_file(path: &Path, progress: &HashMap<String, ReplicaProgress>) -> Result<()> {
  let envelope = ReplicaProgressEnvelope {
    version: REPLICA_PROGRESS_VERSION,
    replicas: progress.clone(),
  };
  write_json_atomic(path, &envelope)
}

fn with_progress_lock<T>(db_dir: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
  let lock_file = OpenOptions::new()
    .create(true)
    .truncate(false)
    .read(true)
    .write(true)
    .open(lock_file_path(db_dir))?;
  lock_file.lock_exclusive()?;

  let result = f();
  let unlock_result = FileExt::unlock(&lock_file);
  match (result, unlock_result) {
    (Ok(value), Ok(())) => Ok(value),
    (Ok(_), Err(error)) => Err(error.into()),
    (Err(error), _) => Err(error),
  }
}
