//! Error types for kitefs.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KiteError>;

#[derive(Debug, Error)]
pub enum KiteError {
  /// Coordination backend unreachable or no current lease holder.
  #[error("no primary")]
  NoPrimary,

  /// Another node holds a valid lease.
  #[error("primary exists")]
  PrimaryExists,

  /// Lease renewal failed while primary.
  #[error("lease lost: {0}")]
  LeaseLost(String),

  #[error("ordering violation: expected txid {expected}, got {got}")]
  OrderingViolation { expected: u64, got: u64 },

  #[error("checksum mismatch at txid {txid}: expected {expected:016x}, got {got:016x}")]
  ChecksumMismatch { txid: u64, expected: u64, got: u64 },

  #[error("transport failure: {0}")]
  Transport(String),

  /// Write attempted on a node that is not primary.
  #[error("write rejected: node is not primary")]
  WriteRejected,

  #[error("no write transaction in progress")]
  NoTransaction,

  #[error("write transaction already in progress")]
  TransactionInProgress,

  #[error("database not found: {0}")]
  DatabaseNotFound(u32),

  #[error("database already exists: {0}")]
  DatabaseExists(String),

  #[error("invalid page: {0}")]
  InvalidPage(String),

  #[error("invalid ltx: {0}")]
  InvalidLtx(String),

  #[error("crc mismatch: stored {stored:08x}, computed {computed:08x}")]
  CrcMismatch { stored: u32, computed: u32 },

  #[error("version mismatch: file version {required}, supported {current}")]
  VersionMismatch { required: u32, current: u32 },

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("data directory is locked by another process: {}", .0.display())]
  DataDirLocked(PathBuf),

  #[error("store is closed")]
  Closed,

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl KiteError {
  /// Consistency failures a replica recovers from by discarding its state.
  pub fn requires_resync(&self) -> bool {
    matches!(
      self,
      KiteError::OrderingViolation { .. } | KiteError::ChecksumMismatch { .. }
    )
  }

  /// Failures of the backend or the network that are retried with backoff.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      KiteError::NoPrimary | KiteError::Transport(_) | KiteError::Io(_)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::KiteError;

  #[test]
  fn resync_classification() {
    assert!(KiteError::OrderingViolation {
      expected: 3,
      got: 5
    }
    .requires_resync());
    assert!(KiteError::ChecksumMismatch {
      txid: 2,
      expected: 1,
      got: 2
    }
    .requires_resync());
    assert!(!KiteError::Transport("reset".into()).requires_resync());
    assert!(!KiteError::WriteRejected.requires_resync());
  }

  #[test]
  fn retryable_classification() {
    assert!(KiteError::NoPrimary.is_retryable());
    assert!(KiteError::Transport("eof".into()).is_retryable());
    assert!(!KiteError::PrimaryExists.is_retryable());
    assert!(!KiteError::LeaseLost("gone".into()).is_retryable());
  }
}
