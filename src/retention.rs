//! Transaction log retention policies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::txlog::LogEntryMeta;

/// Inputs a policy sees when deciding how much of a log to drop.
#[derive(Debug, Clone, Copy)]
pub struct RetentionContext<'a> {
  pub head: u64,
  pub now_ms: u64,
  /// Lowest TXID acknowledged by any known replica.
  pub min_replica_txid: Option<u64>,
  pub entries: &'a [LogEntryMeta],
}

/// Decides the highest TXID that may be deleted from a log.
pub trait RetentionPolicy: Send + Sync + fmt::Debug {
  /// Returns the TXID through which entries can be removed, or `None` to
  /// keep everything.
  fn compact_through(&self, ctx: &RetentionContext<'_>) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl RetentionPolicy for KeepAll {
  fn compact_through(&self, _ctx: &RetentionContext<'_>) -> Option<u64> {
    None
  }
}

/// Keeps the newest `min_entries` entries and anything younger than
/// `min_age`.
#[derive(Debug, Clone, Copy)]
pub struct KeepLatest {
  pub min_entries: u64,
  pub min_age: Duration,
}

impl RetentionPolicy for KeepLatest {
  fn compact_through(&self, ctx: &RetentionContext<'_>) -> Option<u64> {
    let by_count = ctx.head.checked_sub(self.min_entries.max(1))?;
    let age_ms = self.min_age.as_millis() as u64;
    let by_age = ctx
      .entries
      .iter()
      .filter(|meta| meta.header.timestamp_ms.saturating_add(age_ms) <= ctx.now_ms)
      .map(|meta| meta.header.txid)
      .max()
      .unwrap_or(0);

    let through = by_count.min(by_age);
    (through > 0).then_some(through)
  }
}

/// `KeepLatest`, additionally never dropping entries a known replica still
/// needs. A replica at TXID `n` resumes by matching its position against
/// entry `n`, so that entry is kept along with everything after it.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaAware {
  pub inner: KeepLatest,
}

impl RetentionPolicy for ReplicaAware {
  fn compact_through(&self, ctx: &RetentionContext<'_>) -> Option<u64> {
    let through = self.inner.compact_through(ctx)?;
    // A replica at 0 is rebuilt from a snapshot whatever is retained.
    let through = match ctx.min_replica_txid {
      Some(min_replica) if min_replica > 0 => through.min(min_replica - 1),
      _ => through,
    };
    (through > 0).then_some(through)
  }
}

/// Serializable selection of a built-in policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RetentionConfig {
  KeepAll,
  KeepLatest { min_entries: u64, min_age_ms: u64 },
  ReplicaAware { min_entries: u64, min_age_ms: u64 },
}

impl Default for RetentionConfig {
  fn default() -> Self {
    RetentionConfig::ReplicaAware {
      min_entries: 1024,
      min_age_ms: 10 * 60 * 1000,
    }
  }
}

impl RetentionConfig {
  pub fn build(&self) -> Box<dyn RetentionPolicy> {
    match *self {
      RetentionConfig::KeepAll => Box::new(KeepAll),
      RetentionConfig::KeepLatest {
        min_entries,
        min_age_ms,
      } => Box::new(KeepLatest {
        min_entries,
        min_age: Duration::from_millis(min_age_ms),
      }),
      RetentionConfig::ReplicaAware {
        min_entries,
        min_age_ms,
      } => Box::new(ReplicaAware {
        inner: KeepLatest {
          min_entries,
          min_age: Duration::from_millis(min_age_ms),
        },
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{KeepAll, KeepLatest, ReplicaAware, RetentionContext, RetentionPolicy};
  use crate::ltx::{LtxFlags, LtxHeader};
  use crate::txlog::LogEntryMeta;
  use std::time::Duration;

  fn metas(count: u64, timestamp_ms: u64) -> Vec<LogEntryMeta> {
    (1..=count)
      .map(|txid| LogEntryMeta {
        header: LtxHeader {
          flags: LtxFlags::empty(),
          page_size: 4096,
          commit: 1,
          txid,
          pre_checksum: 0,
          post_checksum: 0,
          timestamp_ms,
          page_count: 1,
        },
        size_bytes: 4096,
      })
      .collect()
  }

  #[test]
  fn keep_all_never_compacts() {
    let entries = metas(10, 0);
    let ctx = RetentionContext {
      head: 10,
      now_ms: u64::MAX,
      min_replica_txid: None,
      entries: &entries,
    };
    assert_eq!(KeepAll.compact_through(&ctx), None);
  }

  #[test]
  fn keep_latest_respects_count_and_age() {
    let entries = metas(10, 1_000);
    let policy = KeepLatest {
      min_entries: 3,
      min_age: Duration::from_millis(500),
    };

    let old = RetentionContext {
      head: 10,
      now_ms: 2_000,
      min_replica_txid: None,
      entries: &entries,
    };
    assert_eq!(policy.compact_through(&old), Some(7));

    let young = RetentionContext { now_ms: 1_200, ..old };
    assert_eq!(policy.compact_through(&young), None);
  }

  #[test]
  fn replica_aware_holds_back_for_lagging_replica() {
    let entries = metas(10, 0);
    let policy = ReplicaAware {
      inner: KeepLatest {
        min_entries: 1,
        min_age: Duration::ZERO,
      },
    };
    let ctx = RetentionContext {
      head: 10,
      now_ms: 1,
      min_replica_txid: Some(4),
      entries: &entries,
    };
    assert_eq!(policy.compact_through(&ctx), Some(3));

    let anchored_at_first = RetentionContext {
      min_replica_txid: Some(1),
      ..ctx
    };
    assert_eq!(policy.compact_through(&anchored_at_first), None);

    let fresh_replica = RetentionContext {
      min_replica_txid: Some(0),
      ..ctx
    };
    assert_eq!(policy.compact_through(&fresh_replica), Some(9));
  }
}
