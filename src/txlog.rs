//! Durable per-database transaction log.
//!
//! Each entry lives in its own `<txid>.ltx` file inside the log directory.
//! Files are written to a temp path, fsynced, then renamed into place so a
//! crash never leaves a partially written entry under a valid name.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{KiteError, Result};
use crate::ltx::{decode_header, LtxEntry, LtxFlags, LtxHeader, LTX_HEADER_BYTES};

const LTX_EXTENSION: &str = "ltx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntryMeta {
  pub header: LtxHeader,
  pub size_bytes: u64,
}

#[derive(Debug)]
pub struct TransactionLog {
  dir: PathBuf,
  index: BTreeMap<u64, LogEntryMeta>,
}

impl TransactionLog {
  pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    fs::create_dir_all(&dir)?;

    let mut index = BTreeMap::new();
    for item in fs::read_dir(&dir)? {
      let item = item?;
      let path = item.path();
      if path.extension().and_then(|ext| ext.to_str()) != Some(LTX_EXTENSION) {
        continue;
      }
      let Some(txid) = parse_entry_file_name(&path) else {
        continue;
      };

      let size_bytes = item.metadata()?.len();
      let header = read_header(&path)?;
      if header.txid != txid {
        return Err(KiteError::InvalidLtx(format!(
          "{} holds txid {}",
          path.display(),
          header.txid
        )));
      }
      index.insert(txid, LogEntryMeta { header, size_bytes });
    }

    Ok(Self { dir, index })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Highest TXID in the log, or 0 when empty.
  pub fn head(&self) -> u64 {
    self.index.keys().next_back().copied().unwrap_or(0)
  }

  /// Lowest retained TXID, or 0 when empty.
  pub fn floor(&self) -> u64 {
    self.index.keys().next().copied().unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    self.index.len()
  }

  pub fn is_empty(&self) -> bool {
    self.index.is_empty()
  }

  pub fn meta(&self, txid: u64) -> Option<LogEntryMeta> {
    self.index.get(&txid).copied()
  }

  pub fn metas(&self) -> impl Iterator<Item = &LogEntryMeta> {
    self.index.values()
  }

  /// True when every entry in `after+1..=through` is retained and the chain
  /// is incremental, so a reader positioned at `after` can catch up from it.
  pub fn covers(&self, after: u64, through: u64) -> bool {
    if after >= through {
      return true;
    }
    let mut expected = after + 1;
    for (txid, meta) in self.index.range(expected..=through) {
      if *txid != expected || meta.header.flags.contains(LtxFlags::SNAPSHOT) {
        return false;
      }
      expected += 1;
    }
    expected == through + 1
  }

  /// Append the next entry. Entries must arrive in strict TXID order.
  pub fn append(&mut self, entry: &LtxEntry) -> Result<()> {
    let head = self.head();
    if !self.index.is_empty() && entry.txid != head + 1 {
      return Err(KiteError::OrderingViolation {
        expected: head + 1,
        got: entry.txid,
      });
    }
    if entry.is_snapshot() {
      return self.reset_to_snapshot(entry);
    }
    self.write_entry(entry)
  }

  /// Replace the whole log with a single snapshot entry.
  pub fn reset_to_snapshot(&mut self, entry: &LtxEntry) -> Result<()> {
    if !entry.is_snapshot() {
      return Err(KiteError::InvalidLtx(format!(
        "txid {} is not a snapshot",
        entry.txid
      )));
    }
    self.clear()?;
    self.write_entry(entry)
  }

  pub fn read(&self, txid: u64) -> Result<Option<LtxEntry>> {
    if !self.index.contains_key(&txid) {
      return Ok(None);
    }
    let bytes = fs::read(self.entry_path(txid))?;
    LtxEntry::decode(&bytes).map(Some)
  }

  /// Entries in `after+1..=through`, in order.
  pub fn read_range(&self, after: u64, through: u64) -> Result<Vec<LtxEntry>> {
    if after >= through {
      return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for txid in self.index.range(after + 1..=through).map(|(txid, _)| *txid) {
      let bytes = fs::read(self.entry_path(txid))?;
      entries.push(LtxEntry::decode(&bytes)?);
    }
    Ok(entries)
  }

  /// Delete entries with TXID at or below `through`. The head entry is
  /// always kept. Returns the number of removed entries.
  pub fn compact(&mut self, through: u64) -> Result<usize> {
    let through = through.min(self.head().saturating_sub(1));
    let doomed: Vec<u64> = self
      .index
      .range(..=through)
      .map(|(txid, _)| *txid)
      .collect();

    for txid in &doomed {
      match fs::remove_file(self.entry_path(*txid)) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
      }
      self.index.remove(txid);
    }
    if !doomed.is_empty() {
      sync_dir(&self.dir)?;
    }
    Ok(doomed.len())
  }

  pub fn clear(&mut self) -> Result<()> {
    let txids: Vec<u64> = self.index.keys().copied().collect();
    for txid in txids {
      match fs::remove_file(self.entry_path(txid)) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
      }
    }
    self.index.clear();
    sync_dir(&self.dir)
  }

  fn write_entry(&mut self, entry: &LtxEntry) -> Result<()> {
    let bytes = entry.encode()?;
    let path = self.entry_path(entry.txid);
    let temp_path = path.with_extension(format!("{LTX_EXTENSION}.tmp"));

    let written = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&temp_path)
      .and_then(|mut file| {
        file.write_all(&bytes)?;
        file.sync_all()
      });
    if let Err(error) = written {
      let _ = fs::remove_file(&temp_path);
      return Err(error.into());
    }
    fs::rename(&temp_path, &path)?;
    // An entry the index does not list must not survive to the next open.
    if let Err(error) = sync_dir(&self.dir) {
      let _ = fs::remove_file(&path);
      return Err(error);
    }

    self.index.insert(
      entry.txid,
      LogEntryMeta {
        header: entry.header(),
        size_bytes: bytes.len() as u64,
      },
    );
    Ok(())
  }

  fn entry_path(&self, txid: u64) -> PathBuf {
    self.dir.join(entry_file_name(txid))
  }
}

pub fn entry_file_name(txid: u64) -> String {
  format!("{txid:016x}.{LTX_EXTENSION}")
}

fn parse_entry_file_name(path: &Path) -> Option<u64> {
  let stem = path.file_stem()?.to_str()?;
  if stem.len() != 16 {
    return None;
  }
  u64::from_str_radix(stem, 16).ok()
}

fn read_header(path: &Path) -> Result<LtxHeader> {
  let mut file = File::open(path)?;
  let mut bytes = [0u8; LTX_HEADER_BYTES];
  file.read_exact(&mut bytes).map_err(|_| {
    KiteError::InvalidLtx(format!("{} is truncated", path.display()))
  })?;
  decode_header(&bytes)
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
  #[cfg(unix)]
  {
    File::open(dir)?.sync_all()?;
  }

  #[cfg(not(unix))]
  {
    let _ = dir;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::{entry_file_name, TransactionLog};
  use crate::error::KiteError;
  use crate::ltx::{LtxEntry, LtxFlags, PageFrame};

  fn entry(txid: u64) -> LtxEntry {
    LtxEntry {
      flags: LtxFlags::empty(),
      page_size: 8,
      commit: 1,
      txid,
      pre_checksum: txid - 1,
      post_checksum: txid,
      timestamp_ms: 0,
      pages: vec![PageFrame {
        pgno: 1,
        data: vec![txid as u8; 8],
      }],
    }
  }

  #[test]
  fn append_reopen_and_read_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
      let mut log = TransactionLog::open(dir.path()).expect("open");
      for txid in 1..=5 {
        log.append(&entry(txid)).expect("append");
      }
    }

    let log = TransactionLog::open(dir.path()).expect("reopen");
    assert_eq!(log.head(), 5);
    assert_eq!(log.floor(), 1);
    let range = log.read_range(2, 4).expect("range");
    assert_eq!(
      range.iter().map(|e| e.txid).collect::<Vec<_>>(),
      vec![3, 4]
    );
    assert!(log.covers(0, 5));
  }

  #[test]
  fn append_rejects_gap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut log = TransactionLog::open(dir.path()).expect("open");
    log.append(&entry(1)).expect("append");
    let err = log.append(&entry(3)).expect_err("gap");
    assert!(matches!(
      err,
      KiteError::OrderingViolation {
        expected: 2,
        got: 3
      }
    ));
  }

  #[test]
  fn compact_keeps_head_and_breaks_coverage_below_floor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut log = TransactionLog::open(dir.path()).expect("open");
    for txid in 1..=4 {
      log.append(&entry(txid)).expect("append");
    }

    assert_eq!(log.compact(10).expect("compact"), 3);
    assert_eq!(log.floor(), 4);
    assert_eq!(log.head(), 4);
    assert!(!log.covers(1, 4));
    assert!(log.covers(3, 4));
    assert!(!dir.path().join(entry_file_name(1)).exists());
  }

  #[test]
  fn snapshot_rebases_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut log = TransactionLog::open(dir.path()).expect("open");
    log.append(&entry(1)).expect("append");

    let mut snapshot = entry(9);
    snapshot.flags = LtxFlags::SNAPSHOT;
    snapshot.pre_checksum = 0;
    log.reset_to_snapshot(&snapshot).expect("snapshot");

    assert_eq!(log.len(), 1);
    assert_eq!(log.head(), 9);
    assert!(!log.covers(8, 9));
    log.append(&entry(10)).expect("append after snapshot");
  }

  #[test]
  fn stray_temp_file_is_ignored_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut log = TransactionLog::open(dir.path()).expect("open");
    log.append(&entry(1)).expect("append");
    std::fs::write(dir.path().join("0000000000000002.ltx.tmp"), b"KLTX").expect("write temp");

    let log = TransactionLog::open(dir.path()).expect("reopen");
    assert_eq!(log.head(), 1);
  }
}
