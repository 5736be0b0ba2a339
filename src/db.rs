//! The replication unit: one database file, its pages, and its log.
//!
//! A `Database` has a single writer at a time: local commit capture on the
//! primary or entry apply on a replica. Both paths run under the writer
//! lock; page state becomes visible to readers in one step after the entry
//! is durable in the transaction log.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{database_checksum, page_checksum};
use crate::error::{KiteError, Result};
use crate::ltx::{now_ms, LtxEntry, LtxFlags, PageFrame};
use crate::replication::types::Pos;
use crate::retention::{RetentionContext, RetentionPolicy};
use crate::txlog::{sync_dir, LogEntryMeta, TransactionLog};

const META_FILE_NAME: &str = "meta.json";
const POS_FILE_NAME: &str = "pos.json";
const DATABASE_FILE_NAME: &str = "database";
const LOG_DIR_NAME: &str = "ltx";
const META_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMeta {
  pub id: u32,
  pub name: String,
  pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaEnvelope {
  version: u32,
  #[serde(flatten)]
  meta: DatabaseMeta,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedPos {
  txid: u64,
  post_checksum: u64,
  page_count: u32,
}

/// How a reader positioned at some `Pos` gets to the current head.
#[derive(Debug, Clone)]
pub enum CatchUp {
  Current,
  Entries(Vec<LtxEntry>),
  Snapshot(LtxEntry),
  /// The reader holds state but the head is empty.
  Reset,
}

#[derive(Debug, Default)]
struct PageState {
  pages: Vec<Vec<u8>>,
  pos: Pos,
}

#[derive(Debug)]
struct PendingTx {
  dirty: BTreeMap<u32, Vec<u8>>,
  size: u32,
}

#[derive(Debug)]
struct Writer {
  log: TransactionLog,
  file: File,
  pos_path: PathBuf,
  page_size: u32,
  /// The page image or `pos.json` missed a write after the log accepted
  /// an entry. Cleared by the next full image write.
  image_stale: bool,
}

#[derive(Debug)]
pub struct Database {
  meta: DatabaseMeta,
  dir: PathBuf,
  state: RwLock<PageState>,
  pending: Mutex<Option<PendingTx>>,
  writer: Mutex<Writer>,
  needs_resync: AtomicBool,
}

impl Database {
  /// Create a new, empty database under `dir`.
  pub fn create(dir: impl AsRef<Path>, meta: DatabaseMeta) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    if meta.page_size == 0 || !meta.page_size.is_power_of_two() {
      return Err(KiteError::InvalidPage(format!(
        "page size must be a power of two: {}",
        meta.page_size
      )));
    }
    if dir.join(META_FILE_NAME).exists() {
      return Err(KiteError::DatabaseExists(meta.name));
    }

    fs::create_dir_all(&dir)?;
    write_json_atomic(
      &dir.join(META_FILE_NAME),
      &MetaEnvelope {
        version: META_VERSION,
        meta,
      },
    )?;
    Self::open(dir)
  }

  /// Open an existing database, replaying any logged entries that did not
  /// reach the page image before the last shutdown.
  pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    let envelope: MetaEnvelope = read_json(&dir.join(META_FILE_NAME))?;
    if envelope.version != META_VERSION {
      return Err(KiteError::VersionMismatch {
        required: envelope.version,
        current: META_VERSION,
      });
    }
    let meta = envelope.meta;

    let log = TransactionLog::open(dir.join(LOG_DIR_NAME))?;
    let mut file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(dir.join(DATABASE_FILE_NAME))?;

    let pos_path = dir.join(POS_FILE_NAME);
    let persisted: PersistedPos = if pos_path.exists() {
      read_json(&pos_path)?
    } else {
      PersistedPos::default()
    };

    let mut pages = load_pages(&mut file, meta.page_size, persisted.page_count)?;
    let mut writer = Writer {
      log,
      file,
      pos_path,
      page_size: meta.page_size,
      image_stale: false,
    };

    let (pos, needs_resync) = recover(&mut writer, &mut pages, persisted)?;
    if needs_resync {
      warn!(db_id = meta.id, name = %meta.name, "database failed recovery, flagged for resync");
    }

    Ok(Self {
      meta,
      dir,
      state: RwLock::new(PageState { pages, pos }),
      pending: Mutex::new(None),
      writer: Mutex::new(writer),
      needs_resync: AtomicBool::new(needs_resync),
    })
  }

  pub fn id(&self) -> u32 {
    self.meta.id
  }

  pub fn name(&self) -> &str {
    &self.meta.name
  }

  pub fn page_size(&self) -> u32 {
    self.meta.page_size
  }

  pub fn meta(&self) -> &DatabaseMeta {
    &self.meta
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn pos(&self) -> Pos {
    self.state.read().pos
  }

  pub fn txid(&self) -> u64 {
    self.state.read().pos.txid
  }

  pub fn checksum(&self) -> u64 {
    self.state.read().pos.post_checksum
  }

  pub fn page_count(&self) -> u32 {
    self.state.read().pages.len() as u32
  }

  pub fn needs_resync(&self) -> bool {
    self.needs_resync.load(Ordering::SeqCst)
  }

  pub(crate) fn flag_resync(&self) {
    self.needs_resync.store(true, Ordering::SeqCst);
  }

  pub fn read_page(&self, pgno: u32) -> Option<Vec<u8>> {
    if pgno == 0 {
      return None;
    }
    self.state.read().pages.get(pgno as usize - 1).cloned()
  }

  /// Consistent copy of the whole database file.
  pub fn image(&self) -> (Pos, Vec<u8>) {
    let state = self.state.read();
    (state.pos, state.pages.concat())
  }

  /// Retained log range as `(floor, head)`.
  pub fn log_bounds(&self) -> (u64, u64) {
    let writer = self.writer.lock();
    (writer.log.floor(), writer.log.head())
  }

  pub fn begin_write(&self) -> Result<()> {
    let mut pending = self.pending.lock();
    if pending.is_some() {
      return Err(KiteError::TransactionInProgress);
    }
    *pending = Some(PendingTx {
      dirty: BTreeMap::new(),
      size: self.page_count(),
    });
    Ok(())
  }

  pub fn write_page(&self, pgno: u32, data: &[u8]) -> Result<()> {
    if pgno == 0 {
      return Err(KiteError::InvalidPage("page number 0 is reserved".to_string()));
    }
    if data.len() != self.meta.page_size as usize {
      return Err(KiteError::InvalidPage(format!(
        "page {} has {} bytes, page size is {}",
        pgno,
        data.len(),
        self.meta.page_size
      )));
    }

    let mut pending = self.pending.lock();
    let tx = pending.as_mut().ok_or(KiteError::NoTransaction)?;
    tx.dirty.insert(pgno, data.to_vec());
    tx.size = tx.size.max(pgno);
    Ok(())
  }

  /// Shrink or grow the database to `page_count` pages in the pending write.
  pub fn truncate(&self, page_count: u32) -> Result<()> {
    let mut pending = self.pending.lock();
    let tx = pending.as_mut().ok_or(KiteError::NoTransaction)?;
    tx.dirty.retain(|pgno, _| *pgno <= page_count);
    tx.size = page_count;
    Ok(())
  }

  pub fn rollback(&self) {
    self.pending.lock().take();
  }

  pub fn in_write(&self) -> bool {
    self.pending.lock().is_some()
  }

  pub fn commit(&self) -> Result<u64> {
    self.commit_with(|_| {})
  }

  /// Capture the pending write set as the next transaction. `on_commit`
  /// runs after the entry is durable, still inside the writer critical
  /// section, so observers see entries in commit order.
  ///
  /// The log append is the commit point: an error means no entry was
  /// logged and the database is unchanged. A write set that changes
  /// nothing returns the current TXID without producing an entry.
  pub fn commit_with(&self, on_commit: impl FnOnce(Arc<LtxEntry>)) -> Result<u64> {
    let mut writer = self.writer.lock();
    let tx = self.pending.lock().take().ok_or(KiteError::NoTransaction)?;

    let entry = {
      let state = self.state.read();
      if tx.dirty.is_empty() && tx.size as usize == state.pages.len() {
        return Ok(state.pos.txid);
      }

      let mut dirty = tx.dirty;
      let zero = vec![0u8; self.meta.page_size as usize];
      for pgno in state.pages.len() as u32 + 1..=tx.size {
        dirty.entry(pgno).or_insert_with(|| zero.clone());
      }

      let pages: Vec<PageFrame> = dirty
        .into_iter()
        .map(|(pgno, data)| PageFrame { pgno, data })
        .collect();
      let post_checksum = checksum_after(&state, &pages, tx.size, self.meta.page_size);

      LtxEntry {
        flags: LtxFlags::empty(),
        page_size: self.meta.page_size,
        commit: tx.size,
        txid: state.pos.txid + 1,
        pre_checksum: state.pos.post_checksum,
        post_checksum,
        timestamp_ms: now_ms(),
        pages,
      }
    };

    self.persist_entry(&mut writer, &entry)?;
    debug!(db_id = self.meta.id, txid = entry.txid, pages = entry.pages.len(), "committed");

    let txid = entry.txid;
    on_commit(Arc::new(entry));
    Ok(txid)
  }

  /// Apply an entry received from the primary. Rejects anything that does
  /// not extend the current position exactly; the caller resyncs.
  pub fn apply(&self, entry: &LtxEntry) -> Result<()> {
    if entry.page_size != self.meta.page_size {
      return Err(KiteError::InvalidLtx(format!(
        "entry page size {} does not match database page size {}",
        entry.page_size, self.meta.page_size
      )));
    }
    if entry.is_snapshot() {
      return self.apply_snapshot(entry);
    }

    let mut writer = self.writer.lock();
    {
      let state = self.state.read();
      if entry.txid != state.pos.txid + 1 {
        return Err(KiteError::OrderingViolation {
          expected: state.pos.txid + 1,
          got: entry.txid,
        });
      }
      if entry.pre_checksum != state.pos.post_checksum {
        return Err(KiteError::ChecksumMismatch {
          txid: entry.txid,
          expected: state.pos.post_checksum,
          got: entry.pre_checksum,
        });
      }
      let computed = checksum_after(&state, &entry.pages, entry.commit, self.meta.page_size);
      if computed != entry.post_checksum {
        return Err(KiteError::ChecksumMismatch {
          txid: entry.txid,
          expected: entry.post_checksum,
          got: computed,
        });
      }
    }

    self.persist_entry(&mut writer, entry)
  }

  fn apply_snapshot(&self, entry: &LtxEntry) -> Result<()> {
    let computed = database_checksum(entry.pages.iter().map(|page| page.data.as_slice()));
    if computed != entry.post_checksum {
      return Err(KiteError::ChecksumMismatch {
        txid: entry.txid,
        expected: entry.post_checksum,
        got: computed,
      });
    }

    let mut writer = self.writer.lock();
    writer.log.reset_to_snapshot(entry)?;

    let mut state = self.state.write();
    state.pages = entry.pages.iter().map(|page| page.data.clone()).collect();
    state.pos = Pos::new(entry.txid, entry.post_checksum);
    let state = RwLockWriteGuard::downgrade(state);
    self.needs_resync.store(false, Ordering::SeqCst);
    self.sync_image(&mut writer, &state, None);
    debug!(db_id = self.meta.id, txid = entry.txid, "applied snapshot");
    Ok(())
  }

  /// Log the entry, then publish it to readers and the page image. Once the
  /// log holds the entry it counts as committed: image failures leave
  /// `pos.json` behind the log so the next open replays the gap.
  fn persist_entry(&self, writer: &mut Writer, entry: &LtxEntry) -> Result<()> {
    writer.log.append(entry)?;

    let mut state = self.state.write();
    apply_pages(&mut state.pages, entry);
    state.pos = Pos::new(entry.txid, entry.post_checksum);
    let state = RwLockWriteGuard::downgrade(state);
    self.sync_image(writer, &state, Some(entry));
    Ok(())
  }

  /// Bring the database file and `pos.json` up to `state`. Writes only the
  /// pages of `entry` when the image is otherwise current. Returns whether
  /// the image is current afterwards.
  fn sync_image(&self, writer: &mut Writer, state: &PageState, entry: Option<&LtxEntry>) -> bool {
    let written = match entry {
      Some(entry) if !writer.image_stale => writer.write_pages(entry),
      _ => writer.write_image(&state.pages),
    };
    let result = written.and_then(|()| writer.persist_pos(state.pos, state.pages.len() as u32));

    match result {
      Ok(()) => {
        if writer.image_stale {
          debug!(db_id = self.meta.id, txid = state.pos.txid, "page image caught up with log");
        }
        writer.image_stale = false;
        true
      }
      Err(error) => {
        if !writer.image_stale {
          warn!(
            db_id = self.meta.id,
            txid = state.pos.txid,
            %error,
            "page image lags the transaction log"
          );
        }
        writer.image_stale = true;
        false
      }
    }
  }

  /// Make a database that failed recovery trustworthy again without a
  /// primary to copy from. Replays the retained log when it reaches back to
  /// a base; otherwise adopts the local pages as a new snapshot one TXID
  /// past the current position, so every reader rebuilds from it.
  pub fn rebuild(&self) -> Result<()> {
    if !self.needs_resync() {
      return Ok(());
    }
    self.pending.lock().take();
    let mut writer = self.writer.lock();

    if let Some((pos, pages)) = replay_log(&writer.log)? {
      let mut state = self.state.write();
      state.pages = pages;
      state.pos = pos;
      let state = RwLockWriteGuard::downgrade(state);
      writer.image_stale = true;
      self.sync_image(&mut writer, &state, None);
      self.needs_resync.store(false, Ordering::SeqCst);
      info!(db_id = self.meta.id, txid = pos.txid, "rebuilt database from transaction log");
      return Ok(());
    }

    let base = {
      let state = self.state.read();
      let pages = state
        .pages
        .iter()
        .enumerate()
        .map(|(index, data)| PageFrame {
          pgno: index as u32 + 1,
          data: data.clone(),
        })
        .collect();
      LtxEntry {
        flags: LtxFlags::SNAPSHOT,
        page_size: self.meta.page_size,
        commit: state.pages.len() as u32,
        txid: state.pos.txid + 1,
        pre_checksum: 0,
        post_checksum: database_checksum(state.pages.iter().map(|page| page.as_slice())),
        timestamp_ms: now_ms(),
        pages,
      }
    };
    writer.log.reset_to_snapshot(&base)?;

    let mut state = self.state.write();
    state.pos = Pos::new(base.txid, base.post_checksum);
    let state = RwLockWriteGuard::downgrade(state);
    self.sync_image(&mut writer, &state, None);
    self.needs_resync.store(false, Ordering::SeqCst);
    warn!(db_id = self.meta.id, txid = base.txid, "rebased database on its local pages");
    Ok(())
  }

  /// Full snapshot of the current state.
  pub fn snapshot(&self) -> Option<LtxEntry> {
    let _writer = self.writer.lock();
    build_snapshot(&self.state.read(), self.meta.page_size)
  }

  /// Work out how a reader at `from` reaches the head, and run `register`
  /// while the head is pinned so nothing committed afterwards is missed.
  pub fn catch_up<R>(
    &self,
    from: Pos,
    register: impl FnOnce(Pos) -> R,
  ) -> Result<(Pos, CatchUp, R)> {
    let writer = self.writer.lock();
    let state = self.state.read();
    let head = state.pos;
    let registered = register(head);

    let plan = if from == head {
      CatchUp::Current
    } else if head.is_zero() {
      CatchUp::Reset
    } else if from.is_zero() || from.txid > head.txid {
      snapshot_plan(&state, self.meta.page_size)
    } else {
      let anchored = writer
        .log
        .meta(from.txid)
        .is_some_and(|meta| meta.header.post_checksum == from.post_checksum);
      if anchored && writer.log.covers(from.txid, head.txid) {
        CatchUp::Entries(writer.log.read_range(from.txid, head.txid)?)
      } else {
        snapshot_plan(&state, self.meta.page_size)
      }
    };

    Ok((head, plan, registered))
  }

  /// Discard all local state. Used before a full resync from the primary.
  pub fn reset(&self) -> Result<()> {
    self.pending.lock().take();
    let mut writer = self.writer.lock();
    writer.log.clear()?;
    writer.write_image(&[])?;
    {
      let mut state = self.state.write();
      state.pages.clear();
      state.pos = Pos::default();
    }
    writer.persist_pos(Pos::default(), 0)?;
    self.needs_resync.store(false, Ordering::SeqCst);
    warn!(db_id = self.meta.id, "database state discarded for resync");
    Ok(())
  }

  /// Compact the log according to `policy`. Returns removed entry count.
  pub fn run_retention(
    &self,
    policy: &dyn RetentionPolicy,
    min_replica_txid: Option<u64>,
  ) -> Result<usize> {
    let mut writer = self.writer.lock();
    // Recovery replays from `pos.json`, so the log may not be compacted
    // past it while the image is behind.
    if writer.image_stale && !self.sync_image(&mut writer, &self.state.read(), None) {
      return Ok(0);
    }
    let entries: Vec<LogEntryMeta> = writer.log.metas().copied().collect();
    let ctx = RetentionContext {
      head: writer.log.head(),
      now_ms: now_ms(),
      min_replica_txid,
      entries: &entries,
    };
    match policy.compact_through(&ctx) {
      Some(through) => {
        let removed = writer.log.compact(through)?;
        if removed > 0 {
          debug!(db_id = self.meta.id, through, removed, "compacted transaction log");
        }
        Ok(removed)
      }
      None => Ok(0),
    }
  }
}

impl Writer {
  fn write_pages(&mut self, entry: &LtxEntry) -> Result<()> {
    let page_size = u64::from(self.page_size);
    for page in &entry.pages {
      self
        .file
        .seek(SeekFrom::Start(u64::from(page.pgno - 1) * page_size))?;
      self.file.write_all(&page.data)?;
    }
    self.file.set_len(u64::from(entry.commit) * page_size)?;
    self.file.sync_data()?;
    Ok(())
  }

  fn write_image(&mut self, pages: &[Vec<u8>]) -> Result<()> {
    self.file.set_len(0)?;
    self.file.seek(SeekFrom::Start(0))?;
    for page in pages {
      self.file.write_all(page)?;
    }
    self.file.sync_data()?;
    Ok(())
  }

  fn persist_pos(&self, pos: Pos, page_count: u32) -> Result<()> {
    write_json_atomic(
      &self.pos_path,
      &PersistedPos {
        txid: pos.txid,
        post_checksum: pos.post_checksum,
        page_count,
      },
    )
  }
}

/// Checksum the database would have after writing `pages` and resizing to
/// `commit` pages. Pages beyond the current end that `pages` does not cover
/// are zero-filled.
fn checksum_after(state: &PageState, pages: &[PageFrame], commit: u32, page_size: u32) -> u64 {
  let current_len = state.pages.len() as u32;
  let mut checksum = state.pos.post_checksum;

  for pgno in commit + 1..=current_len {
    checksum ^= page_checksum(pgno, &state.pages[pgno as usize - 1]);
  }

  let mut written = BTreeMap::new();
  for page in pages {
    written.insert(page.pgno, page.data.as_slice());
  }

  let zero = vec![0u8; page_size as usize];
  for pgno in 1..=commit {
    let old = (pgno <= current_len).then(|| state.pages[pgno as usize - 1].as_slice());
    let new = match written.get(&pgno) {
      Some(data) => *data,
      None if old.is_none() => zero.as_slice(),
      None => continue,
    };
    if let Some(old) = old {
      checksum ^= page_checksum(pgno, old);
    }
    checksum ^= page_checksum(pgno, new);
  }
  checksum
}

fn apply_pages(pages: &mut Vec<Vec<u8>>, entry: &LtxEntry) {
  pages.resize(entry.commit as usize, vec![0u8; entry.page_size as usize]);
  for page in &entry.pages {
    pages[page.pgno as usize - 1] = page.data.clone();
  }
}

fn build_snapshot(state: &PageState, page_size: u32) -> Option<LtxEntry> {
  if state.pos.txid == 0 {
    return None;
  }
  Some(LtxEntry {
    flags: LtxFlags::SNAPSHOT,
    page_size,
    commit: state.pages.len() as u32,
    txid: state.pos.txid,
    pre_checksum: 0,
    post_checksum: state.pos.post_checksum,
    timestamp_ms: now_ms(),
    pages: state
      .pages
      .iter()
      .enumerate()
      .map(|(index, data)| PageFrame {
        pgno: index as u32 + 1,
        data: data.clone(),
      })
      .collect(),
  })
}

/// Rebuild pages from the log alone. Only possible when the retained log
/// starts at TXID 1 or at a snapshot and is unbroken up to its head.
fn replay_log(log: &TransactionLog) -> Result<Option<(Pos, Vec<Vec<u8>>)>> {
  let Some(base) = log.meta(log.floor()) else {
    return Ok(None);
  };
  let after = base.header.txid - 1;
  let from_start = base.header.txid == 1 || base.header.flags.contains(LtxFlags::SNAPSHOT);
  if !from_start || !log.covers(base.header.txid, log.head()) {
    return Ok(None);
  }

  let mut pages = Vec::new();
  let mut pos = Pos::default();
  for entry in log.read_range(after, log.head())? {
    if entry.is_snapshot() {
      pages.clear();
    }
    apply_pages(&mut pages, &entry);
    pos = Pos::new(entry.txid, entry.post_checksum);
  }

  let computed = database_checksum(pages.iter().map(|page| page.as_slice()));
  Ok((computed == pos.post_checksum).then_some((pos, pages)))
}

fn snapshot_plan(state: &PageState, page_size: u32) -> CatchUp {
  match build_snapshot(state, page_size) {
    Some(snapshot) => CatchUp::Snapshot(snapshot),
    None => CatchUp::Reset,
  }
}

fn load_pages(file: &mut File, page_size: u32, page_count: u32) -> Result<Vec<Vec<u8>>> {
  let mut bytes = Vec::new();
  file.seek(SeekFrom::Start(0))?;
  file.read_to_end(&mut bytes)?;

  let page_size = page_size as usize;
  let mut pages: Vec<Vec<u8>> = bytes
    .chunks_exact(page_size)
    .map(|chunk| chunk.to_vec())
    .collect();
  pages.resize(page_count as usize, vec![0u8; page_size]);
  Ok(pages)
}

/// Bring the page image up to the log head. Returns the recovered position
/// and whether the result is untrustworthy.
fn recover(
  writer: &mut Writer,
  pages: &mut Vec<Vec<u8>>,
  persisted: PersistedPos,
) -> Result<(Pos, bool)> {
  let persisted_pos = Pos::new(persisted.txid, persisted.post_checksum);
  let head = writer.log.head();

  if head <= persisted.txid {
    let computed = database_checksum(pages.iter().map(|page| page.as_slice()));
    return Ok((persisted_pos, computed != persisted.post_checksum));
  }

  let entries = writer.log.read_range(persisted.txid, head)?;
  let replayable = entries
    .first()
    .is_some_and(|first| first.txid == persisted.txid + 1 || first.is_snapshot());
  if !replayable {
    return Ok((persisted_pos, true));
  }

  let mut pos = persisted_pos;
  let mut commit = persisted.page_count;
  for entry in &entries {
    if entry.is_snapshot() {
      pages.clear();
    }
    apply_pages(pages, entry);
    pos = Pos::new(entry.txid, entry.post_checksum);
    commit = entry.commit;
  }

  writer.write_image(pages)?;
  writer.persist_pos(pos, commit)?;

  let computed = database_checksum(pages.iter().map(|page| page.as_slice()));
  debug!(txid = pos.txid, "replayed transaction log on open");
  Ok((pos, computed != pos.post_checksum))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
  let bytes = fs::read(path)?;
  serde_json::from_slice(&bytes)
    .map_err(|error| KiteError::Serialization(format!("decode {}: {error}", path.display())))
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
  let bytes = serde_json::to_vec(value)
    .map_err(|error| KiteError::Serialization(format!("encode {}: {error}", path.display())))?;

  let temp_path = path.with_extension("json.tmp");
  let mut file = OpenOptions::new()
    .create(true)
    .truncate(true)
    .write(true)
    .open(&temp_path)?;
  file.write_all(&bytes)?;
  file.sync_all()?;
  fs::rename(&temp_path, path)?;
  if let Some(parent) = path.parent() {
    sync_dir(parent)?;
  }
  Ok(())
}
