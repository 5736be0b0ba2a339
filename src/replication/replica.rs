//! Replica-side replication: follow the primary for every database.
//!
//! A supervisor thread lists the primary's databases, creates any that are
//! missing locally and keeps one session thread per database. Sessions
//! apply entries strictly in order, acknowledge each one, and fall back to a
//! full resync when apply detects a gap or checksum mismatch.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::transport::{connect, list_databases, unexpected, write_message, FrameReader, Message};
use crate::db::Database;
use crate::error::{KiteError, Result};
use crate::store::StoreInner;

const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_BACKOFF_SHIFT: u32 = 5;

/// What a replica knows about one database's session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSessionStatus {
  pub connected: bool,
  pub primary_txid: Option<u64>,
  pub last_error: Option<String>,
  pub needs_resync: bool,
  pub resyncs: u64,
}

/// Session status by database id, shared with `Store::status`.
#[derive(Debug, Default)]
pub struct ReplicaBoard {
  sessions: Mutex<HashMap<u32, ReplicaSessionStatus>>,
}

impl ReplicaBoard {
  pub fn get(&self, db_id: u32) -> Option<ReplicaSessionStatus> {
    self.sessions.lock().get(&db_id).cloned()
  }

  pub fn clear(&self) {
    self.sessions.lock().clear();
  }

  fn update(&self, db_id: u32, f: impl FnOnce(&mut ReplicaSessionStatus)) {
    f(self.sessions.lock().entry(db_id).or_default());
  }

  fn connected(&self, db_id: u32) {
    self.update(db_id, |status| {
      status.connected = true;
      status.last_error = None;
    });
  }

  fn primary_head(&self, db_id: u32, txid: u64) {
    self.update(db_id, |status| {
      status.primary_txid = Some(status.primary_txid.map_or(txid, |seen| seen.max(txid)));
    });
  }

  fn applied(&self, db_id: u32, txid: u64) {
    self.update(db_id, |status| {
      status.needs_resync = false;
      status.primary_txid = Some(status.primary_txid.map_or(txid, |seen| seen.max(txid)));
    });
  }

  fn failed(&self, db_id: u32, error: &KiteError) {
    self.update(db_id, |status| {
      status.connected = false;
      status.last_error = Some(error.to_string());
      if error.requires_resync() {
        status.needs_resync = true;
        status.resyncs += 1;
      }
    });
  }

  fn disconnected(&self, db_id: u32) {
    self.update(db_id, |status| status.connected = false);
  }
}

/// Handle on the running supervisor; dropping the stop sender ends it.
#[derive(Debug)]
pub(crate) struct ReplicaSupervisor {
  stop: Option<Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl ReplicaSupervisor {
  pub(crate) fn start(inner: Arc<StoreInner>) -> Result<Self> {
    let (stop, stopped) = bounded::<()>(0);
    let handle = thread::Builder::new()
      .name("kitefs-replica".to_string())
      .spawn(move || supervise(&inner, &stopped))?;
    Ok(Self {
      stop: Some(stop),
      handle: Some(handle),
    })
  }

  /// Stop every session and wait for them to exit.
  pub(crate) fn stop(mut self) {
    self.shutdown();
  }

  fn shutdown(&mut self) {
    self.stop.take();
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for ReplicaSupervisor {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn supervise(inner: &Arc<StoreInner>, stopped: &Receiver<()>) {
  let mut sessions: HashMap<u32, JoinHandle<()>> = HashMap::new();
  debug!("replica supervisor started");

  loop {
    sessions.retain(|_, handle| !handle.is_finished());
    if let Some(url) = inner.primary_url() {
      match list_databases(&url, inner.options.connect_timeout) {
        Ok(infos) => {
          for info in infos {
            if sessions.contains_key(&info.id) {
              continue;
            }
            let db = match inner.ensure_database(&info) {
              Ok(db) => db,
              Err(error) => {
                warn!(db_id = info.id, name = %info.name, %error, "cannot create replica database");
                continue;
              }
            };
            match spawn_session(Arc::clone(inner), db, stopped.clone()) {
              Ok(handle) => {
                sessions.insert(info.id, handle);
              }
              Err(error) => warn!(db_id = info.id, %error, "cannot spawn replica session"),
            }
          }
        }
        Err(error) => debug!(primary_url = %url, %error, "cannot list primary databases"),
      }
    }

    match stopped.recv_timeout(inner.options.retry_interval) {
      Err(RecvTimeoutError::Timeout) => {}
      Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
    }
  }

  for (_, handle) in sessions {
    let _ = handle.join();
  }
  debug!("replica supervisor stopped");
}

fn spawn_session(
  inner: Arc<StoreInner>,
  db: Arc<Database>,
  stopped: Receiver<()>,
) -> Result<JoinHandle<()>> {
  let handle = thread::Builder::new()
    .name(format!("kitefs-replica-{}", db.id()))
    .spawn(move || run_session(&inner, &db, &stopped))?;
  Ok(handle)
}

fn run_session(inner: &StoreInner, db: &Database, stopped: &Receiver<()>) {
  let db_id = db.id();
  let mut attempt: u32 = 0;

  loop {
    if is_stopped(stopped) {
      break;
    }

    match follow_primary(inner, db, stopped) {
      Ok(()) => {
        inner.replica_board.disconnected(db_id);
        attempt = 0;
        continue;
      }
      Err(error) if error.requires_resync() => {
        warn!(db_id, txid = db.txid(), %error, "replica diverged from primary, resyncing");
        inner.replica_board.failed(db_id, &error);
        if let Err(error) = db.reset() {
          warn!(db_id, %error, "cannot reset database for resync");
          db.flag_resync();
        }
        attempt = 0;
        continue;
      }
      Err(error) => {
        if error.is_retryable() {
          debug!(db_id, %error, "replication session failed");
        } else {
          warn!(db_id, %error, "replication session failed");
        }
        inner.replica_board.failed(db_id, &error);
        attempt = attempt.saturating_add(1);
      }
    }

    match stopped.recv_timeout(backoff(inner.options.retry_interval, attempt)) {
      Err(RecvTimeoutError::Timeout) => {}
      Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
    }
  }
  inner.replica_board.disconnected(db_id);
}

/// Exponential backoff with up to 50% random jitter.
fn backoff(base: Duration, attempt: u32) -> Duration {
  let scaled = base.saturating_mul(1 << attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT));
  let jitter_ms = scaled.as_millis() as u64 / 2;
  if jitter_ms == 0 {
    return scaled;
  }
  scaled + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// One session against the current primary. Returns `Ok` when it ended
/// cleanly: the store is stopping or the primary moved.
fn follow_primary(inner: &StoreInner, db: &Database, stopped: &Receiver<()>) -> Result<()> {
  let db_id = db.id();
  let url = inner.primary_url().ok_or(KiteError::NoPrimary)?;
  if db.needs_resync() {
    warn!(db_id, "local state flagged, resyncing from snapshot");
    db.reset()?;
  }

  let stream = connect(&url, inner.options.connect_timeout)?;
  stream.set_read_timeout(Some(SESSION_POLL_INTERVAL))?;
  stream.set_write_timeout(Some(inner.options.session_timeout))?;
  let mut writer: TcpStream = stream.try_clone()?;
  let mut reader = FrameReader::new(stream);

  let from = db.pos();
  write_message(
    &mut writer,
    &Message::Subscribe {
      replica_id: inner.node_id.clone(),
      db_id,
      pos: from,
    },
  )?;
  info!(db_id, primary_url = %url, from = %from, "replication session opened");
  inner.replica_board.connected(db_id);

  let mut last_frame = Instant::now();
  loop {
    if is_stopped(stopped) {
      return Ok(());
    }
    if inner.primary_url().as_deref() != Some(url.as_str()) {
      info!(db_id, primary_url = %url, "primary changed, closing session");
      return Ok(());
    }

    let Some(message) = reader.read_message()? else {
      if last_frame.elapsed() > inner.options.session_timeout {
        return Err(KiteError::Transport(format!(
          "primary silent for {:?}",
          last_frame.elapsed()
        )));
      }
      continue;
    };
    last_frame = Instant::now();

    match message {
      Message::Ltx(entry) => {
        db.apply(&entry)?;
        inner.replica_board.applied(db_id, entry.txid);
        write_message(
          &mut writer,
          &Message::Ack {
            db_id,
            txid: entry.txid,
          },
        )?;
        debug!(db_id, txid = entry.txid, snapshot = entry.is_snapshot(), "applied entry");
      }
      Message::Heartbeat { txid } => inner.replica_board.primary_head(db_id, txid),
      Message::Reset => {
        warn!(db_id, "primary database is empty, discarding local state");
        db.reset()?;
      }
      Message::Refused { reason } => {
        return Err(KiteError::Transport(format!("primary refused session: {reason}")));
      }
      other => return Err(unexpected(&other)),
    }
  }
}

fn is_stopped(stopped: &Receiver<()>) -> bool {
  matches!(
    stopped.try_recv(),
    Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected)
  )
}
