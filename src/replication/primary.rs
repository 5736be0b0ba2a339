//! Primary-side replication: commit fan-out and inbound sessions.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::progress::upsert_replica_progress;
use super::transport::{write_message, FrameReader, Message};
use super::types::Pos;
use crate::db::{CatchUp, Database};
use crate::error::{KiteError, Result};
use crate::ltx::{now_ms, LtxEntry};
use crate::store::StoreInner;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Subscriber {
  id: u64,
  replica_id: String,
  sender: Sender<Arc<LtxEntry>>,
}

#[derive(Debug, Default)]
struct HubState {
  next_id: u64,
  subscribers: HashMap<u32, Vec<Subscriber>>,
}

/// Receiving end of one replica's queue.
#[derive(Debug)]
pub struct Subscription {
  pub id: u64,
  pub db_id: u32,
  pub receiver: Receiver<Arc<LtxEntry>>,
}

/// Fans committed entries out to every live session, each through its own
/// bounded queue. Publishing never blocks; a subscriber whose queue is full
/// is dropped and has to reconnect.
#[derive(Debug)]
pub struct SessionHub {
  queue_len: usize,
  state: Mutex<HubState>,
}

impl SessionHub {
  pub fn new(queue_len: usize) -> Self {
    Self {
      queue_len: queue_len.max(1),
      state: Mutex::new(HubState::default()),
    }
  }

  pub fn register(&self, db_id: u32, replica_id: &str) -> Subscription {
    let (sender, receiver) = bounded(self.queue_len);
    let mut state = self.state.lock();
    state.next_id += 1;
    let id = state.next_id;
    state.subscribers.entry(db_id).or_default().push(Subscriber {
      id,
      replica_id: replica_id.to_string(),
      sender,
    });
    Subscription {
      id,
      db_id,
      receiver,
    }
  }

  pub fn unregister(&self, subscription: &Subscription) {
    let mut state = self.state.lock();
    if let Some(subscribers) = state.subscribers.get_mut(&subscription.db_id) {
      subscribers.retain(|subscriber| subscriber.id != subscription.id);
      if subscribers.is_empty() {
        state.subscribers.remove(&subscription.db_id);
      }
    }
  }

  /// Queue `entry` for every subscriber of `db_id`. Returns how many
  /// subscribers accepted it.
  pub fn publish(&self, db_id: u32, entry: Arc<LtxEntry>) -> usize {
    let mut state = self.state.lock();
    let Some(subscribers) = state.subscribers.get_mut(&db_id) else {
      return 0;
    };

    let mut delivered = 0;
    subscribers.retain(|subscriber| match subscriber.sender.try_send(Arc::clone(&entry)) {
      Ok(()) => {
        delivered += 1;
        true
      }
      Err(TrySendError::Full(_)) => {
        warn!(
          db_id,
          replica_id = %subscriber.replica_id,
          txid = entry.txid,
          "replica queue full, dropping session"
        );
        false
      }
      Err(TrySendError::Disconnected(_)) => false,
    });
    delivered
  }

  pub fn session_count(&self, db_id: u32) -> usize {
    self
      .state
      .lock()
      .subscribers
      .get(&db_id)
      .map_or(0, Vec::len)
  }

  /// Drop every queue; sessions notice and hang up.
  pub fn close_all(&self) {
    let mut state = self.state.lock();
    let count: usize = state.subscribers.values().map(Vec::len).sum();
    state.subscribers.clear();
    if count > 0 {
      info!(sessions = count, "closed all replication sessions");
    }
  }
}

/// Accept inbound connections until the store shuts down.
pub(crate) fn spawn_acceptor(
  inner: Arc<StoreInner>,
  listener: TcpListener,
) -> Result<JoinHandle<()>> {
  listener.set_nonblocking(true)?;
  let handle = thread::Builder::new()
    .name("kitefs-acceptor".to_string())
    .spawn(move || accept_loop(&inner, &listener))?;
  Ok(handle)
}

fn accept_loop(inner: &Arc<StoreInner>, listener: &TcpListener) {
  let shutdown = inner.shutdown_signal();
  let mut connections: Vec<JoinHandle<()>> = Vec::new();

  loop {
    match listener.accept() {
      Ok((stream, peer)) => {
        connections.retain(|handle| !handle.is_finished());
        let inner = Arc::clone(inner);
        let spawned = thread::Builder::new()
          .name("kitefs-session".to_string())
          .spawn(move || {
            if let Err(error) = serve_connection(&inner, stream, peer) {
              debug!(%peer, %error, "replication connection ended");
            }
          });
        match spawned {
          Ok(handle) => connections.push(handle),
          Err(error) => warn!(%peer, %error, "cannot spawn session thread"),
        }
        continue;
      }
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
      Err(error) => warn!(%error, "accept failed"),
    }

    match shutdown.recv_timeout(ACCEPT_POLL_INTERVAL) {
      Err(RecvTimeoutError::Timeout) => {}
      Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
    }
  }

  for handle in connections {
    let _ = handle.join();
  }
  debug!("replication acceptor stopped");
}

fn serve_connection(inner: &StoreInner, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  stream.set_nonblocking(false)?;
  stream.set_nodelay(true)?;
  stream.set_read_timeout(Some(inner.options.session_timeout))?;
  stream.set_write_timeout(Some(inner.options.session_timeout))?;

  let mut writer = stream.try_clone()?;
  let mut reader = FrameReader::new(stream);
  let request = reader
    .read_message()?
    .ok_or_else(|| KiteError::Transport("no request before timeout".to_string()))?;

  match request {
    Message::Identify => write_message(
      &mut writer,
      &Message::Identity {
        node_id: inner.node_id.clone(),
        primary: inner.is_primary(),
      },
    ),
    Message::ListDatabases if inner.is_primary() => {
      write_message(&mut writer, &Message::Databases(inner.database_infos()))
    }
    Message::Subscribe {
      replica_id,
      db_id,
      pos,
    } if inner.is_primary() => match inner.db(db_id) {
      Some(db) => serve_subscription(inner, db, writer, reader, &replica_id, pos, peer),
      None => refuse(&mut writer, format!("unknown database {db_id}")),
    },
    Message::ListDatabases | Message::Subscribe { .. } => refuse(&mut writer, "not primary"),
    other => refuse(&mut writer, format!("unexpected request {other:?}")),
  }
}

fn refuse(writer: &mut TcpStream, reason: impl Into<String>) -> Result<()> {
  write_message(
    writer,
    &Message::Refused {
      reason: reason.into(),
    },
  )
}

/// One ReplicationSession: catch the replica up from `pos`, then stream
/// every new entry in commit order until either side goes away.
fn serve_subscription(
  inner: &StoreInner,
  db: Arc<Database>,
  mut writer: TcpStream,
  reader: FrameReader<TcpStream>,
  replica_id: &str,
  pos: Pos,
  peer: SocketAddr,
) -> Result<()> {
  let db_id = db.id();
  let (head, plan, subscription) = db.catch_up(pos, |_| inner.hub.register(db_id, replica_id))?;
  info!(db_id, %replica_id, %peer, from = %pos, head = %head, "replica subscribed");

  let acks = {
    let db_dir = db.dir().to_path_buf();
    let replica_id = replica_id.to_string();
    thread::Builder::new()
      .name("kitefs-acks".to_string())
      .spawn(move || read_acks(reader, &db_dir, &replica_id))?
  };

  let result = stream_entries(inner, &db, &mut writer, plan, head, &subscription);
  inner.hub.unregister(&subscription);
  let _ = writer.shutdown(Shutdown::Both);
  let _ = acks.join();

  match &result {
    Ok(()) => info!(db_id, %replica_id, "replication session closed"),
    Err(error) => info!(db_id, %replica_id, %error, "replication session failed"),
  }
  result
}

fn stream_entries(
  inner: &StoreInner,
  db: &Database,
  writer: &mut TcpStream,
  plan: CatchUp,
  head: Pos,
  subscription: &Subscription,
) -> Result<()> {
  match plan {
    CatchUp::Current => {}
    CatchUp::Entries(entries) => {
      for entry in entries {
        write_message(writer, &Message::Ltx(entry))?;
      }
    }
    CatchUp::Snapshot(snapshot) => {
      debug!(db_id = db.id(), txid = snapshot.txid, "sending snapshot");
      write_message(writer, &Message::Ltx(snapshot.compressed()))?;
    }
    CatchUp::Reset => write_message(writer, &Message::Reset)?,
  }

  let mut last_sent = head.txid;
  loop {
    match subscription
      .receiver
      .recv_timeout(inner.options.heartbeat_interval)
    {
      Ok(entry) => {
        if entry.txid <= last_sent {
          continue;
        }
        write_message(writer, &Message::Ltx((*entry).clone()))?;
        last_sent = entry.txid;
      }
      Err(RecvTimeoutError::Timeout) => {
        if inner.is_closed() || !inner.is_primary() {
          return Ok(());
        }
        write_message(writer, &Message::Heartbeat { txid: db.txid() })?;
      }
      Err(RecvTimeoutError::Disconnected) => return Ok(()),
    }
  }
}

fn read_acks(mut reader: FrameReader<TcpStream>, db_dir: &std::path::Path, replica_id: &str) {
  let mut pending: Option<u64> = None;
  let mut flushed_at = Instant::now();

  let flush = |txid: u64| {
    if let Err(error) = upsert_replica_progress(db_dir, replica_id, txid, now_ms()) {
      warn!(%replica_id, %error, "cannot record replica progress");
    }
  };

  loop {
    match reader.read_message() {
      Ok(Some(Message::Ack { txid, .. })) => pending = Some(txid),
      Ok(Some(_)) | Ok(None) => {}
      Err(_) => break,
    }
    if flushed_at.elapsed() >= PROGRESS_FLUSH_INTERVAL {
      if let Some(txid) = pending.take() {
        flush(txid);
      }
      flushed_at = Instant::now();
    }
  }
  if let Some(txid) = pending {
    flush(txid);
  }
}

#[cfg(test)]
mod tests {
  use super::SessionHub;
  use crate::ltx::{LtxEntry, LtxFlags};
  use std::sync::Arc;

  fn entry(txid: u64) -> Arc<LtxEntry> {
    Arc::new(LtxEntry {
      flags: LtxFlags::empty(),
      page_size: 16,
      commit: 0,
      txid,
      pre_checksum: 0,
      post_checksum: 0,
      timestamp_ms: 0,
      pages: Vec::new(),
    })
  }

  #[test]
  fn publish_preserves_order_per_subscriber() {
    let hub = SessionHub::new(8);
    let a = hub.register(1, "a");
    let b = hub.register(1, "b");
    let other = hub.register(2, "c");

    for txid in 1..=3 {
      assert_eq!(hub.publish(1, entry(txid)), 2);
    }
    let seen_a: Vec<u64> = a.receiver.try_iter().map(|e| e.txid).collect();
    let seen_b: Vec<u64> = b.receiver.try_iter().map(|e| e.txid).collect();
    assert_eq!(seen_a, vec![1, 2, 3]);
    assert_eq!(seen_b, vec![1, 2, 3]);
    assert!(other.receiver.try_recv().is_err());
  }

  #[test]
  fn slow_subscriber_is_dropped_without_blocking_others() {
    let hub = SessionHub::new(2);
    let slow = hub.register(1, "slow");
    let fast = hub.register(1, "fast");

    for txid in 1..=2 {
      hub.publish(1, entry(txid));
      fast.receiver.recv().expect("fast receives");
    }
    assert_eq!(hub.publish(1, entry(3)), 1);
    assert_eq!(hub.session_count(1), 1);
    assert_eq!(fast.receiver.recv().expect("fast receives").txid, 3);

    let drained: Vec<u64> = slow.receiver.try_iter().map(|e| e.txid).collect();
    assert_eq!(drained, vec![1, 2]);
    assert!(slow.receiver.recv().is_err());
  }

  #[test]
  fn unregister_and_close_all() {
    let hub = SessionHub::new(4);
    let a = hub.register(1, "a");
    let b = hub.register(1, "b");
    hub.unregister(&a);
    assert_eq!(hub.session_count(1), 1);

    hub.close_all();
    assert_eq!(hub.session_count(1), 0);
    assert!(b.receiver.recv().is_err());
  }
}
