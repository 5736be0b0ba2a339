//! The store: every database on this node, the node's role, and the
//! background threads that keep both current.
//!
//! Role changes happen only on the monitor thread (see `monitor`). The
//! commit path holds a read guard on the role for its whole duration, so a
//! demotion waits for in-flight commits and no commit starts after it.

mod monitor;

use std::fs::{self, File, OpenOptions};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use fs2::FileExt;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{Database, DatabaseMeta};
use crate::error::{KiteError, Result};
use crate::lease::Leaser;
use crate::replication::primary::{spawn_acceptor, SessionHub};
use crate::replication::replica::{ReplicaBoard, ReplicaSessionStatus};
use crate::replication::transport::DatabaseInfo;
use crate::replication::types::Role;
use crate::retention::{RetentionConfig, RetentionPolicy};

use monitor::{spawn_monitor, Command};

const LOCK_FILE_NAME: &str = "lock";
const NODE_ID_FILE_NAME: &str = "id";
const DATABASES_DIR_NAME: &str = "dbs";
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tunables for a `Store`. `Config::store_options` fills these from a
/// config file; tests build them directly.
#[derive(Debug, Clone)]
pub struct StoreOptions {
  pub data_dir: PathBuf,
  /// Replication listener bind address.
  pub listen_addr: String,
  /// Address other nodes use to reach this one. Defaults to the bound
  /// listener address.
  pub advertise_url: Option<String>,
  pub page_size: u32,
  pub renew_interval: Duration,
  pub retry_interval: Duration,
  pub heartbeat_interval: Duration,
  pub session_timeout: Duration,
  pub connect_timeout: Duration,
  pub session_queue: usize,
  pub retention: RetentionConfig,
  pub retention_interval: Duration,
  /// Replicas silent for longer than this stop holding back retention.
  pub progress_max_age: Duration,
}

impl StoreOptions {
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir: data_dir.into(),
      listen_addr: "127.0.0.1:0".to_string(),
      advertise_url: None,
      page_size: 4096,
      renew_interval: Duration::from_secs(1),
      retry_interval: Duration::from_secs(1),
      heartbeat_interval: Duration::from_secs(1),
      session_timeout: Duration::from_secs(10),
      connect_timeout: Duration::from_secs(2),
      session_queue: 1024,
      retention: RetentionConfig::default(),
      retention_interval: Duration::from_secs(60),
      progress_max_age: Duration::from_secs(24 * 60 * 60),
    }
  }

  pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
    self.listen_addr = addr.into();
    self
  }

  pub fn advertise_url(mut self, url: impl Into<String>) -> Self {
    self.advertise_url = Some(url.into());
    self
  }

  pub fn page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn renew_interval(mut self, interval: Duration) -> Self {
    self.renew_interval = interval;
    self
  }

  pub fn retry_interval(mut self, interval: Duration) -> Self {
    self.retry_interval = interval;
    self
  }

  pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  pub fn session_timeout(mut self, timeout: Duration) -> Self {
    self.session_timeout = timeout;
    self
  }

  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  pub fn session_queue(mut self, len: usize) -> Self {
    self.session_queue = len;
    self
  }

  pub fn retention(mut self, retention: RetentionConfig) -> Self {
    self.retention = retention;
    self
  }

  pub fn retention_interval(mut self, interval: Duration) -> Self {
    self.retention_interval = interval;
    self
  }
}

#[derive(Debug, Default)]
pub(crate) struct RoleState {
  pub(crate) role: Role,
  pub(crate) primary_url: Option<String>,
}

/// State shared between the store handle and its background threads.
#[derive(Debug)]
pub(crate) struct StoreInner {
  pub(crate) options: StoreOptions,
  pub(crate) node_id: String,
  pub(crate) advertise_url: String,
  pub(crate) leaser: Arc<dyn Leaser>,
  pub(crate) hub: SessionHub,
  pub(crate) replica_board: ReplicaBoard,
  pub(crate) retention: Box<dyn RetentionPolicy>,
  pub(crate) role: RwLock<RoleState>,
  dbs: RwLock<HashMap<u32, Arc<Database>>>,
  shutdown: Receiver<()>,
  closed: AtomicBool,
}

impl StoreInner {
  pub(crate) fn shutdown_signal(&self) -> Receiver<()> {
    self.shutdown.clone()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  pub(crate) fn is_primary(&self) -> bool {
    holds_primary(&self.role.read(), self.leaser.as_ref())
  }

  /// Address of the primary this node follows; `None` unless replica.
  pub(crate) fn primary_url(&self) -> Option<String> {
    let role = self.role.read();
    match role.role {
      Role::Replica => role.primary_url.clone(),
      Role::Primary | Role::Candidate => None,
    }
  }

  pub(crate) fn set_role(&self, role: Role, primary_url: Option<String>) {
    let mut state = self.role.write();
    let changed = state.role != role || state.primary_url != primary_url;
    state.role = role;
    state.primary_url = primary_url;
    if changed {
      info!(
        role = %state.role,
        primary_url = state.primary_url.as_deref().unwrap_or("-"),
        "role changed"
      );
    }
  }

  pub(crate) fn db(&self, id: u32) -> Option<Arc<Database>> {
    self.dbs.read().get(&id).cloned()
  }

  pub(crate) fn dbs(&self) -> Vec<Arc<Database>> {
    let mut dbs: Vec<Arc<Database>> = self.dbs.read().values().cloned().collect();
    dbs.sort_by_key(|db| db.id());
    dbs
  }

  pub(crate) fn database_infos(&self) -> Vec<DatabaseInfo> {
    self
      .dbs()
      .iter()
      .map(|db| DatabaseInfo {
        id: db.id(),
        name: db.name().to_string(),
        page_size: db.page_size(),
        txid: db.txid(),
      })
      .collect()
  }

  fn databases_dir(&self) -> PathBuf {
    self.options.data_dir.join(DATABASES_DIR_NAME)
  }

  /// Local copy of a database the primary advertises. A local database
  /// that shares the id or name but not the identity is replaced.
  pub(crate) fn ensure_database(&self, info: &DatabaseInfo) -> Result<Arc<Database>> {
    let mut dbs = self.dbs.write();
    if let Some(db) = dbs.get(&info.id) {
      if db.name() == info.name && db.page_size() == info.page_size {
        return Ok(Arc::clone(db));
      }
    }

    let stale: Vec<u32> = dbs
      .values()
      .filter(|db| db.id() == info.id || db.name() == info.name)
      .map(|db| db.id())
      .collect();
    for id in stale {
      if let Some(db) = dbs.remove(&id) {
        warn!(
          db_id = id,
          name = %db.name(),
          "discarding local database that does not match primary"
        );
        fs::remove_dir_all(db.dir())?;
      }
    }

    let db = Arc::new(Database::create(
      database_dir(&self.databases_dir(), info.id),
      DatabaseMeta {
        id: info.id,
        name: info.name.clone(),
        page_size: info.page_size,
      },
    )?);
    info!(db_id = info.id, name = %info.name, "created replica database");
    dbs.insert(info.id, Arc::clone(&db));
    Ok(db)
  }

  fn create_db(&self, name: &str) -> Result<Arc<Database>> {
    let mut dbs = self.dbs.write();
    if dbs.values().any(|db| db.name() == name) {
      return Err(KiteError::DatabaseExists(name.to_string()));
    }

    let id = dbs.keys().max().copied().unwrap_or(0) + 1;
    let db = Arc::new(Database::create(
      database_dir(&self.databases_dir(), id),
      DatabaseMeta {
        id,
        name: name.to_string(),
        page_size: self.options.page_size,
      },
    )?);
    info!(db_id = id, name, "created database");
    dbs.insert(id, Arc::clone(&db));
    Ok(db)
  }
}

fn holds_primary(role: &RoleState, leaser: &dyn Leaser) -> bool {
  role.role == Role::Primary && leaser.is_primary()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
  pub id: u32,
  pub name: String,
  pub page_size: u32,
  pub page_count: u32,
  pub txid: u64,
  pub checksum: String,
  pub log_floor: u64,
  pub log_head: u64,
  pub sessions: usize,
  pub needs_resync: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub replica: Option<ReplicaSessionStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
  pub node_id: String,
  pub role: Role,
  pub is_primary: bool,
  pub primary_url: Option<String>,
  pub advertise_url: String,
  pub leaser: String,
  pub databases: Vec<DatabaseStatus>,
}

#[derive(Debug)]
pub struct Store {
  inner: Arc<StoreInner>,
  local_addr: SocketAddr,
  commands: Sender<Command>,
  shutdown: Mutex<Option<Sender<()>>>,
  threads: Mutex<Vec<JoinHandle<()>>>,
  lock_file: File,
}

impl Store {
  /// Open the store rooted at `options.data_dir` and start its background
  /// threads. The node starts as a candidate.
  pub fn open(options: StoreOptions, leaser: Arc<dyn Leaser>) -> Result<Self> {
    let data_dir = options.data_dir.clone();
    fs::create_dir_all(data_dir.join(DATABASES_DIR_NAME))?;

    let lock_file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .read(true)
      .write(true)
      .open(data_dir.join(LOCK_FILE_NAME))?;
    lock_file
      .try_lock_exclusive()
      .map_err(|_| KiteError::DataDirLocked(data_dir.clone()))?;

    let node_id = load_or_create_node_id(&data_dir)?;
    let dbs = load_databases(&data_dir.join(DATABASES_DIR_NAME))?;

    let listener = TcpListener::bind(&options.listen_addr).map_err(|error| {
      KiteError::Transport(format!("bind {}: {error}", options.listen_addr))
    })?;
    let local_addr = listener.local_addr()?;
    let advertise_url = options
      .advertise_url
      .clone()
      .unwrap_or_else(|| format!("http://{local_addr}"));

    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let (command_tx, command_rx) = unbounded();
    let db_count = dbs.len();
    let inner = Arc::new(StoreInner {
      hub: SessionHub::new(options.session_queue),
      replica_board: ReplicaBoard::default(),
      retention: options.retention.build(),
      options,
      node_id,
      advertise_url,
      leaser,
      role: RwLock::new(RoleState::default()),
      dbs: RwLock::new(dbs),
      shutdown: shutdown_rx,
      closed: AtomicBool::new(false),
    });

    let acceptor = spawn_acceptor(Arc::clone(&inner), listener)?;
    let monitor = spawn_monitor(Arc::clone(&inner), command_rx)?;
    info!(
      node_id = %inner.node_id,
      advertise_url = %inner.advertise_url,
      leaser = inner.leaser.kind(),
      databases = db_count,
      "store opened"
    );

    Ok(Self {
      inner,
      local_addr,
      commands: command_tx,
      shutdown: Mutex::new(Some(shutdown_tx)),
      threads: Mutex::new(vec![acceptor, monitor]),
      lock_file,
    })
  }

  pub fn node_id(&self) -> &str {
    &self.inner.node_id
  }

  pub fn advertise_url(&self) -> &str {
    &self.inner.advertise_url
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn data_dir(&self) -> &Path {
    &self.inner.options.data_dir
  }

  pub fn role(&self) -> Role {
    self.inner.role.read().role
  }

  /// Whether local writes are accepted right now.
  pub fn is_primary(&self) -> bool {
    self.inner.is_primary()
  }

  /// Address of the current primary as this node sees it.
  pub fn primary_url(&self) -> Option<String> {
    let role = self.inner.role.read();
    match role.role {
      Role::Primary => Some(self.inner.advertise_url.clone()),
      Role::Replica => role.primary_url.clone(),
      Role::Candidate => None,
    }
  }

  pub fn db(&self, id: u32) -> Option<Arc<Database>> {
    self.inner.db(id)
  }

  pub fn db_by_name(&self, name: &str) -> Option<Arc<Database>> {
    self
      .inner
      .dbs
      .read()
      .values()
      .find(|db| db.name() == name)
      .cloned()
  }

  pub fn dbs(&self) -> Vec<Arc<Database>> {
    self.inner.dbs()
  }

  /// Register a new database. Only the primary creates databases;
  /// replicas pick them up from the primary.
  pub fn create_db(&self, name: &str) -> Result<Arc<Database>> {
    let _role = self.primary_guard()?;
    self.inner.create_db(name)
  }

  pub fn begin_write(&self, db_id: u32) -> Result<()> {
    let _role = self.primary_guard()?;
    self.require_db(db_id)?.begin_write()
  }

  pub fn write_page(&self, db_id: u32, pgno: u32, data: &[u8]) -> Result<()> {
    let _role = self.primary_guard()?;
    self.require_db(db_id)?.write_page(pgno, data)
  }

  pub fn truncate(&self, db_id: u32, page_count: u32) -> Result<()> {
    let _role = self.primary_guard()?;
    self.require_db(db_id)?.truncate(page_count)
  }

  pub fn rollback(&self, db_id: u32) -> Result<()> {
    self.require_db(db_id)?.rollback();
    Ok(())
  }

  /// Commit the pending write set. Returns once the entry is durable in the
  /// transaction log and queued for every connected replica.
  pub fn commit(&self, db_id: u32) -> Result<u64> {
    let _role = self.primary_guard()?;
    let db = self.require_db(db_id)?;
    let hub = &self.inner.hub;
    db.commit_with(|entry| {
      hub.publish(db_id, entry);
    })
  }

  pub fn current_txid(&self, db_id: u32) -> Result<u64> {
    Ok(self.require_db(db_id)?.txid())
  }

  pub fn read_page(&self, db_id: u32, pgno: u32) -> Result<Option<Vec<u8>>> {
    Ok(self.require_db(db_id)?.read_page(pgno))
  }

  /// Block until database `db_id` reaches `txid`. Returns `false` on timeout.
  pub fn wait_for_txid(&self, db_id: u32, txid: u64, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
      if self.inner.is_closed() {
        return Err(KiteError::Closed);
      }
      if self.db(db_id).is_some_and(|db| db.txid() >= txid) {
        return Ok(true);
      }
      if Instant::now() >= deadline {
        return Ok(false);
      }
      std::thread::sleep(WAIT_POLL_INTERVAL);
    }
  }

  /// Hand the primary role off: release the lease and do not try to take
  /// it back for `cooldown`. Returns whether this node was primary.
  pub fn demote(&self, cooldown: Duration) -> Result<bool> {
    let (reply, done) = bounded(1);
    self
      .commands
      .send(Command::Demote { cooldown, reply })
      .map_err(|_| KiteError::Closed)?;
    done.recv().map_err(|_| KiteError::Closed)
  }

  pub fn status(&self) -> NodeStatus {
    let (role, primary_url) = {
      let role = self.inner.role.read();
      (role.role, role.primary_url.clone())
    };
    let databases = self
      .inner
      .dbs()
      .iter()
      .map(|db| {
        let pos = db.pos();
        let (log_floor, log_head) = db.log_bounds();
        DatabaseStatus {
          id: db.id(),
          name: db.name().to_string(),
          page_size: db.page_size(),
          page_count: db.page_count(),
          txid: pos.txid,
          checksum: format!("{:016x}", pos.post_checksum),
          log_floor,
          log_head,
          sessions: self.inner.hub.session_count(db.id()),
          needs_resync: db.needs_resync(),
          replica: match role {
            Role::Replica => self.inner.replica_board.get(db.id()),
            Role::Primary | Role::Candidate => None,
          },
        }
      })
      .collect();

    NodeStatus {
      node_id: self.inner.node_id.clone(),
      role,
      is_primary: self.is_primary(),
      primary_url: match role {
        Role::Primary => Some(self.inner.advertise_url.clone()),
        Role::Replica | Role::Candidate => primary_url,
      },
      advertise_url: self.inner.advertise_url.clone(),
      leaser: self.inner.leaser.kind().to_string(),
      databases,
    }
  }

  /// Stop all background threads, close every session and release the
  /// lease if held. Idempotent.
  pub fn close(&self) -> Result<()> {
    if self.inner.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    self.shutdown.lock().take();

    let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
    for handle in threads {
      let _ = handle.join();
    }

    let result = self.inner.leaser.close();
    FileExt::unlock(&self.lock_file)?;
    info!(node_id = %self.inner.node_id, "store closed");
    result
  }

  fn primary_guard(&self) -> Result<RwLockReadGuard<'_, RoleState>> {
    if self.inner.is_closed() {
      return Err(KiteError::Closed);
    }
    let role = self.inner.role.read();
    if !holds_primary(&role, self.inner.leaser.as_ref()) {
      return Err(KiteError::WriteRejected);
    }
    Ok(role)
  }

  fn require_db(&self, db_id: u32) -> Result<Arc<Database>> {
    self.db(db_id).ok_or(KiteError::DatabaseNotFound(db_id))
  }
}

impl Drop for Store {
  fn drop(&mut self) {
    if let Err(error) = self.close() {
      warn!(%error, "store close failed");
    }
  }
}

fn database_dir(root: &Path, id: u32) -> PathBuf {
  root.join(format!("{id:08x}"))
}

/// Node id stored in `<data_dir>/id`, generated on first use.
pub fn load_or_create_node_id(data_dir: &Path) -> Result<String> {
  let path = data_dir.join(NODE_ID_FILE_NAME);
  if path.exists() {
    let id = fs::read_to_string(&path)?.trim().to_string();
    if !id.is_empty() {
      return Ok(id);
    }
  }

  let id = format!("{:016X}", rand::random::<u64>());
  let temp_path = path.with_extension("tmp");
  fs::write(&temp_path, &id)?;
  fs::rename(&temp_path, &path)?;
  Ok(id)
}

fn load_databases(root: &Path) -> Result<HashMap<u32, Arc<Database>>> {
  let mut dbs = HashMap::new();
  for dir_entry in fs::read_dir(root)? {
    let path = dir_entry?.path();
    if !path.join("meta.json").exists() {
      continue;
    }
    let db = Database::open(&path)?;
    dbs.insert(db.id(), Arc::new(db));
  }
  Ok(dbs)
}

#[cfg(test)]
mod tests {
  use super::{Store, StoreOptions};
  use crate::error::KiteError;
  use crate::lease::{FixedLeaser, Leaser};
  use crate::replication::types::Role;
  use std::sync::Arc;
  use std::time::Duration;

  fn options(dir: &std::path::Path) -> StoreOptions {
    StoreOptions::new(dir)
      .renew_interval(Duration::from_millis(20))
      .retry_interval(Duration::from_millis(20))
  }

  fn wait_for_role(store: &Store, role: Role) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while store.role() != role {
      assert!(std::time::Instant::now() < deadline, "role never became {role}");
      std::thread::sleep(Duration::from_millis(5));
    }
  }

  #[test]
  fn data_dir_is_exclusive_and_node_id_is_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let leaser: Arc<dyn Leaser> = Arc::new(FixedLeaser::configured("http://x", false));

    let first = Store::open(options(dir.path()), leaser.clone()).expect("open");
    let node_id = first.node_id().to_string();
    assert!(matches!(
      Store::open(options(dir.path()), leaser.clone()),
      Err(KiteError::DataDirLocked(_))
    ));
    first.close().expect("close");
    drop(first);

    let second = Store::open(options(dir.path()), leaser).expect("reopen");
    assert_eq!(second.node_id(), node_id);
  }

  #[test]
  fn configured_primary_accepts_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(
      options(dir.path()).page_size(512),
      Arc::new(FixedLeaser::configured("http://self", true)),
    )
    .expect("open");
    wait_for_role(&store, Role::Primary);

    let db = store.create_db("app.db").expect("create");
    assert!(matches!(store.create_db("app.db"), Err(KiteError::DatabaseExists(_))));
    store.begin_write(db.id()).expect("begin");
    store.write_page(db.id(), 1, &[3; 512]).expect("write");
    assert_eq!(store.commit(db.id()).expect("commit"), 1);
    assert_eq!(store.current_txid(db.id()).expect("txid"), 1);
    assert!(store.wait_for_txid(db.id(), 1, Duration::ZERO).expect("wait"));

    let status = store.status();
    assert!(status.is_primary);
    assert_eq!(status.databases[0].txid, 1);
    assert_eq!(store.db_by_name("app.db").map(|db| db.id()), Some(db.id()));
  }

  #[test]
  fn configured_replica_rejects_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(
      options(dir.path()),
      Arc::new(FixedLeaser::configured("http://127.0.0.1:1", false)),
    )
    .expect("open");
    wait_for_role(&store, Role::Replica);

    assert!(!store.is_primary());
    assert_eq!(store.primary_url().as_deref(), Some("http://127.0.0.1:1"));
    assert!(matches!(store.create_db("app.db"), Err(KiteError::WriteRejected)));
    assert!(matches!(store.begin_write(1), Err(KiteError::WriteRejected)));

    store.close().expect("close");
    assert!(matches!(store.commit(1), Err(KiteError::Closed)));
  }

  #[test]
  fn demote_hands_off_and_holds_off() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(
      options(dir.path()),
      Arc::new(FixedLeaser::configured("http://self", true)),
    )
    .expect("open");
    wait_for_role(&store, Role::Primary);

    assert!(store.demote(Duration::from_millis(200)).expect("demote"));
    assert!(!store.is_primary());
    assert!(!store.demote(Duration::ZERO).expect("second demote"));
    wait_for_role(&store, Role::Primary);
  }
}
