use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kitefs::lease::{MemoryLeaser, MemoryLockService};
use kitefs::{KiteError, Role, Store, StoreOptions};

const KEY: &str = "kitefs/primary";
const PAGE_SIZE: u32 = 256;
const TTL: Duration = Duration::from_millis(600);
const LOCK_DELAY: Duration = Duration::from_millis(300);
const RETRY: Duration = Duration::from_millis(25);
const WAIT: Duration = Duration::from_secs(10);

fn open_node(dir: &Path, service: &Arc<MemoryLockService>) -> Store {
  let leaser = Arc::new(MemoryLeaser::new(service.clone(), KEY, TTL, LOCK_DELAY));
  Store::open(
    StoreOptions::new(dir)
      .page_size(PAGE_SIZE)
      .renew_interval(Duration::from_millis(50))
      .retry_interval(RETRY)
      .heartbeat_interval(Duration::from_millis(50))
      .session_timeout(Duration::from_secs(2))
      .connect_timeout(Duration::from_millis(500)),
    leaser,
  )
  .expect("open store")
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  condition()
}

fn page(text: &str) -> Vec<u8> {
  let mut page = vec![0u8; PAGE_SIZE as usize];
  page[..text.len()].copy_from_slice(text.as_bytes());
  page
}

fn commit_page(store: &Store, db_id: u32, pgno: u32, text: &str) -> Result<u64, KiteError> {
  store.begin_write(db_id)?;
  store.write_page(db_id, pgno, &page(text))?;
  store.commit(db_id)
}

fn replicated_db(store: &Store, name: &str) -> u32 {
  assert!(
    wait_until(WAIT, || store.db_by_name(name).is_some()),
    "database {name} never appeared"
  );
  store.db_by_name(name).expect("database").id()
}

fn assert_same_image(a: &Store, b: &Store, db_id: u32) {
  let (pos_a, image_a) = a.db(db_id).expect("db on a").image();
  let (pos_b, image_b) = b.db(db_id).expect("db on b").image();
  assert_eq!(pos_a, pos_b);
  assert_eq!(image_a, image_b);
}

#[test]
fn replica_follows_primary_and_rejects_writes() {
  let dir = tempfile::tempdir().expect("tempdir");
  let service = MemoryLockService::new();

  let a = open_node(&dir.path().join("a"), &service);
  assert!(wait_until(WAIT, || a.is_primary()), "a never became primary");
  let b = open_node(&dir.path().join("b"), &service);
  assert!(wait_until(WAIT, || b.role() == Role::Replica));
  assert_eq!(b.primary_url().as_deref(), Some(a.advertise_url()));

  let db = a.create_db("app.db").expect("create");
  assert_eq!(commit_page(&a, db.id(), 1, "CREATE TABLE t(x)").expect("commit 1"), 1);
  assert_eq!(commit_page(&a, db.id(), 2, "x=100").expect("commit 2"), 2);

  let db_id = replicated_db(&b, "app.db");
  assert_eq!(db_id, db.id());
  assert!(b.wait_for_txid(db_id, 2, WAIT).expect("wait"));
  assert_same_image(&a, &b, db_id);
  assert_eq!(b.read_page(db_id, 2).expect("read"), Some(page("x=100")));

  assert!(matches!(b.begin_write(db_id), Err(KiteError::WriteRejected)));
  assert!(matches!(b.create_db("other.db"), Err(KiteError::WriteRejected)));
  assert!(!b.is_primary());

  let status = a.status();
  assert!(status.is_primary);
  assert_eq!(status.databases[0].txid, 2);
  assert!(wait_until(WAIT, || a.status().databases[0].sessions == 1));
}

#[test]
fn late_replica_catches_up_from_history() {
  let dir = tempfile::tempdir().expect("tempdir");
  let service = MemoryLockService::new();

  let a = open_node(&dir.path().join("a"), &service);
  assert!(wait_until(WAIT, || a.is_primary()));
  let first = a.create_db("first.db").expect("create");
  let second = a.create_db("second.db").expect("create");
  for n in 1..=12u32 {
    commit_page(&a, first.id(), n % 5 + 1, &format!("row {n}")).expect("commit");
  }
  commit_page(&a, second.id(), 1, "only").expect("commit");

  let b = open_node(&dir.path().join("b"), &service);
  let first_id = replicated_db(&b, "first.db");
  let second_id = replicated_db(&b, "second.db");
  assert!(b.wait_for_txid(first_id, 12, WAIT).expect("wait"));
  assert!(b.wait_for_txid(second_id, 1, WAIT).expect("wait"));
  assert_same_image(&a, &b, first_id);
  assert_same_image(&a, &b, second_id);

  commit_page(&a, first.id(), 9, "live").expect("commit");
  assert!(b.wait_for_txid(first_id, 13, WAIT).expect("wait"));
  assert_same_image(&a, &b, first_id);
}

#[test]
fn replica_takes_over_after_primary_loses_lease() {
  let dir = tempfile::tempdir().expect("tempdir");
  let service = MemoryLockService::new();

  let a_dir = dir.path().join("a");
  let a = open_node(&a_dir, &service);
  assert!(wait_until(WAIT, || a.is_primary()));
  let b = open_node(&dir.path().join("b"), &service);

  let db = a.create_db("app.db").expect("create");
  commit_page(&a, db.id(), 1, "CREATE TABLE t(x)").expect("commit");
  commit_page(&a, db.id(), 2, "x=100").expect("commit");
  let db_id = replicated_db(&b, "app.db");
  assert!(b.wait_for_txid(db_id, 2, WAIT).expect("wait"));

  // The primary's session dies without a clean release.
  let lost_at = Instant::now();
  assert!(service.revoke(KEY));
  a.close().expect("close a");

  assert!(wait_until(WAIT, || b.is_primary()), "b never took over");
  let takeover = lost_at.elapsed();
  assert!(takeover >= LOCK_DELAY, "took over inside the lock delay: {takeover:?}");
  assert!(takeover < LOCK_DELAY + RETRY * 16 + Duration::from_secs(1), "{takeover:?}");

  assert_eq!(commit_page(&b, db_id, 3, "x=200").expect("commit on b"), 3);
  drop(a);

  let a = open_node(&a_dir, &service);
  assert!(wait_until(WAIT, || a.role() == Role::Replica));
  assert!(a.wait_for_txid(db_id, 3, WAIT).expect("wait"));
  assert_same_image(&a, &b, db_id);
  assert_eq!(a.read_page(db_id, 2).expect("read"), Some(page("x=100")));
  assert_eq!(a.read_page(db_id, 3).expect("read"), Some(page("x=200")));
}

#[test]
fn failed_renewal_demotes_before_the_lease_expires() {
  let dir = tempfile::tempdir().expect("tempdir");
  let service = MemoryLockService::new();

  let a = open_node(&dir.path().join("a"), &service);
  assert!(wait_until(WAIT, || a.is_primary()));
  let db = a.create_db("app.db").expect("create");
  commit_page(&a, db.id(), 1, "before").expect("commit");

  service.set_unreachable(true);
  let unreachable_at = Instant::now();
  assert!(wait_until(TTL, || !a.is_primary()), "still primary after ttl");
  assert!(unreachable_at.elapsed() < TTL);
  assert_ne!(a.role(), Role::Primary);
  assert!(matches!(
    commit_page(&a, db.id(), 1, "after"),
    Err(KiteError::WriteRejected)
  ));
  assert_eq!(a.current_txid(db.id()).expect("txid"), 1);

  service.set_unreachable(false);
  assert!(wait_until(WAIT, || a.is_primary()), "never reacquired");
  assert_eq!(commit_page(&a, db.id(), 1, "after").expect("commit"), 2);
}

#[test]
fn demote_hands_primary_to_the_other_node() {
  let dir = tempfile::tempdir().expect("tempdir");
  let service = MemoryLockService::new();

  let a = open_node(&dir.path().join("a"), &service);
  assert!(wait_until(WAIT, || a.is_primary()));
  let b = open_node(&dir.path().join("b"), &service);
  let db = a.create_db("app.db").expect("create");
  commit_page(&a, db.id(), 1, "one").expect("commit");
  let db_id = replicated_db(&b, "app.db");
  assert!(b.wait_for_txid(db_id, 1, WAIT).expect("wait"));

  assert!(!b.demote(Duration::from_secs(1)).expect("demote replica"));
  assert!(a.demote(Duration::from_secs(5)).expect("demote primary"));
  assert!(!a.is_primary());

  assert!(wait_until(WAIT, || b.is_primary()), "b never took over");
  assert!(wait_until(WAIT, || a.primary_url().as_deref() == Some(b.advertise_url())));
  commit_page(&b, db_id, 2, "two").expect("commit on b");
  assert!(a.wait_for_txid(db_id, 2, WAIT).expect("wait"));
  assert_same_image(&a, &b, db_id);
}
