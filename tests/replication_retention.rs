use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kitefs::lease::FixedLeaser;
use kitefs::retention::RetentionConfig;
use kitefs::{Role, Store, StoreOptions};

const PAGE_SIZE: u32 = 256;
const WAIT: Duration = Duration::from_secs(15);
const PROGRESS_MAX_AGE: Duration = Duration::from_secs(3);

fn options(dir: &Path) -> StoreOptions {
  let mut options = StoreOptions::new(dir)
    .page_size(PAGE_SIZE)
    .renew_interval(Duration::from_millis(50))
    .retry_interval(Duration::from_millis(25))
    .heartbeat_interval(Duration::from_millis(50))
    .session_timeout(Duration::from_secs(2))
    .connect_timeout(Duration::from_millis(500))
    .retention(RetentionConfig::ReplicaAware {
      min_entries: 1,
      min_age_ms: 0,
    })
    .retention_interval(Duration::from_millis(50));
  options.progress_max_age = PROGRESS_MAX_AGE;
  options
}

fn open_replica(dir: &Path, primary_url: &str) -> Store {
  let store = Store::open(
    options(dir),
    Arc::new(FixedLeaser::configured(primary_url, false)),
  )
  .expect("open replica");
  assert!(wait_until(WAIT, || store.role() == Role::Replica));
  store
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

fn commit(store: &Store, db_id: u32, fill: u8) -> u64 {
  store.begin_write(db_id).expect("begin");
  store
    .write_page(db_id, 1, &vec![fill; PAGE_SIZE as usize])
    .expect("write");
  store.commit(db_id).expect("commit")
}

#[test]
fn retention_spares_live_replicas_and_snapshots_departed_ones() {
  let dir = tempfile::tempdir().expect("tempdir");
  let primary = Store::open(
    options(&dir.path().join("primary")),
    Arc::new(FixedLeaser::configured("http://primary", true)),
  )
  .expect("open primary");
  assert!(wait_until(WAIT, || primary.is_primary()));
  let url = format!("http://{}", primary.local_addr());

  let follower_dir = dir.path().join("follower");
  let departed_dir = dir.path().join("departed");
  let follower = open_replica(&follower_dir, &url);
  let departed = open_replica(&departed_dir, &url);

  let db = primary.create_db("app.db").expect("create");
  assert!(wait_until(WAIT, || primary.status().databases[0].sessions == 2));
  for fill in 1..=3u8 {
    commit(&primary, db.id(), fill);
  }
  assert!(departed.wait_for_txid(db.id(), 3, WAIT).expect("wait"));
  assert!(follower.wait_for_txid(db.id(), 3, WAIT).expect("wait"));
  departed.close().expect("close departed");
  drop(departed);

  // Keep the follower acknowledging until the departed replica's progress
  // ages out and compaction moves past its position.
  let deadline = Instant::now() + WAIT + PROGRESS_MAX_AGE;
  let mut fill = 4u8;
  while db.log_bounds().0 <= 3 {
    assert!(Instant::now() < deadline, "log never compacted past txid 3");
    commit(&primary, db.id(), fill);
    fill = fill.wrapping_add(1);
    thread::sleep(Duration::from_millis(50));
  }
  assert!(follower.wait_for_txid(db.id(), db.txid(), WAIT).expect("wait"));

  // A short disconnect resumes from retained entries.
  let resume_from = follower.db(db.id()).expect("follower db").txid();
  assert!(db.log_bounds().0 <= resume_from);
  follower.close().expect("close follower");
  drop(follower);
  commit(&primary, db.id(), 0xa1);
  commit(&primary, db.id(), 0xa2);

  let follower = open_replica(&follower_dir, &url);
  assert!(follower.wait_for_txid(db.id(), db.txid(), WAIT).expect("wait"));
  let follower_db = follower.db(db.id()).expect("follower db");
  assert_eq!(follower_db.log_bounds().0, 1, "follower was sent a snapshot");
  assert_eq!(follower_db.image(), db.image());

  // The departed replica's position is gone from the log.
  let departed = open_replica(&departed_dir, &url);
  assert!(departed.wait_for_txid(db.id(), db.txid(), WAIT).expect("wait"));
  let departed_db = departed.db(db.id()).expect("departed db");
  assert_eq!(departed_db.log_bounds(), (db.txid(), db.txid()));
  assert_eq!(departed_db.image(), db.image());
}
