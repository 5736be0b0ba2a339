//! Lease monitor: the only place the node's role changes.
//!
//! As primary it renews the lease every `renew_interval` and demotes at the
//! first failed renewal. Otherwise it keeps trying to acquire, following
//! whoever holds the lease in the meantime.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, info, warn};

use super::StoreInner;
use crate::error::{KiteError, Result};
use crate::lease::Lease;
use crate::ltx::now_ms;
use crate::replication::progress::{
  load_replica_progress, min_applied_txid, prune_replica_progress,
};
use crate::replication::replica::ReplicaSupervisor;
use crate::replication::types::Role;

const MAX_RETRY_SHIFT: u32 = 4;

#[derive(Debug)]
pub(crate) enum Command {
  Demote {
    cooldown: Duration,
    reply: Sender<bool>,
  },
}

pub(crate) fn spawn_monitor(
  inner: Arc<StoreInner>,
  commands: Receiver<Command>,
) -> Result<JoinHandle<()>> {
  let handle = thread::Builder::new()
    .name("kitefs-monitor".to_string())
    .spawn(move || Monitor::new(inner).run(&commands))?;
  Ok(handle)
}

struct Monitor {
  inner: Arc<StoreInner>,
  lease: Option<Box<dyn Lease>>,
  replica: Option<ReplicaSupervisor>,
  hold_off_until: Option<Instant>,
  failures: u32,
  last_retention: Instant,
}

impl Monitor {
  fn new(inner: Arc<StoreInner>) -> Self {
    Self {
      inner,
      lease: None,
      replica: None,
      hold_off_until: None,
      failures: 0,
      last_retention: Instant::now(),
    }
  }

  fn run(mut self, commands: &Receiver<Command>) {
    let shutdown = self.inner.shutdown_signal();
    loop {
      let wait = self.step();
      select! {
        recv(shutdown) -> _ => break,
        recv(commands) -> command => match command {
          Ok(Command::Demote { cooldown, reply }) => {
            let was_primary = self.handoff(cooldown);
            let _ = reply.send(was_primary);
          }
          Err(_) => break,
        },
        default(wait) => {}
      }
    }
    self.shutdown();
  }

  /// One round of the state machine. Returns how long to wait before the
  /// next round.
  fn step(&mut self) -> Duration {
    if self.lease.is_some() {
      self.renew();
      if self.lease.is_some() {
        self.maybe_run_retention();
        return self.inner.options.renew_interval;
      }
      return self.inner.options.retry_interval;
    }

    if let Some(until) = self.hold_off_until {
      let now = Instant::now();
      if now < until {
        self.follow_current_primary();
        return (until - now).min(self.inner.options.retry_interval);
      }
      self.hold_off_until = None;
    }

    self.acquire()
  }

  fn acquire(&mut self) -> Duration {
    match self.inner.leaser.acquire(&self.inner.advertise_url) {
      Ok(lease) => {
        self.failures = 0;
        self.promote(lease);
        self.inner.options.renew_interval
      }
      Err(KiteError::PrimaryExists) => {
        self.failures = 0;
        self.follow_current_primary();
        self.inner.options.retry_interval
      }
      Err(error) => {
        self.failures = self.failures.saturating_add(1);
        debug!(%error, failures = self.failures, "no primary available");
        self.become_candidate();
        self
          .inner
          .options
          .retry_interval
          .saturating_mul(1 << self.failures.saturating_sub(1).min(MAX_RETRY_SHIFT))
      }
    }
  }

  fn promote(&mut self, lease: Box<dyn Lease>) {
    self.stop_replica();
    // Replicas rebuild from whatever this node serves, so a flagged
    // database has to be made self-consistent before taking writes.
    for db in self.inner.dbs() {
      if db.needs_resync() {
        if let Err(error) = db.rebuild() {
          warn!(db_id = db.id(), %error, "promoted with a database flagged for resync");
        }
      }
    }
    self.lease = Some(lease);
    self.inner.set_role(Role::Primary, None);
    self.last_retention = Instant::now();
  }

  fn renew(&mut self) {
    let Some(lease) = self.lease.as_mut() else {
      return;
    };
    if let Err(error) = lease.renew() {
      warn!(%error, "lease renewal failed, demoting");
      self.step_down();
    }
  }

  /// Leave the primary role immediately: reject writes, drop sessions and
  /// give the lease back if the backend still accepts it.
  fn step_down(&mut self) {
    self.inner.set_role(Role::Replica, None);
    self.inner.hub.close_all();
    for db in self.inner.dbs() {
      db.rollback();
    }
    if let Some(lease) = self.lease.take() {
      if let Err(error) = lease.release() {
        debug!(%error, "lease release after demotion failed");
      }
    }
    self.start_replica();
  }

  fn handoff(&mut self, cooldown: Duration) -> bool {
    if self.lease.is_none() {
      return false;
    }
    info!(cooldown_ms = cooldown.as_millis() as u64, "handing off primary role");
    self.step_down();
    self.hold_off_until = Some(Instant::now() + cooldown);
    true
  }

  fn follow_current_primary(&mut self) {
    match self.inner.leaser.primary_url() {
      Ok(url) => {
        let url = url.filter(|url| *url != self.inner.advertise_url);
        self.inner.set_role(Role::Replica, url);
        self.start_replica();
      }
      Err(error) => {
        debug!(%error, "cannot resolve primary");
        self.become_candidate();
      }
    }
  }

  fn become_candidate(&mut self) {
    self.stop_replica();
    self.inner.set_role(Role::Candidate, None);
  }

  fn start_replica(&mut self) {
    if self.replica.is_some() {
      return;
    }
    match ReplicaSupervisor::start(Arc::clone(&self.inner)) {
      Ok(supervisor) => self.replica = Some(supervisor),
      Err(error) => warn!(%error, "cannot start replica supervisor"),
    }
  }

  fn stop_replica(&mut self) {
    if let Some(supervisor) = self.replica.take() {
      supervisor.stop();
      self.inner.replica_board.clear();
    }
  }

  fn maybe_run_retention(&mut self) {
    if self.last_retention.elapsed() < self.inner.options.retention_interval {
      return;
    }
    self.last_retention = Instant::now();

    let max_age_ms = self.inner.options.progress_max_age.as_millis() as u64;
    let cutoff_ms = now_ms().saturating_sub(max_age_ms);
    for db in self.inner.dbs() {
      let min_replica_txid = prune_replica_progress(db.dir(), cutoff_ms)
        .and_then(|_| load_replica_progress(db.dir()))
        .map(|progress| min_applied_txid(&progress));
      let policy = self.inner.retention.as_ref();
      let result = min_replica_txid.and_then(|min_txid| db.run_retention(policy, min_txid));
      if let Err(error) = result {
        warn!(db_id = db.id(), %error, "retention failed");
      }
    }
  }

  fn shutdown(&mut self) {
    self.stop_replica();
    self.inner.hub.close_all();
    self.inner.set_role(Role::Candidate, None);
    if let Some(lease) = self.lease.take() {
      match lease.release() {
        Ok(()) => info!("released primary lease"),
        Err(error) => warn!(%error, "cannot release primary lease"),
      }
    }
    debug!("lease monitor stopped");
  }
}
