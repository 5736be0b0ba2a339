//! In-process coordination service.
//!
//! Implements the same key-scoped contract as the Consul leaser (TTL,
//! lock-delay after involuntary expiry, immediate availability after an
//! explicit release) for tests and single-process clusters. Several stores
//! share one `MemoryLockService` through an `Arc`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{HeldLease, Lease, Leaser};
use crate::error::{KiteError, Result};

#[derive(Debug)]
struct LockRecord {
  session: u64,
  value: String,
  ttl: Duration,
  lock_delay: Duration,
  expires_at: Instant,
}

#[derive(Debug, Default)]
struct ServiceState {
  locks: HashMap<String, LockRecord>,
  delayed_until: HashMap<String, Instant>,
  next_session: u64,
  unreachable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryLockService {
  state: Mutex<ServiceState>,
}

impl MemoryLockService {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Simulate a network partition from the service.
  pub fn set_unreachable(&self, unreachable: bool) {
    self.state.lock().unreachable = unreachable;
  }

  /// Invalidate the current holder of `key` as if its session died. The
  /// lock-delay window applies. Returns whether a holder was revoked.
  pub fn revoke(&self, key: &str) -> bool {
    let mut state = self.state.lock();
    match state.locks.remove(key) {
      Some(record) => {
        state
          .delayed_until
          .insert(key.to_string(), Instant::now() + record.lock_delay);
        true
      }
      None => false,
    }
  }

  /// Value registered by the current holder of `key`.
  pub fn holder(&self, key: &str) -> Result<Option<String>> {
    let mut state = self.state.lock();
    if state.unreachable {
      return Err(KiteError::NoPrimary);
    }
    expire(&mut state, key, Instant::now());
    Ok(state.locks.get(key).map(|record| record.value.clone()))
  }

  fn acquire(&self, key: &str, value: &str, ttl: Duration, lock_delay: Duration) -> Result<u64> {
    let mut state = self.state.lock();
    if state.unreachable {
      return Err(KiteError::NoPrimary);
    }

    let now = Instant::now();
    expire(&mut state, key, now);
    if state.locks.contains_key(key) {
      return Err(KiteError::PrimaryExists);
    }
    if let Some(until) = state.delayed_until.get(key) {
      if now < *until {
        return Err(KiteError::NoPrimary);
      }
    }
    state.delayed_until.remove(key);

    state.next_session += 1;
    let session = state.next_session;
    state.locks.insert(
      key.to_string(),
      LockRecord {
        session,
        value: value.to_string(),
        ttl,
        lock_delay,
        expires_at: now + ttl,
      },
    );
    Ok(session)
  }

  fn renew(&self, key: &str, session: u64) -> Result<()> {
    let mut state = self.state.lock();
    if state.unreachable {
      return Err(KiteError::LeaseLost(
        "coordination service unreachable".to_string(),
      ));
    }

    let now = Instant::now();
    expire(&mut state, key, now);
    match state.locks.get_mut(key) {
      Some(record) if record.session == session => {
        record.expires_at = now + record.ttl;
        Ok(())
      }
      Some(_) => Err(KiteError::LeaseLost("lease held by another session".to_string())),
      None => Err(KiteError::LeaseLost("lease expired".to_string())),
    }
  }

  fn release(&self, key: &str, session: u64) -> Result<()> {
    let mut state = self.state.lock();
    if state.unreachable {
      return Err(KiteError::NoPrimary);
    }
    if state
      .locks
      .get(key)
      .is_some_and(|record| record.session == session)
    {
      state.locks.remove(key);
    }
    Ok(())
  }
}

fn expire(state: &mut ServiceState, key: &str, now: Instant) {
  let expired = state
    .locks
    .get(key)
    .is_some_and(|record| record.expires_at <= now);
  if expired {
    if let Some(record) = state.locks.remove(key) {
      state
        .delayed_until
        .insert(key.to_string(), record.expires_at + record.lock_delay);
    }
  }
}

#[derive(Debug)]
pub struct MemoryLeaser {
  service: Arc<MemoryLockService>,
  key: String,
  ttl: Duration,
  lock_delay: Duration,
  held: Arc<HeldLease>,
}

impl MemoryLeaser {
  pub fn new(
    service: Arc<MemoryLockService>,
    key: impl Into<String>,
    ttl: Duration,
    lock_delay: Duration,
  ) -> Self {
    Self {
      service,
      key: key.into(),
      ttl,
      lock_delay,
      held: Arc::new(HeldLease::default()),
    }
  }

  pub fn service(&self) -> &Arc<MemoryLockService> {
    &self.service
  }
}

impl Leaser for MemoryLeaser {
  fn kind(&self) -> &'static str {
    "memory"
  }

  fn acquire(&self, advertise_url: &str) -> Result<Box<dyn Lease>> {
    let started = Instant::now();
    let session = self
      .service
      .acquire(&self.key, advertise_url, self.ttl, self.lock_delay)?;
    self.held.set(Some(started + self.ttl));
    Ok(Box::new(MemoryLease {
      service: Arc::clone(&self.service),
      key: self.key.clone(),
      session,
      renewed_at: started,
      ttl: self.ttl,
      held: Arc::clone(&self.held),
    }))
  }

  fn primary_url(&self) -> Result<Option<String>> {
    self.service.holder(&self.key)
  }

  fn is_primary(&self) -> bool {
    self.held.is_held()
  }
}

#[derive(Debug)]
pub struct MemoryLease {
  service: Arc<MemoryLockService>,
  key: String,
  session: u64,
  renewed_at: Instant,
  ttl: Duration,
  held: Arc<HeldLease>,
}

impl Lease for MemoryLease {
  fn renewed_at(&self) -> Instant {
    self.renewed_at
  }

  fn ttl(&self) -> Option<Duration> {
    Some(self.ttl)
  }

  fn renew(&mut self) -> Result<()> {
    let started = Instant::now();
    if let Err(err) = self.service.renew(&self.key, self.session) {
      self.held.clear();
      return Err(err);
    }
    self.renewed_at = started;
    self.held.set(Some(started + self.ttl));
    Ok(())
  }

  fn release(self: Box<Self>) -> Result<()> {
    self.held.clear();
    self.service.release(&self.key, self.session)
  }
}

#[cfg(test)]
mod tests {
  use super::{MemoryLeaser, MemoryLockService};
  use crate::error::KiteError;
  use crate::lease::Leaser;
  use std::time::Duration;

  fn leaser(
    service: &std::sync::Arc<MemoryLockService>,
    ttl_ms: u64,
    delay_ms: u64,
  ) -> MemoryLeaser {
    MemoryLeaser::new(
      service.clone(),
      "primary",
      Duration::from_millis(ttl_ms),
      Duration::from_millis(delay_ms),
    )
  }

  #[test]
  fn second_acquirer_sees_primary_exists() {
    let service = MemoryLockService::new();
    let a = leaser(&service, 10_000, 0);
    let b = leaser(&service, 10_000, 0);

    let _lease = a.acquire("node-a").expect("acquire a");
    assert!(a.is_primary());
    assert!(matches!(b.acquire("node-b"), Err(KiteError::PrimaryExists)));
    assert_eq!(b.primary_url().expect("url").as_deref(), Some("node-a"));
    assert!(!b.is_primary());
  }

  #[test]
  fn release_frees_key_without_lock_delay() {
    let service = MemoryLockService::new();
    let a = leaser(&service, 10_000, 60_000);
    let b = leaser(&service, 10_000, 60_000);

    let lease = a.acquire("node-a").expect("acquire a");
    lease.release().expect("release");
    assert!(!a.is_primary());
    b.acquire("node-b").expect("acquire b after release");
  }

  #[test]
  fn expiry_enforces_lock_delay() {
    let service = MemoryLockService::new();
    let a = leaser(&service, 30, 200);
    let b = leaser(&service, 30, 200);

    let _lease = a.acquire("node-a").expect("acquire a");
    std::thread::sleep(Duration::from_millis(60));
    assert!(!a.is_primary());
    assert!(matches!(b.acquire("node-b"), Err(KiteError::NoPrimary)));
    assert_eq!(b.primary_url().expect("url"), None);

    std::thread::sleep(Duration::from_millis(250));
    b.acquire("node-b").expect("acquire after lock delay");
  }

  #[test]
  fn renew_fails_after_revoke_and_when_unreachable() {
    let service = MemoryLockService::new();
    let a = leaser(&service, 10_000, 0);

    let mut lease = a.acquire("node-a").expect("acquire");
    lease.renew().expect("renew");

    service.set_unreachable(true);
    assert!(matches!(lease.renew(), Err(KiteError::LeaseLost(_))));
    assert!(!a.is_primary());
    assert!(matches!(a.primary_url(), Err(KiteError::NoPrimary)));
    service.set_unreachable(false);

    assert!(service.revoke("primary"));
    assert!(matches!(lease.renew(), Err(KiteError::LeaseLost(_))));
  }
}
