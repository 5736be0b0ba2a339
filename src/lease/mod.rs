//! Primary leases and the strategies that hand them out.
//!
//! A `Leaser` talks to whatever decides who the primary is (a Consul
//! cluster, a static configuration, an in-process service in tests) and
//! produces `Lease`s. The store does not care which one is plugged in.

pub mod consul;
pub mod fixed;
pub mod memory;

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;

pub use consul::ConsulLeaser;
pub use fixed::{FixedLeaser, IdentityProbe};
pub use memory::{MemoryLeaser, MemoryLockService};

/// A time-boxed claim to the primary role.
pub trait Lease: Send + fmt::Debug {
  /// When the holder last confirmed the lease. Taken before the renewal
  /// request is sent so the local view never outlives the backend's.
  fn renewed_at(&self) -> Instant;

  /// Validity window after `renewed_at`; `None` means the lease never
  /// expires on its own.
  fn ttl(&self) -> Option<Duration>;

  /// Extend the lease. Any error means the lease must be treated as lost.
  fn renew(&mut self) -> Result<()>;

  /// Give the lease up voluntarily.
  fn release(self: Box<Self>) -> Result<()>;

  fn expires_at(&self) -> Option<Instant> {
    self
      .ttl()
      .and_then(|ttl| self.renewed_at().checked_add(ttl))
  }

  fn is_valid_at(&self, now: Instant) -> bool {
    match self.expires_at() {
      Some(expires_at) => now < expires_at,
      None => true,
    }
  }
}

/// Strategy for obtaining leases.
pub trait Leaser: Send + Sync + fmt::Debug {
  fn kind(&self) -> &'static str;

  /// Try to become primary, registering `advertise_url` as the address
  /// replicas should connect to. Fails with `NoPrimary` when the backend
  /// cannot be reached or is in its lock-delay window, and `PrimaryExists`
  /// when someone else holds the lease.
  fn acquire(&self, advertise_url: &str) -> Result<Box<dyn Lease>>;

  /// Address of the current primary, if any.
  fn primary_url(&self) -> Result<Option<String>>;

  /// Whether a lease handed out by this leaser is currently valid.
  fn is_primary(&self) -> bool;

  fn close(&self) -> Result<()> {
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
  Never,
  At(Instant),
}

/// Validity of the lease currently handed out by a leaser, shared between
/// the leaser and its lease so `Leaser::is_primary` stays a local check.
#[derive(Debug, Default)]
pub(crate) struct HeldLease {
  deadline: Mutex<Option<Deadline>>,
}

impl HeldLease {
  pub(crate) fn set(&self, expires_at: Option<Instant>) {
    *self.deadline.lock() = Some(match expires_at {
      Some(at) => Deadline::At(at),
      None => Deadline::Never,
    });
  }

  pub(crate) fn clear(&self) {
    *self.deadline.lock() = None;
  }

  pub(crate) fn is_held(&self) -> bool {
    match *self.deadline.lock() {
      Some(Deadline::Never) => true,
      Some(Deadline::At(at)) => Instant::now() < at,
      None => false,
    }
  }
}
