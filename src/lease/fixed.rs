//! Statically configured primary.
//!
//! There is no election: the primary's address comes from configuration.
//! A node either knows its role up front, or asks the configured primary
//! for its node id and compares it to its own. Leases handed out here
//! never expire.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::{HeldLease, Lease, Leaser};
use crate::error::{KiteError, Result};

/// Resolves the node id served at a node's advertised address.
pub trait IdentityProbe: Send + Sync + fmt::Debug {
  fn node_id(&self, url: &str) -> Result<String>;
}

#[derive(Debug)]
enum Mode {
  Configured { primary: bool },
  Probed {
    node_id: String,
    probe: Arc<dyn IdentityProbe>,
    primary_id: Mutex<Option<String>>,
  },
}

#[derive(Debug)]
pub struct FixedLeaser {
  primary_url: String,
  mode: Mode,
  held: Arc<HeldLease>,
}

impl FixedLeaser {
  /// Role taken from configuration: `primary` nodes always win acquisition,
  /// every other node always sees an existing primary at `primary_url`.
  pub fn configured(primary_url: impl Into<String>, primary: bool) -> Self {
    Self {
      primary_url: primary_url.into(),
      mode: Mode::Configured { primary },
      held: Arc::new(HeldLease::default()),
    }
  }

  /// Role decided by asking `primary_url` for its node id. The node is
  /// primary when that id equals `node_id`.
  pub fn probed(
    primary_url: impl Into<String>,
    node_id: impl Into<String>,
    probe: Arc<dyn IdentityProbe>,
  ) -> Self {
    Self {
      primary_url: primary_url.into(),
      mode: Mode::Probed {
        node_id: node_id.into(),
        probe,
        primary_id: Mutex::new(None),
      },
      held: Arc::new(HeldLease::default()),
    }
  }

  fn grant(&self) -> Box<dyn Lease> {
    self.held.set(None);
    Box::new(FixedLease {
      renewed_at: Instant::now(),
      held: Arc::clone(&self.held),
    })
  }
}

impl Leaser for FixedLeaser {
  fn kind(&self) -> &'static str {
    "static"
  }

  fn acquire(&self, _advertise_url: &str) -> Result<Box<dyn Lease>> {
    match &self.mode {
      Mode::Configured { primary: true } => Ok(self.grant()),
      Mode::Configured { primary: false } => Err(KiteError::PrimaryExists),
      Mode::Probed {
        node_id,
        probe,
        primary_id,
      } => {
        let observed = probe.node_id(&self.primary_url).map_err(|error| {
          debug!(%error, url = %self.primary_url, "cannot reach configured primary");
          KiteError::NoPrimary
        })?;
        let is_self = observed == *node_id;
        *primary_id.lock() = Some(observed);
        if is_self {
          Ok(self.grant())
        } else {
          Err(KiteError::PrimaryExists)
        }
      }
    }
  }

  fn primary_url(&self) -> Result<Option<String>> {
    match &self.mode {
      Mode::Configured { .. } => Ok(Some(self.primary_url.clone())),
      Mode::Probed { primary_id, .. } => Ok(
        primary_id
          .lock()
          .as_ref()
          .map(|_| self.primary_url.clone()),
      ),
    }
  }

  fn is_primary(&self) -> bool {
    self.held.is_held()
  }
}

#[derive(Debug)]
pub struct FixedLease {
  renewed_at: Instant,
  held: Arc<HeldLease>,
}

impl Lease for FixedLease {
  fn renewed_at(&self) -> Instant {
    self.renewed_at
  }

  fn ttl(&self) -> Option<Duration> {
    None
  }

  fn renew(&mut self) -> Result<()> {
    self.renewed_at = Instant::now();
    Ok(())
  }

  fn release(self: Box<Self>) -> Result<()> {
    self.held.clear();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::{FixedLeaser, IdentityProbe};
  use crate::error::{KiteError, Result};
  use crate::lease::Leaser;
  use parking_lot::Mutex;
  use std::sync::Arc;
  use std::time::{Duration, Instant};

  #[derive(Debug)]
  struct StubProbe {
    answer: Mutex<Option<String>>,
  }

  impl IdentityProbe for StubProbe {
    fn node_id(&self, _url: &str) -> Result<String> {
      self
        .answer
        .lock()
        .clone()
        .ok_or_else(|| KiteError::Transport("connection refused".to_string()))
    }
  }

  #[test]
  fn configured_roles() {
    let primary = FixedLeaser::configured("http://a:20202", true);
    let replica = FixedLeaser::configured("http://a:20202", false);

    let lease = primary.acquire("http://a:20202").expect("primary acquires");
    assert_eq!(lease.ttl(), None);
    assert!(lease.is_valid_at(Instant::now() + Duration::from_secs(365 * 24 * 3600)));
    assert!(primary.is_primary());

    assert!(matches!(replica.acquire("http://b:20202"), Err(KiteError::PrimaryExists)));
    assert_eq!(
      replica.primary_url().expect("url").as_deref(),
      Some("http://a:20202")
    );
    assert!(!replica.is_primary());

    lease.release().expect("release");
    assert!(!primary.is_primary());
  }

  #[test]
  fn probed_role_follows_remote_identity() {
    let probe = Arc::new(StubProbe {
      answer: Mutex::new(None),
    });
    let leaser = FixedLeaser::probed("http://a:20202", "node-a", probe.clone());

    assert!(matches!(leaser.acquire(""), Err(KiteError::NoPrimary)));
    assert_eq!(leaser.primary_url().expect("url"), None);

    *probe.answer.lock() = Some("node-b".to_string());
    assert!(matches!(leaser.acquire(""), Err(KiteError::PrimaryExists)));
    assert_eq!(
      leaser.primary_url().expect("url").as_deref(),
      Some("http://a:20202")
    );

    *probe.answer.lock() = Some("node-a".to_string());
    let mut lease = leaser.acquire("").expect("self is primary");
    lease.renew().expect("renew never fails");
    assert!(leaser.is_primary());
  }
}
