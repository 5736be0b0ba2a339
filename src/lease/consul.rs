//! Consul-backed leaser.
//!
//! The lease is a Consul session (TTL + lock-delay, `delete` behavior)
//! holding the lock on a KV key whose value is the primary's advertised URL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{HeldLease, Lease, Leaser};
use crate::error::{KiteError, Result};

const SESSION_NAME: &str = "kitefs";

#[derive(Debug, Deserialize)]
struct SessionCreated {
  #[serde(rename = "ID")]
  id: String,
}

#[derive(Debug, Deserialize)]
struct KvPair {
  #[serde(rename = "Value", default)]
  value: Option<String>,
  #[serde(rename = "Session", default)]
  session: Option<String>,
}

#[derive(Debug, Clone)]
struct ConsulClient {
  agent: ureq::Agent,
  base_url: String,
  key: String,
}

impl ConsulClient {
  fn kv_url(&self) -> String {
    format!("{}/v1/kv/{}", self.base_url, self.key)
  }

  fn create_session(&self, ttl: Duration, lock_delay: Duration) -> Result<String> {
    let request = json!({
      "Name": SESSION_NAME,
      "TTL": format_duration(ttl),
      "LockDelay": format_duration(lock_delay),
      "Behavior": "delete",
    });
    let body = self
      .agent
      .put(&format!("{}/v1/session/create", self.base_url))
      .set("Content-Type", "application/json")
      .send_string(&request.to_string())
      .map_err(request_error)?
      .into_string()?;
    let created: SessionCreated = serde_json::from_str(&body)
      .map_err(|error| KiteError::Serialization(format!("decode consul session: {error}")))?;
    Ok(created.id)
  }

  fn destroy_session(&self, session: &str) -> Result<()> {
    self
      .agent
      .put(&format!("{}/v1/session/destroy/{}", self.base_url, session))
      .call()
      .map_err(request_error)?;
    Ok(())
  }

  fn renew_session(&self, session: &str) -> Result<()> {
    self
      .agent
      .put(&format!("{}/v1/session/renew/{}", self.base_url, session))
      .call()
      .map_err(request_error)?;
    Ok(())
  }

  fn acquire(&self, session: &str, value: &str) -> Result<bool> {
    let body = self
      .agent
      .put(&self.kv_url())
      .query("acquire", session)
      .send_string(value)
      .map_err(request_error)?
      .into_string()?;
    Ok(body.trim() == "true")
  }

  fn release(&self, session: &str) -> Result<()> {
    self
      .agent
      .put(&self.kv_url())
      .query("release", session)
      .call()
      .map_err(request_error)?;
    Ok(())
  }

  /// Current `(session, value)` on the key, if locked.
  fn holder(&self) -> Result<Option<(String, String)>> {
    let response = match self.agent.get(&self.kv_url()).call() {
      Ok(response) => response,
      Err(ureq::Error::Status(404, _)) => return Ok(None),
      Err(error) => return Err(request_error(error)),
    };
    let body = response.into_string()?;
    let pairs: Vec<KvPair> = serde_json::from_str(&body)
      .map_err(|error| KiteError::Serialization(format!("decode consul kv: {error}")))?;

    let Some(pair) = pairs.into_iter().next() else {
      return Ok(None);
    };
    let Some(session) = pair.session else {
      return Ok(None);
    };
    let value = match pair.value {
      Some(encoded) => {
        let bytes = BASE64_STANDARD
          .decode(encoded.as_bytes())
          .map_err(|error| KiteError::Serialization(format!("decode consul value: {error}")))?;
        String::from_utf8(bytes)
          .map_err(|error| KiteError::Serialization(format!("consul value is not utf-8: {error}")))?
      }
      None => String::new(),
    };
    Ok(Some((session, value)))
  }
}

#[derive(Debug)]
pub struct ConsulLeaser {
  client: ConsulClient,
  ttl: Duration,
  lock_delay: Duration,
  held: Arc<HeldLease>,
}

impl ConsulLeaser {
  pub fn new(
    url: impl Into<String>,
    key: impl Into<String>,
    ttl: Duration,
    lock_delay: Duration,
    request_timeout: Duration,
  ) -> Self {
    let agent = ureq::AgentBuilder::new().timeout(request_timeout).build();
    Self {
      client: ConsulClient {
        agent,
        base_url: url.into().trim_end_matches('/').to_string(),
        key: key.into(),
      },
      ttl,
      lock_delay,
      held: Arc::new(HeldLease::default()),
    }
  }

  pub fn key(&self) -> &str {
    &self.client.key
  }
}

impl Leaser for ConsulLeaser {
  fn kind(&self) -> &'static str {
    "consul"
  }

  fn acquire(&self, advertise_url: &str) -> Result<Box<dyn Lease>> {
    let started = Instant::now();
    let session = self
      .client
      .create_session(self.ttl, self.lock_delay)
      .map_err(|error| {
        debug!(%error, "consul session create failed");
        KiteError::NoPrimary
      })?;

    let acquired = match self.client.acquire(&session, advertise_url) {
      Ok(acquired) => acquired,
      Err(error) => {
        debug!(%error, "consul lock acquire failed");
        let _ = self.client.destroy_session(&session);
        return Err(KiteError::NoPrimary);
      }
    };

    if !acquired {
      if let Err(error) = self.client.destroy_session(&session) {
        warn!(%error, session = %session, "cannot destroy unused consul session");
      }
      return match self.client.holder() {
        Ok(Some(_)) => Err(KiteError::PrimaryExists),
        Ok(None) | Err(_) => Err(KiteError::NoPrimary),
      };
    }

    self.held.set(Some(started + self.ttl));
    Ok(Box::new(ConsulLease {
      client: self.client.clone(),
      session,
      renewed_at: started,
      ttl: self.ttl,
      held: Arc::clone(&self.held),
    }))
  }

  fn primary_url(&self) -> Result<Option<String>> {
    match self.client.holder() {
      Ok(holder) => Ok(holder.map(|(_, url)| url)),
      Err(error) => {
        debug!(%error, "consul primary lookup failed");
        Err(KiteError::NoPrimary)
      }
    }
  }

  fn is_primary(&self) -> bool {
    self.held.is_held()
  }
}

#[derive(Debug)]
pub struct ConsulLease {
  client: ConsulClient,
  session: String,
  renewed_at: Instant,
  ttl: Duration,
  held: Arc<HeldLease>,
}

impl ConsulLease {
  fn try_renew(&self) -> Result<()> {
    self
      .client
      .renew_session(&self.session)
      .map_err(|error| KiteError::LeaseLost(format!("session renew: {error}")))?;

    match self.client.holder() {
      Ok(Some((session, _))) if session == self.session => Ok(()),
      Ok(_) => Err(KiteError::LeaseLost(
        "primary key no longer held by this session".to_string(),
      )),
      Err(error) => Err(KiteError::LeaseLost(format!("holder check: {error}"))),
    }
  }
}

impl Lease for ConsulLease {
  fn renewed_at(&self) -> Instant {
    self.renewed_at
  }

  fn ttl(&self) -> Option<Duration> {
    Some(self.ttl)
  }

  fn renew(&mut self) -> Result<()> {
    let started = Instant::now();
    if let Err(error) = self.try_renew() {
      self.held.clear();
      return Err(error);
    }
    self.renewed_at = started;
    self.held.set(Some(started + self.ttl));
    Ok(())
  }

  fn release(self: Box<Self>) -> Result<()> {
    self.held.clear();
    self.client.release(&self.session)?;
    self.client.destroy_session(&self.session)
  }
}

fn request_error(error: ureq::Error) -> KiteError {
  match error {
    ureq::Error::Status(code, _) => KiteError::Transport(format!("consul returned status {code}")),
    ureq::Error::Transport(transport) => KiteError::Transport(transport.to_string()),
  }
}

/// Consul parses Go duration strings; milliseconds keep sub-second TTLs.
fn format_duration(duration: Duration) -> String {
  format!("{}ms", duration.as_millis())
}
