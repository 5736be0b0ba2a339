//! Node configuration.
//!
//! Loaded from JSON with camelCase keys. Durations are written as strings
//! such as `"10s"`, `"500ms"` or `"2m"`.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KiteError, Result};
use crate::lease::{ConsulLeaser, FixedLeaser, Leaser};
use crate::replication::transport::TcpIdentityProbe;
use crate::retention::RetentionConfig;
use crate::store::{load_or_create_node_id, StoreOptions};

const DEFAULT_HTTP_ADDR: &str = ":20202";
const DEFAULT_CONSUL_KEY: &str = "kitefs/primary";
const DATA_DIR_SUFFIX: &str = ".kitefs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
  pub mount_dir: PathBuf,
  #[serde(default)]
  pub data_dir: Option<PathBuf>,
  #[serde(default = "default_http_addr")]
  pub http_addr: String,
  #[serde(default)]
  pub advertise_url: Option<String>,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default)]
  pub consul: Option<ConsulConfig>,
  #[serde(default, rename = "static")]
  pub static_primary: Option<StaticConfig>,
  #[serde(default)]
  pub retention: RetentionConfig,
  #[serde(default = "default_renew_interval", with = "duration_str")]
  pub renew_interval: Duration,
  #[serde(default = "default_retry_interval", with = "duration_str")]
  pub retry_interval: Duration,
  #[serde(default = "default_heartbeat_interval", with = "duration_str")]
  pub heartbeat_interval: Duration,
  #[serde(default = "default_session_timeout", with = "duration_str")]
  pub session_timeout: Duration,
  #[serde(default = "default_session_queue")]
  pub session_queue: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsulConfig {
  pub url: String,
  #[serde(default = "default_consul_key")]
  pub key: String,
  #[serde(default = "default_ttl", with = "duration_str")]
  pub ttl: Duration,
  #[serde(default = "default_lock_delay", with = "duration_str")]
  pub lock_delay: Duration,
  #[serde(default = "default_request_timeout", with = "duration_str")]
  pub request_timeout: Duration,
}

/// Fixed primary. Either the role is given (`primary`), or the node asks
/// `primaryUrl` for its node id (`probe`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StaticConfig {
  pub primary_url: String,
  #[serde(default)]
  pub primary: Option<bool>,
  #[serde(default)]
  pub probe: bool,
}

fn default_http_addr() -> String {
  DEFAULT_HTTP_ADDR.to_string()
}

fn default_page_size() -> u32 {
  4096
}

fn default_consul_key() -> String {
  DEFAULT_CONSUL_KEY.to_string()
}

fn default_ttl() -> Duration {
  Duration::from_secs(10)
}

fn default_lock_delay() -> Duration {
  Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
  Duration::from_secs(2)
}

fn default_renew_interval() -> Duration {
  Duration::from_secs(1)
}

fn default_retry_interval() -> Duration {
  Duration::from_secs(1)
}

fn default_heartbeat_interval() -> Duration {
  Duration::from_secs(1)
}

fn default_session_timeout() -> Duration {
  Duration::from_secs(10)
}

fn default_session_queue() -> usize {
  1024
}

impl Config {
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    Self::from_json(&text)
      .map_err(|error| KiteError::InvalidConfig(format!("{}: {error}", path.display())))
  }

  pub fn from_json(text: &str) -> Result<Self> {
    let config: Config = serde_json::from_str(text)
      .map_err(|error| KiteError::InvalidConfig(format!("parse config: {error}")))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.mount_dir.as_os_str().is_empty() {
      return Err(invalid("mountDir is required"));
    }
    if self.page_size == 0 || !self.page_size.is_power_of_two() {
      return Err(invalid(format!(
        "pageSize must be a power of two: {}",
        self.page_size
      )));
    }
    if self.session_queue == 0 {
      return Err(invalid("sessionQueue must be positive"));
    }
    if self.renew_interval.is_zero() || self.retry_interval.is_zero() {
      return Err(invalid("renewInterval and retryInterval must be positive"));
    }

    match (&self.consul, &self.static_primary) {
      (Some(consul), None) => {
        if consul.url.is_empty() || consul.key.is_empty() {
          return Err(invalid("consul.url and consul.key are required"));
        }
        if consul.ttl.is_zero() {
          return Err(invalid("consul.ttl must be positive"));
        }
        if consul.lock_delay.is_zero() {
          return Err(invalid("consul.lockDelay must be positive"));
        }
        if self.renew_interval >= consul.ttl {
          return Err(invalid(format!(
            "renewInterval ({:?}) must be shorter than consul.ttl ({:?})",
            self.renew_interval, consul.ttl
          )));
        }
      }
      (None, Some(fixed)) => {
        if fixed.primary_url.is_empty() {
          return Err(invalid("static.primaryUrl is required"));
        }
        if fixed.probe && fixed.primary.is_some() {
          return Err(invalid("static.primary and static.probe are exclusive"));
        }
      }
      (None, None) => return Err(invalid("one of consul or static is required")),
      (Some(_), Some(_)) => return Err(invalid("consul and static are exclusive")),
    }
    Ok(())
  }

  /// `dataDir`, or a `.kitefs` sibling of the mount directory.
  pub fn data_dir(&self) -> PathBuf {
    match &self.data_dir {
      Some(dir) => dir.clone(),
      None => {
        let mut dir: OsString = self.mount_dir.as_os_str().to_owned();
        dir.push(DATA_DIR_SUFFIX);
        PathBuf::from(dir)
      }
    }
  }

  /// Bind address for the listener; a bare `:port` binds every interface.
  pub fn listen_addr(&self) -> String {
    match self.http_addr.strip_prefix(':') {
      Some(port) => format!("0.0.0.0:{port}"),
      None => self.http_addr.clone(),
    }
  }

  pub fn store_options(&self) -> StoreOptions {
    let options = StoreOptions::new(self.data_dir())
      .listen_addr(self.listen_addr())
      .page_size(self.page_size)
      .renew_interval(self.renew_interval)
      .retry_interval(self.retry_interval)
      .heartbeat_interval(self.heartbeat_interval)
      .session_timeout(self.session_timeout)
      .session_queue(self.session_queue)
      .retention(self.retention.clone());
    match &self.advertise_url {
      Some(url) => options.advertise_url(url.clone()),
      None => options,
    }
  }

  /// Build the leaser this config selects.
  pub fn build_leaser(&self) -> Result<Arc<dyn Leaser>> {
    self.validate()?;
    if let Some(consul) = &self.consul {
      return Ok(Arc::new(ConsulLeaser::new(
        consul.url.clone(),
        consul.key.clone(),
        consul.ttl,
        consul.lock_delay,
        consul.request_timeout,
      )));
    }

    let fixed = self
      .static_primary
      .as_ref()
      .ok_or_else(|| invalid("one of consul or static is required"))?;
    if fixed.probe {
      let data_dir = self.data_dir();
      fs::create_dir_all(&data_dir)?;
      let node_id = load_or_create_node_id(&data_dir)?;
      let probe = Arc::new(TcpIdentityProbe::new(self.session_timeout));
      return Ok(Arc::new(FixedLeaser::probed(
        fixed.primary_url.clone(),
        node_id,
        probe,
      )));
    }
    Ok(Arc::new(FixedLeaser::configured(
      fixed.primary_url.clone(),
      fixed.primary.unwrap_or(false),
    )))
  }
}

fn invalid(message: impl Into<String>) -> KiteError {
  KiteError::InvalidConfig(message.into())
}

/// Parse `"500ms"`, `"10s"`, `"1.5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
  let raw = raw.trim();
  let split = raw
    .find(|c: char| c.is_ascii_alphabetic())
    .ok_or_else(|| format!("duration {raw:?} has no unit"))?;
  let (number, unit) = raw.split_at(split);
  let value: f64 = number
    .parse()
    .map_err(|_| format!("invalid duration {raw:?}"))?;
  if !value.is_finite() || value < 0.0 {
    return Err(format!("invalid duration {raw:?}"));
  }

  let millis = match unit {
    "ms" => value,
    "s" => value * 1_000.0,
    "m" => value * 60_000.0,
    "h" => value * 3_600_000.0,
    _ => return Err(format!("unknown duration unit {unit:?} in {raw:?}")),
  };
  Ok(Duration::from_micros((millis * 1_000.0).round() as u64))
}

pub fn format_duration(duration: Duration) -> String {
  let millis = duration.as_millis();
  if millis % 1_000 == 0 {
    format!("{}s", millis / 1_000)
  } else {
    format!("{millis}ms")
  }
}

mod duration_str {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&super::format_duration(*duration))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    super::parse_duration(&raw).map_err(serde::de::Error::custom)
  }
}
