//! Node role and replication position types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  /// No valid lease; trying to acquire or waiting for a primary.
  #[default]
  Candidate,
  Primary,
  Replica,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      Role::Candidate => "candidate",
      Role::Primary => "primary",
      Role::Replica => "replica",
    };
    write!(f, "{value}")
  }
}

impl FromStr for Role {
  type Err = ParseError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    match raw {
      "candidate" => Ok(Self::Candidate),
      "primary" => Ok(Self::Primary),
      "replica" => Ok(Self::Replica),
      _ => Err(ParseError::new(format!("invalid role: {raw}"))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
  message: String,
}

impl ParseError {
  fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

impl fmt::Display for ParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.message)
  }
}

impl std::error::Error for ParseError {}

/// A database position: last applied TXID and the post-apply checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Pos {
  pub txid: u64,
  pub post_checksum: u64,
}

impl Pos {
  pub const fn new(txid: u64, post_checksum: u64) -> Self {
    Self {
      txid,
      post_checksum,
    }
  }

  pub fn is_zero(&self) -> bool {
    self.txid == 0
  }
}

impl fmt::Display for Pos {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:016x}/{:016x}", self.txid, self.post_checksum)
  }
}

impl FromStr for Pos {
  type Err = ParseError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let mut parts = raw.split('/');
    let txid = parse_hex_component(parts.next(), "txid", raw)?;
    let post_checksum = parse_hex_component(parts.next(), "checksum", raw)?;

    if parts.next().is_some() {
      return Err(ParseError::new(format!("invalid position format: {raw}")));
    }

    Ok(Self::new(txid, post_checksum))
  }
}

fn parse_hex_component(
  value: Option<&str>,
  component: &'static str,
  original: &str,
) -> Result<u64, ParseError> {
  let value = value.ok_or_else(|| {
    ParseError::new(format!("invalid position ({component} missing): {original}"))
  })?;

  if value.len() != 16 || !value.bytes().all(|byte| byte.is_ascii_hexdigit()) {
    return Err(ParseError::new(format!("invalid {component}: {value}")));
  }

  u64::from_str_radix(value, 16)
    .map_err(|_| ParseError::new(format!("invalid position ({component}): {original}")))
}
