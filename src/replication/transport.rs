//! Framed wire protocol between stores.
//!
//! Every frame is a 16-byte header (`KFRM`, kind, reserved, payload length,
//! payload crc32) followed by the payload. Control messages are JSON; `Ltx`
//! frames carry the binary LTX encoding.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::Pos;
use crate::error::{KiteError, Result};
use crate::lease::IdentityProbe;
use crate::ltx::LtxEntry;

const FRAME_MAGIC: &[u8; 4] = b"KFRM";
pub const FRAME_HEADER_BYTES: usize = 16;
const MAX_FRAME_BYTES: usize = 1 << 30;
const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
  Identify = 1,
  Identity = 2,
  ListDatabases = 3,
  Databases = 4,
  Subscribe = 5,
  Ltx = 6,
  Heartbeat = 7,
  Ack = 8,
  Refused = 9,
  Reset = 10,
}

impl FrameKind {
  fn from_u8(value: u8) -> Result<Self> {
    Ok(match value {
      1 => Self::Identify,
      2 => Self::Identity,
      3 => Self::ListDatabases,
      4 => Self::Databases,
      5 => Self::Subscribe,
      6 => Self::Ltx,
      7 => Self::Heartbeat,
      8 => Self::Ack,
      9 => Self::Refused,
      10 => Self::Reset,
      other => return Err(KiteError::Transport(format!("unknown frame kind {other}"))),
    })
  }
}

/// A database as advertised by the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
  pub id: u32,
  pub name: String,
  pub page_size: u32,
  pub txid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
  Identify,
  Identity { node_id: String, primary: bool },
  ListDatabases,
  Databases(Vec<DatabaseInfo>),
  /// Open a replication session for one database, resuming after `pos`.
  Subscribe {
    replica_id: String,
    db_id: u32,
    pos: Pos,
  },
  Ltx(LtxEntry),
  Heartbeat { txid: u64 },
  Ack { db_id: u32, txid: u64 },
  Refused { reason: String },
  Reset,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityBody {
  node_id: String,
  primary: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody {
  replica_id: String,
  db_id: u32,
  txid: u64,
  post_checksum: u64,
}

#[derive(Serialize, Deserialize)]
struct HeartbeatBody {
  txid: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckBody {
  db_id: u32,
  txid: u64,
}

#[derive(Serialize, Deserialize)]
struct RefusedBody {
  reason: String,
}

impl Message {
  fn kind(&self) -> FrameKind {
    match self {
      Message::Identify => FrameKind::Identify,
      Message::Identity { .. } => FrameKind::Identity,
      Message::ListDatabases => FrameKind::ListDatabases,
      Message::Databases(_) => FrameKind::Databases,
      Message::Subscribe { .. } => FrameKind::Subscribe,
      Message::Ltx(_) => FrameKind::Ltx,
      Message::Heartbeat { .. } => FrameKind::Heartbeat,
      Message::Ack { .. } => FrameKind::Ack,
      Message::Refused { .. } => FrameKind::Refused,
      Message::Reset => FrameKind::Reset,
    }
  }

  fn payload(&self) -> Result<Vec<u8>> {
    match self {
      Message::Identify | Message::ListDatabases | Message::Reset => Ok(Vec::new()),
      Message::Identity { node_id, primary } => to_json(&IdentityBody {
        node_id: node_id.clone(),
        primary: *primary,
      }),
      Message::Databases(databases) => to_json(databases),
      Message::Subscribe {
        replica_id,
        db_id,
        pos,
      } => to_json(&SubscribeBody {
        replica_id: replica_id.clone(),
        db_id: *db_id,
        txid: pos.txid,
        post_checksum: pos.post_checksum,
      }),
      Message::Ltx(entry) => entry.encode(),
      Message::Heartbeat { txid } => to_json(&HeartbeatBody { txid: *txid }),
      Message::Ack { db_id, txid } => to_json(&AckBody {
        db_id: *db_id,
        txid: *txid,
      }),
      Message::Refused { reason } => to_json(&RefusedBody {
        reason: reason.clone(),
      }),
    }
  }

  fn from_payload(kind: FrameKind, payload: &[u8]) -> Result<Self> {
    Ok(match kind {
      FrameKind::Identify => Message::Identify,
      FrameKind::ListDatabases => Message::ListDatabases,
      FrameKind::Reset => Message::Reset,
      FrameKind::Identity => {
        let body: IdentityBody = from_json(payload)?;
        Message::Identity {
          node_id: body.node_id,
          primary: body.primary,
        }
      }
      FrameKind::Databases => Message::Databases(from_json(payload)?),
      FrameKind::Subscribe => {
        let body: SubscribeBody = from_json(payload)?;
        Message::Subscribe {
          replica_id: body.replica_id,
          db_id: body.db_id,
          pos: Pos::new(body.txid, body.post_checksum),
        }
      }
      FrameKind::Ltx => Message::Ltx(LtxEntry::decode(payload)?),
      FrameKind::Heartbeat => {
        let body: HeartbeatBody = from_json(payload)?;
        Message::Heartbeat { txid: body.txid }
      }
      FrameKind::Ack => {
        let body: AckBody = from_json(payload)?;
        Message::Ack {
          db_id: body.db_id,
          txid: body.txid,
        }
      }
      FrameKind::Refused => {
        let body: RefusedBody = from_json(payload)?;
        Message::Refused {
          reason: body.reason,
        }
      }
    })
  }
}

pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
  let payload = message.payload()?;
  let len = u32::try_from(payload.len())
    .ok()
    .filter(|len| (*len as usize) <= MAX_FRAME_BYTES)
    .ok_or_else(|| KiteError::Transport(format!("frame too large: {} bytes", payload.len())))?;

  let mut bytes = vec![0u8; FRAME_HEADER_BYTES];
  bytes[..4].copy_from_slice(FRAME_MAGIC);
  bytes[4] = message.kind() as u8;
  LittleEndian::write_u32(&mut bytes[8..12], len);
  LittleEndian::write_u32(&mut bytes[12..16], crc32fast::hash(&payload));
  bytes.extend_from_slice(&payload);
  Ok(bytes)
}

/// Decode one frame from the front of `bytes`. Returns `None` if more input
/// is needed, otherwise the message and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(Message, usize)>> {
  if bytes.len() < FRAME_HEADER_BYTES {
    return Ok(None);
  }
  if &bytes[..4] != FRAME_MAGIC {
    return Err(KiteError::Transport("frame has invalid magic".to_string()));
  }
  let kind = FrameKind::from_u8(bytes[4])?;
  let len = LittleEndian::read_u32(&bytes[8..12]) as usize;
  if len > MAX_FRAME_BYTES {
    return Err(KiteError::Transport(format!("frame too large: {len} bytes")));
  }
  let total = FRAME_HEADER_BYTES + len;
  if bytes.len() < total {
    return Ok(None);
  }

  let payload = &bytes[FRAME_HEADER_BYTES..total];
  let stored = LittleEndian::read_u32(&bytes[12..16]);
  let computed = crc32fast::hash(payload);
  if stored != computed {
    return Err(KiteError::CrcMismatch { stored, computed });
  }
  Ok(Some((Message::from_payload(kind, payload)?, total)))
}

pub fn write_message(writer: &mut impl Write, message: &Message) -> Result<()> {
  let frame = encode_frame(message)?;
  writer.write_all(&frame).map_err(transport_error)?;
  writer.flush().map_err(transport_error)
}

/// Buffers partial frames across reads so a read timeout never loses
/// framing.
#[derive(Debug)]
pub struct FrameReader<R> {
  inner: R,
  buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
  pub fn new(inner: R) -> Self {
    Self {
      inner,
      buf: Vec::new(),
    }
  }

  pub fn get_ref(&self) -> &R {
    &self.inner
  }

  /// Next message, or `None` if the underlying read timed out first.
  pub fn read_message(&mut self) -> Result<Option<Message>> {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
      if let Some((message, consumed)) = decode_frame(&self.buf)? {
        self.buf.drain(..consumed);
        return Ok(Some(message));
      }

      match self.inner.read(&mut chunk) {
        Ok(0) => return Err(KiteError::Transport("connection closed".to_string())),
        Ok(read) => self.buf.extend_from_slice(&chunk[..read]),
        Err(error) if is_timeout(&error) => return Ok(None),
        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
        Err(error) => return Err(transport_error(error)),
      }
    }
  }
}

/// Resolve a node URL (`http://host:port`, `host:port`) to a socket address.
pub fn resolve_url(url: &str) -> Result<SocketAddr> {
  let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
  let authority = without_scheme
    .split(['/', '?'])
    .next()
    .unwrap_or(without_scheme);
  authority
    .to_socket_addrs()
    .map_err(|error| KiteError::Transport(format!("resolve {url}: {error}")))?
    .next()
    .ok_or_else(|| KiteError::Transport(format!("no address for {url}")))
}

pub fn connect(url: &str, timeout: Duration) -> Result<TcpStream> {
  let addr = resolve_url(url)?;
  let stream = TcpStream::connect_timeout(&addr, timeout).map_err(transport_error)?;
  stream.set_nodelay(true).map_err(transport_error)?;
  Ok(stream)
}

/// One request, one reply, on a fresh connection.
pub fn request(url: &str, message: &Message, timeout: Duration) -> Result<Message> {
  let mut stream = connect(url, timeout)?;
  stream
    .set_write_timeout(Some(timeout))
    .map_err(transport_error)?;
  write_message(&mut stream, message)?;

  let deadline = Instant::now() + timeout;
  let mut reader = FrameReader::new(stream);
  loop {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      return Err(KiteError::Transport(format!("request to {url} timed out")));
    }
    reader
      .get_ref()
      .set_read_timeout(Some(remaining))
      .map_err(transport_error)?;
    if let Some(reply) = reader.read_message()? {
      return match reply {
        Message::Refused { reason } => Err(KiteError::Transport(format!("refused: {reason}"))),
        reply => Ok(reply),
      };
    }
  }
}

pub fn list_databases(url: &str, timeout: Duration) -> Result<Vec<DatabaseInfo>> {
  match request(url, &Message::ListDatabases, timeout)? {
    Message::Databases(databases) => Ok(databases),
    other => Err(unexpected(&other)),
  }
}

/// Asks a node for its id over the replication port.
#[derive(Debug, Clone)]
pub struct TcpIdentityProbe {
  timeout: Duration,
}

impl TcpIdentityProbe {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }
}

impl IdentityProbe for TcpIdentityProbe {
  fn node_id(&self, url: &str) -> Result<String> {
    match request(url, &Message::Identify, self.timeout)? {
      Message::Identity { node_id, .. } => Ok(node_id),
      other => Err(unexpected(&other)),
    }
  }
}

pub(crate) fn unexpected(message: &Message) -> KiteError {
  KiteError::Transport(format!("unexpected {:?} frame", message.kind()))
}

pub(crate) fn transport_error(error: io::Error) -> KiteError {
  KiteError::Transport(error.to_string())
}

pub(crate) fn is_timeout(error: &io::Error) -> bool {
  matches!(
    error.kind(),
    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
  )
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
  serde_json::to_vec(value)
    .map_err(|error| KiteError::Serialization(format!("encode frame payload: {error}")))
}

fn from_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
  serde_json::from_slice(payload)
    .map_err(|error| KiteError::Serialization(format!("decode frame payload: {error}")))
}
