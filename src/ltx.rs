//! Transaction log entries ("LTX") and their binary encoding.

use std::io::{Cursor, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{KiteError, Result};

const LTX_MAGIC: &[u8; 4] = b"KLTX";
pub const LTX_HEADER_BYTES: usize = 52;
const LTX_TRAILER_BYTES: usize = 4;

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
  pub struct LtxFlags: u32 {
    /// Entry holds every page of the database at `txid`.
    const SNAPSHOT = 1 << 0;
    /// Page section is deflate-compressed.
    const COMPRESSED = 1 << 1;
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFrame {
  pub pgno: u32,
  pub data: Vec<u8>,
}

/// One committed transaction. Immutable once appended to a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LtxEntry {
  pub flags: LtxFlags,
  pub page_size: u32,
  /// Database size in pages after this transaction.
  pub commit: u32,
  pub txid: u64,
  pub pre_checksum: u64,
  pub post_checksum: u64,
  pub timestamp_ms: u64,
  pub pages: Vec<PageFrame>,
}

/// Fixed-size summary of an entry, readable without the page section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LtxHeader {
  pub flags: LtxFlags,
  pub page_size: u32,
  pub commit: u32,
  pub txid: u64,
  pub pre_checksum: u64,
  pub post_checksum: u64,
  pub timestamp_ms: u64,
  pub page_count: u32,
}

impl LtxEntry {
  pub fn is_snapshot(&self) -> bool {
    self.flags.contains(LtxFlags::SNAPSHOT)
  }

  pub fn header(&self) -> LtxHeader {
    LtxHeader {
      flags: self.flags,
      page_size: self.page_size,
      commit: self.commit,
      txid: self.txid,
      pre_checksum: self.pre_checksum,
      post_checksum: self.post_checksum,
      timestamp_ms: self.timestamp_ms,
      page_count: self.pages.len() as u32,
    }
  }

  /// Same entry with the page section compressed on encode.
  pub fn compressed(mut self) -> Self {
    self.flags.insert(LtxFlags::COMPRESSED);
    self
  }

  /// Structural checks shared by encode and decode.
  pub fn validate(&self) -> Result<()> {
    if self.page_size == 0 {
      return Err(KiteError::InvalidLtx("page size must be non-zero".to_string()));
    }
    if self.txid == 0 {
      return Err(KiteError::InvalidLtx("txid must be non-zero".to_string()));
    }

    let mut prev = 0u32;
    for page in &self.pages {
      if page.pgno == 0 {
        return Err(KiteError::InvalidLtx("page number 0 is reserved".to_string()));
      }
      if page.pgno <= prev {
        return Err(KiteError::InvalidLtx(format!(
          "pages out of order at pgno {} (previous {})",
          page.pgno, prev
        )));
      }
      if page.pgno > self.commit {
        return Err(KiteError::InvalidLtx(format!(
          "pgno {} beyond commit size {}",
          page.pgno, self.commit
        )));
      }
      if page.data.len() != self.page_size as usize {
        return Err(KiteError::InvalidLtx(format!(
          "pgno {} has {} bytes, page size is {}",
          page.pgno,
          page.data.len(),
          self.page_size
        )));
      }
      prev = page.pgno;
    }

    if self.is_snapshot() {
      if self.pages.len() != self.commit as usize {
        return Err(KiteError::InvalidLtx(format!(
          "snapshot carries {} pages for commit size {}",
          self.pages.len(),
          self.commit
        )));
      }
      if self.pre_checksum != 0 {
        return Err(KiteError::InvalidLtx(
          "snapshot must have a zero pre-checksum".to_string(),
        ));
      }
    }

    Ok(())
  }

  pub fn encode(&self) -> Result<Vec<u8>> {
    self.validate()?;

    let mut bytes = Vec::with_capacity(
      LTX_HEADER_BYTES + self.pages.len() * (4 + self.page_size as usize) + LTX_TRAILER_BYTES,
    );
    write_header(&mut bytes, &self.header())?;

    let mut section = Vec::with_capacity(self.pages.len() * (4 + self.page_size as usize));
    for page in &self.pages {
      section.write_u32::<LittleEndian>(page.pgno)?;
      section.extend_from_slice(&page.data);
    }

    if self.flags.contains(LtxFlags::COMPRESSED) {
      let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
      encoder.write_all(&section)?;
      let compressed = encoder.finish()?;
      let len = u32::try_from(compressed.len()).map_err(|_| {
        KiteError::InvalidLtx(format!("compressed page section too large: {}", compressed.len()))
      })?;
      bytes.write_u32::<LittleEndian>(len)?;
      bytes.extend_from_slice(&compressed);
    } else {
      bytes.extend_from_slice(&section);
    }

    let crc = crc32fast::hash(&bytes);
    bytes.write_u32::<LittleEndian>(crc)?;
    Ok(bytes)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < LTX_HEADER_BYTES + LTX_TRAILER_BYTES {
      return Err(KiteError::InvalidLtx("ltx entry too short".to_string()));
    }

    let body_len = bytes.len() - LTX_TRAILER_BYTES;
    let stored = u32::from_le_bytes([
      bytes[body_len],
      bytes[body_len + 1],
      bytes[body_len + 2],
      bytes[body_len + 3],
    ]);
    let computed = crc32fast::hash(&bytes[..body_len]);
    if stored != computed {
      return Err(KiteError::CrcMismatch { stored, computed });
    }

    let header = decode_header(bytes)?;
    let body = &bytes[LTX_HEADER_BYTES..body_len];

    let frame_bytes = (header.page_size as usize).saturating_add(4);
    let expected = frame_bytes
      .checked_mul(header.page_count as usize)
      .ok_or_else(|| {
        KiteError::InvalidLtx(format!(
          "page section of {} pages of {} bytes overflows",
          header.page_count, header.page_size
        ))
      })?;

    let section = if header.flags.contains(LtxFlags::COMPRESSED) {
      let mut cursor = Cursor::new(body);
      let len = cursor.read_u32::<LittleEndian>()? as usize;
      let start = cursor.position() as usize;
      if start + len != body.len() {
        return Err(KiteError::InvalidLtx(
          "compressed page section length mismatch".to_string(),
        ));
      }
      // Inflate at most one byte past the declared size.
      let mut section = Vec::new();
      DeflateDecoder::new(&body[start..])
        .take(expected as u64 + 1)
        .read_to_end(&mut section)?;
      section
    } else {
      body.to_vec()
    };

    if section.len() != expected {
      return Err(KiteError::InvalidLtx(format!(
        "page section is {} bytes, expected {}",
        section.len(),
        expected
      )));
    }

    let mut pages = Vec::with_capacity(section.len() / frame_bytes);
    for chunk in section.chunks_exact(frame_bytes) {
      let pgno = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
      pages.push(PageFrame {
        pgno,
        data: chunk[4..].to_vec(),
      });
    }

    let entry = LtxEntry {
      flags: header.flags,
      page_size: header.page_size,
      commit: header.commit,
      txid: header.txid,
      pre_checksum: header.pre_checksum,
      post_checksum: header.post_checksum,
      timestamp_ms: header.timestamp_ms,
      pages,
    };
    entry.validate()?;
    Ok(entry)
  }
}

/// Decode only the fixed header. Does not verify the trailer.
pub fn decode_header(bytes: &[u8]) -> Result<LtxHeader> {
  if bytes.len() < LTX_HEADER_BYTES {
    return Err(KiteError::InvalidLtx("ltx header truncated".to_string()));
  }
  if &bytes[..4] != LTX_MAGIC {
    return Err(KiteError::InvalidLtx("ltx entry has invalid magic".to_string()));
  }

  let mut cursor = Cursor::new(&bytes[4..LTX_HEADER_BYTES]);
  let raw_flags = cursor.read_u32::<LittleEndian>()?;
  let flags = LtxFlags::from_bits(raw_flags)
    .ok_or_else(|| KiteError::InvalidLtx(format!("unknown ltx flags: {raw_flags:#x}")))?;

  Ok(LtxHeader {
    flags,
    page_size: cursor.read_u32::<LittleEndian>()?,
    commit: cursor.read_u32::<LittleEndian>()?,
    txid: cursor.read_u64::<LittleEndian>()?,
    pre_checksum: cursor.read_u64::<LittleEndian>()?,
    post_checksum: cursor.read_u64::<LittleEndian>()?,
    timestamp_ms: cursor.read_u64::<LittleEndian>()?,
    page_count: cursor.read_u32::<LittleEndian>()?,
  })
}

fn write_header(bytes: &mut Vec<u8>, header: &LtxHeader) -> Result<()> {
  bytes.extend_from_slice(LTX_MAGIC);
  bytes.write_u32::<LittleEndian>(header.flags.bits())?;
  bytes.write_u32::<LittleEndian>(header.page_size)?;
  bytes.write_u32::<LittleEndian>(header.commit)?;
  bytes.write_u64::<LittleEndian>(header.txid)?;
  bytes.write_u64::<LittleEndian>(header.pre_checksum)?;
  bytes.write_u64::<LittleEndian>(header.post_checksum)?;
  bytes.write_u64::<LittleEndian>(header.timestamp_ms)?;
  bytes.write_u32::<LittleEndian>(header.page_count)?;
  Ok(())
}

pub(crate) fn now_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}
