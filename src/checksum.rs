//! Page and database checksums.
//!
//! A database checksum is the XOR of every page checksum, so a commit can
//! update it from the pages it touches without rescanning the file.

use xxhash_rust::xxh64::xxh64;

/// Checksum of one page, seeded with its page number so identical bytes at
/// different positions do not cancel out.
pub fn page_checksum(pgno: u32, data: &[u8]) -> u64 {
  xxh64(data, u64::from(pgno))
}

/// Full checksum over pages stored in page-number order starting at 1.
pub fn database_checksum<'a>(pages: impl IntoIterator<Item = &'a [u8]>) -> u64 {
  pages
    .into_iter()
    .enumerate()
    .fold(0u64, |acc, (index, data)| {
      acc ^ page_checksum(index as u32 + 1, data)
    })
}

#[cfg(test)]
mod tests {
  use super::{database_checksum, page_checksum};

  #[test]
  fn empty_database_checksum_is_zero() {
    assert_eq!(database_checksum(std::iter::empty::<&[u8]>()), 0);
  }

  #[test]
  fn incremental_update_matches_full_scan() {
    let a = vec![1u8; 64];
    let b = vec![2u8; 64];
    let c = vec![3u8; 64];

    let before = database_checksum([a.as_slice(), b.as_slice()]);
    let incremental = before ^ page_checksum(2, &b) ^ page_checksum(2, &c);
    let full = database_checksum([a.as_slice(), c.as_slice()]);
    assert_eq!(incremental, full);
  }

  #[test]
  fn identical_pages_at_different_positions_do_not_cancel() {
    let page = vec![9u8; 32];
    assert_ne!(database_checksum([page.as_slice(), page.as_slice()]), 0);
  }
}
