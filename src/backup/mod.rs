//! Export and import of database images.
//!
//! An export is the plain database file at one committed position. An
//! import commits a whole image as a single transaction on the primary, so
//! replicas receive it like any other write.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::db::Database;
use crate::error::{KiteError, Result};
use crate::ltx::now_ms;
use crate::store::Store;
use crate::txlog::sync_dir;

/// Export options
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
  /// Overwrite an existing file at the destination
  pub overwrite: bool,
}

/// Export result information
#[derive(Debug, Clone)]
pub struct ExportResult {
  pub path: PathBuf,
  pub size: u64,
  pub txid: u64,
  pub checksum: u64,
  pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportResult {
  pub db_id: u32,
  pub txid: u64,
}

/// Write a consistent image of `db` to `path`.
pub fn export_database(
  db: &Database,
  path: impl AsRef<Path>,
  options: ExportOptions,
) -> Result<ExportResult> {
  let path = path.as_ref().to_path_buf();
  if path.exists() && !options.overwrite {
    return Err(KiteError::Io(io::Error::new(
      io::ErrorKind::AlreadyExists,
      format!("export target exists: {}", path.display()),
    )));
  }
  ensure_parent_dir(&path)?;

  let (pos, image) = db.image();
  let temp_path = path.with_extension("export.tmp");
  let mut file = OpenOptions::new()
    .create(true)
    .truncate(true)
    .write(true)
    .open(&temp_path)?;
  file.write_all(&image)?;
  file.sync_all()?;
  fs::rename(&temp_path, &path)?;
  if let Some(parent) = path.parent() {
    sync_dir(parent)?;
  }

  info!(db_id = db.id(), txid = pos.txid, path = %path.display(), "exported database");
  Ok(ExportResult {
    path,
    size: image.len() as u64,
    txid: pos.txid,
    checksum: pos.post_checksum,
    timestamp_ms: now_ms(),
  })
}

/// Commit the image at `path` as database `name`, creating it if needed.
/// Only valid on the primary.
pub fn import_database(store: &Store, name: &str, path: impl AsRef<Path>) -> Result<ImportResult> {
  let path = path.as_ref();
  let image = fs::read(path)?;

  let db = match store.db_by_name(name) {
    Some(db) => db,
    None => store.create_db(name)?,
  };
  let page_size = db.page_size() as usize;
  if image.len() % page_size != 0 {
    return Err(KiteError::InvalidPage(format!(
      "image size {} is not a multiple of page size {}",
      image.len(),
      page_size
    )));
  }
  let page_count = (image.len() / page_size) as u32;

  store.begin_write(db.id())?;
  let written = image
    .chunks_exact(page_size)
    .enumerate()
    .try_for_each(|(index, page)| store.write_page(db.id(), index as u32 + 1, page))
    .and_then(|()| store.truncate(db.id(), page_count));
  if let Err(error) = written {
    let _ = store.rollback(db.id());
    return Err(error);
  }
  let txid = store.commit(db.id())?;

  info!(db_id = db.id(), txid, pages = page_count, path = %path.display(), "imported database");
  Ok(ImportResult {
    db_id: db.id(),
    txid,
  })
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() && !parent.exists() {
      fs::create_dir_all(parent)?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::{export_database, import_database, ExportOptions};
  use crate::error::KiteError;
  use crate::lease::FixedLeaser;
  use crate::replication::types::Role;
  use crate::store::{Store, StoreOptions};
  use std::sync::Arc;
  use std::time::{Duration, Instant};

  fn primary(dir: &std::path::Path) -> Store {
    let store = Store::open(
      StoreOptions::new(dir)
        .page_size(256)
        .retry_interval(Duration::from_millis(10)),
      Arc::new(FixedLeaser::configured("http://self", true)),
    )
    .expect("open");
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.role() != Role::Primary {
      assert!(Instant::now() < deadline, "never became primary");
      std::thread::sleep(Duration::from_millis(5));
    }
    store
  }

  #[test]
  fn export_then_import_reproduces_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = primary(&dir.path().join("node"));
    let db = store.create_db("source.db").expect("create");
    store.begin_write(db.id()).expect("begin");
    store.write_page(db.id(), 1, &[1; 256]).expect("write");
    store.write_page(db.id(), 2, &[2; 256]).expect("write");
    store.commit(db.id()).expect("commit");

    let target = dir.path().join("backups").join("source.img");
    let exported = export_database(&db, &target, ExportOptions::default()).expect("export");
    assert_eq!(exported.size, 512);
    assert_eq!(exported.txid, 1);
    assert!(export_database(&db, &target, ExportOptions::default()).is_err());

    let imported = import_database(&store, "copy.db", &target).expect("import");
    let copy = store.db(imported.db_id).expect("copy db");
    assert_eq!(imported.txid, 1);
    assert_eq!(copy.image().1, db.image().1);
    assert_eq!(copy.checksum(), db.checksum());
  }

  #[test]
  fn import_rejects_partial_pages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = primary(&dir.path().join("node"));
    let image = dir.path().join("torn.img");
    std::fs::write(&image, vec![0u8; 300]).expect("write image");

    assert!(matches!(
      import_database(&store, "torn.db", &image),
      Err(KiteError::InvalidPage(_))
    ));
    assert!(!store.db_by_name("torn.db").expect("created").in_write());
  }
}
