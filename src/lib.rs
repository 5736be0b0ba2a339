//! KiteFS: replicated single-writer database files.
//!
//! One node holds the primary lease and captures every commit into a
//! per-database transaction log; replicas stream that log over TCP and apply
//! it in order. See `Store` for the entry point.

pub mod backup;
pub mod checksum;
pub mod config;
pub mod db;
pub mod error;
pub mod lease;
pub mod ltx;
pub mod replication;
pub mod retention;
pub mod store;
pub mod txlog;

pub use config::Config;
pub use db::{Database, DatabaseMeta};
pub use error::{KiteError, Result};
pub use lease::{Lease, Leaser};
pub use replication::{Pos, Role};
pub use store::{NodeStatus, Store, StoreOptions};
