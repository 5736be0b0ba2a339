//! Replication between stores.
//!
//! The primary accepts one session per (replica, database) and streams
//! transaction log entries in commit order; replicas apply them and
//! acknowledge. `transport` defines the frames both sides speak.

pub mod primary;
pub mod progress;
pub mod replica;
pub mod transport;
pub mod types;

pub use primary::SessionHub;
pub use replica::ReplicaSessionStatus;
pub use types::{Pos, Role};
