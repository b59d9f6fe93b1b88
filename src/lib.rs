//! WolfNFS - Cluster-wide File Replication Engine
//!
//! Keeps a set of immutable files replicated across the nodes of a cluster.
//! Every file is identified by a fingerprint (name, CRC-64 checksum, size
//! and the set of nodes holding a copy). Nodes announce what they hold,
//! fetch what they are missing on demand or in the background, and never
//! overwrite a file with different content.
//!
//! # Architecture
//!
//! One node is the master. Secondaries report new fingerprints to it; the
//! master fans reports out to every other node and periodically collects
//! every node's inventory. File bytes always travel directly between the
//! node that wants them and a node that holds them.
//!
//! # Features
//!
//! - Date-partitioned file names with optional generated names
//! - Conflict detection on checksum mismatch
//! - Crash-safe persisted fingerprint index
//! - Bounded background replication queue with exponential backoff
//! - Compressed, checksummed peer protocol over TCP

pub mod cluster;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod module;
pub mod network;
pub mod replication;
pub mod storage;

pub use config::NfsConfig;
pub use error::{Error, Result};
pub use module::NfsModule;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::Role;
    pub use crate::config::NfsConfig;
    pub use crate::error::{Error, Result};
    pub use crate::fingerprint::{Fingerprint, FingerprintIndex};
    pub use crate::module::NfsModule;
    pub use crate::network::{NetworkClient, NetworkServer, Transport};
}
