//! Replication Module
//!
//! Background propagation of fingerprints and file bytes between nodes.
//! Foreground operations enqueue tasks and return; a fixed pool of worker
//! tasks executes them with bounded retries.

mod replicator;

pub use replicator::{AsyncReplicator, ReplicatorStats};

use crate::fingerprint::{Fingerprint, FingerprintIndex};

/// Unit of background replication work
#[derive(Debug, Clone)]
pub enum ReplicationTask {
    /// Announce fingerprints to the cluster
    Report(FingerprintIndex),
    /// Fetch a file this node does not hold
    Download(Fingerprint),
    /// Collect every peer's inventory (master only)
    QueryAll,
}

impl ReplicationTask {
    /// Get the task kind (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationTask::Report(_) => "report",
            ReplicationTask::Download(_) => "download",
            ReplicationTask::QueryAll => "query-all",
        }
    }
}

impl std::fmt::Display for ReplicationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationTask::Report(batch) => write!(f, "report of {} fingerprints", batch.len()),
            ReplicationTask::Download(fp) => write!(f, "download of {}", fp.name),
            ReplicationTask::QueryAll => write!(f, "query-all"),
        }
    }
}
