//! NFS Replication Module
//!
//! The public face of the engine. Ties the local store, the remoting
//! client and the background replicator together and serves peer
//! requests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cluster::{RemotingClient, Role};
use crate::config::NfsConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{self, Fingerprint, FingerprintIndex};
use crate::network::{Message, RequestHandler, Transport};
use crate::replication::{AsyncReplicator, ReplicatorStats};
use crate::storage::LocalStore;

/// Cluster-wide file replication module
pub struct NfsModule {
    local: Arc<LocalStore>,
    remoting: Arc<RemotingClient>,
    replicator: AsyncReplicator,
    /// Store new files under generated names
    rename: bool,
    closed: AtomicBool,
}

impl NfsModule {
    /// Open local storage and start the replicator.
    ///
    /// The node starts as a secondary with no peers until `update` is
    /// called. Must be called from within a tokio runtime.
    pub fn new(config: &NfsConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let current_addr = config.advertise_address().to_string();

        let local = Arc::new(LocalStore::open(
            config.files_dir(),
            config.index_path(),
            current_addr.clone(),
        )?);
        let remoting = Arc::new(RemotingClient::new(
            transport,
            current_addr,
            config.request_timeout(),
        ));
        let replicator = AsyncReplicator::new(
            config.replication.clone(),
            Arc::clone(&local),
            Arc::clone(&remoting),
        );

        info!("NFS module ready for node {}", config.node.id);

        Ok(Self {
            local,
            remoting,
            replicator,
            rename: config.storage.rename,
            closed: AtomicBool::new(false),
        })
    }

    /// Apply a membership change. A new master queries the cluster.
    pub async fn update(
        &self,
        hosts: Vec<String>,
        master: Option<String>,
        current_addr: String,
        is_master: bool,
    ) -> Result<()> {
        self.ensure_open()?;

        self.local.update(&current_addr);
        self.remoting.update(hosts, master, current_addr, is_master);
        info!("Membership applied, role {}", self.remoting.role());

        if is_master {
            self.replicator.do_query().await?;
        }
        Ok(())
    }

    /// Make sure `name` is held locally, fetching it from the cluster if not
    pub async fn check_and_download(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.local.has(name) {
            return Ok(());
        }

        // The master resolves from its own cluster view
        let fp = if self.remoting.is_master() {
            self.get_fp(name)?
        } else {
            self.remoting.get_fp(name).await?
        };
        let data = self.remoting.pull(&fp).await?;
        let holders: Vec<String> = fp.hosts.iter().cloned().collect();
        let saved = self.local.save_file(name, &data, &holders)?;
        debug!("Fetched {} on demand ({} bytes)", name, saved.size);

        self.replicator.do_report(saved.into_index()).await
    }

    /// Succeeds only if `name` is held locally
    pub fn has_file(&self, name: &str) -> Result<()> {
        if self.local.has(name) {
            Ok(())
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    /// Store a new file and announce it.
    ///
    /// The name is placed in today's date partition (and replaced by a
    /// generated one when renaming is enabled). An existing file of the
    /// same name is never overwritten.
    pub async fn save_new_file(&self, name: &str, data: &[u8]) -> Result<Fingerprint> {
        self.ensure_open()?;

        let name = fingerprint::partition_name(&self.storage_name(name));
        if let Some(existing) = self.local.get_fp(&name) {
            return Err(Error::Conflict {
                name,
                local: existing.checksum,
                remote: fingerprint::checksum(data),
            });
        }

        let fp = self.local.save_file(&name, data, &[])?;
        info!("Saved new file {} ({} bytes)", fp.name, fp.size);

        self.replicator.do_report(fp.clone().into_index()).await?;
        Ok(fp)
    }

    /// Best known fingerprint for `name`, from local state only
    pub fn get_fp(&self, name: &str) -> Result<Fingerprint> {
        self.local
            .lookup(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Snapshot of every file held locally
    pub fn query(&self) -> FingerprintIndex {
        self.local.get_fps()
    }

    /// Apply fingerprints announced by a peer.
    ///
    /// Every entry is processed; the first rejected entry, if any, is
    /// returned afterwards.
    pub async fn recv_notify(&self, batch: FingerprintIndex) -> Result<()> {
        self.ensure_open()?;

        let outcome = self.local.merge(batch)?;
        self.queue_follow_ups(outcome.to_report, outcome.to_download).await?;
        self.local.persist()?;

        match outcome.rejected.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queue the work a merge produced. Downloads that could not be queued
    /// are released so a later report schedules them again.
    async fn queue_follow_ups(&self, to_report: FingerprintIndex, to_download: Vec<Fingerprint>) -> Result<()> {
        let mut pending = to_download.into_iter();
        let queued = async {
            self.replicator.do_report(to_report).await?;
            for fp in pending.by_ref() {
                let name = fp.name.clone();
                if let Err(e) = self.replicator.do_download(fp).await {
                    self.local.release_download(&name);
                    return Err(e);
                }
            }
            Ok(())
        }
        .await;

        if queued.is_err() {
            for fp in pending {
                self.local.release_download(&fp.name);
            }
        }
        queued
    }

    /// Bytes of `name`, fetched from the cluster first if necessary
    pub async fn get_file(&self, name: &str) -> Result<Vec<u8>> {
        self.check_and_download(name).await?;
        self.local.read_file(name)
    }

    /// This node's role
    pub fn role(&self) -> Role {
        self.remoting.role()
    }

    /// This node's address
    pub fn current_addr(&self) -> String {
        self.remoting.current_addr()
    }

    /// Replicator counters
    pub fn stats(&self) -> ReplicatorStats {
        self.replicator.stats()
    }

    /// Check if the module has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush local state and stop background work. Safe to call twice.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flushed = self.local.close();
        self.replicator.close().await;
        info!("NFS module closed");
        flushed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Name under which a new file is stored, before partitioning
    fn storage_name(&self, name: &str) -> String {
        if !self.rename {
            return name.to_string();
        }
        let id = uuid::Uuid::new_v4();
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}", id, ext),
            None => id.to_string(),
        }
    }

    /// Serve a pull for a locally held file
    fn serve_pull(&self, name: &str, checksum: u64) -> Result<Vec<u8>> {
        let fp = self
            .local
            .get_fp(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if fp.checksum != checksum {
            return Err(Error::Conflict {
                name: name.to_string(),
                local: fp.checksum,
                remote: checksum,
            });
        }
        self.local.read_file(name)
    }
}

#[async_trait]
impl RequestHandler for NfsModule {
    async fn handle(&self, peer: &str, message: Message) -> Message {
        if self.is_closed() {
            return Message::from_error(&Error::ShuttingDown);
        }

        match message {
            Message::GetFingerprint { name } => match self.get_fp(&name) {
                Ok(fingerprint) => Message::FingerprintFound { fingerprint },
                Err(e) => Message::from_error(&e),
            },
            Message::Pull { name, checksum } => match self.serve_pull(&name, checksum) {
                Ok(data) => Message::file_data(&name, &data),
                Err(e) => {
                    debug!("Pull of {} by {} refused: {}", name, peer, e);
                    Message::from_error(&e)
                }
            },
            Message::Notify { from, fingerprints } => {
                let accepted = fingerprints.len();
                debug!("Notify of {} fingerprints from {}", accepted, from);
                match self.recv_notify(fingerprints).await {
                    Ok(()) => Message::NotifyAck { accepted },
                    Err(e) => {
                        warn!("Notify from {} partly rejected: {}", from, e);
                        Message::from_error(&e)
                    }
                }
            }
            Message::Query => Message::QueryResponse {
                fingerprints: self.query(),
            },
            other => {
                warn!("Unexpected {} from {}", other.type_name(), peer);
                other.unexpected()
            }
        }
    }
}
