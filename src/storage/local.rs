//! Local file store
//!
//! Owns the file bytes on this node's disk and the authoritative
//! fingerprint index describing them. Alongside the index it keeps an
//! in-memory view of files peers have reported that this node does not
//! hold yet, so repeated reports do not schedule repeated downloads.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::index::{self, persistence};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintIndex};

/// Follow-up work produced by merging a remote fingerprint batch
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Local records whose host set grew and should be re-announced
    pub to_report: FingerprintIndex,
    /// Files this node should fetch
    pub to_download: Vec<Fingerprint>,
    /// Per-entry failures; the rest of the batch was still applied
    pub rejected: Vec<Error>,
}

/// Mutable store state, guarded by a single lock
#[derive(Default)]
struct StoreState {
    /// Files held on this node
    fps: FingerprintIndex,
    /// Reported by peers, not held here
    cluster: HashMap<String, Fingerprint>,
    /// Names with a download in flight
    scheduled: HashSet<String>,
}

/// Local file and fingerprint store
pub struct LocalStore {
    /// Root directory for file bytes
    files_dir: PathBuf,
    /// Path of the persisted index
    index_path: PathBuf,
    /// This node's advertised address
    current_addr: RwLock<String>,
    /// Index and cluster view
    state: RwLock<StoreState>,
    /// Serializes saves so the conflict check and insert cannot interleave
    save_lock: Mutex<()>,
    /// Serializes index flushes
    persist_lock: Mutex<()>,
    /// Set once closed
    closed: AtomicBool,
}

impl LocalStore {
    /// Open the store, loading any persisted index.
    ///
    /// Index entries whose file is missing from disk are dropped.
    pub fn open(files_dir: PathBuf, index_path: PathBuf, current_addr: String) -> Result<Self> {
        fs::create_dir_all(&files_dir).map_err(|e| persistence("create", &files_dir, e))?;

        let loaded = index::load(&index_path);
        let total = loaded.len();
        let fps: FingerprintIndex = loaded
            .into_iter()
            .filter(|fp| {
                let present = safe_name(&fp.name) && files_dir.join(&fp.name).is_file();
                if !present {
                    warn!("Dropping index entry {}: file missing from disk", fp.name);
                }
                present
            })
            .collect();

        info!(
            "Local store opened at {:?} with {} files ({} stale entries dropped)",
            files_dir,
            fps.len(),
            total - fps.len()
        );

        Ok(Self {
            files_dir,
            index_path,
            current_addr: RwLock::new(current_addr),
            state: RwLock::new(StoreState {
                fps,
                ..StoreState::default()
            }),
            save_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Check if a file is held locally (index only, no disk I/O)
    pub fn has(&self, name: &str) -> bool {
        self.state.read().fps.contains(name)
    }

    /// Get the local fingerprint for a file
    pub fn get_fp(&self, name: &str) -> Option<Fingerprint> {
        self.state.read().fps.get(name).cloned()
    }

    /// Get the best known fingerprint: local index first, then what peers
    /// have reported
    pub fn lookup(&self, name: &str) -> Option<Fingerprint> {
        let state = self.state.read();
        state
            .fps
            .get(name)
            .or_else(|| state.cluster.get(name))
            .cloned()
    }

    /// Snapshot of the local index
    pub fn get_fps(&self) -> FingerprintIndex {
        self.state.read().fps.clone()
    }

    /// This node's address
    pub fn current_addr(&self) -> String {
        self.current_addr.read().clone()
    }

    /// Rebind this node's address
    pub fn update(&self, current_addr: &str) {
        let mut addr = self.current_addr.write();
        if *addr != current_addr {
            info!("Local address changed from {:?} to {}", *addr, current_addr);
            *addr = current_addr.to_string();
        }
    }

    /// Write `data` under `name` and record it in the index.
    ///
    /// The host set is this node plus `extra_hosts`. Saving identical
    /// content again only unions hosts; different content is a conflict.
    /// The index is only touched after the bytes are on disk.
    pub fn save_file(&self, name: &str, data: &[u8], extra_hosts: &[String]) -> Result<Fingerprint> {
        self.ensure_open()?;
        validate_name(name)?;

        let hosts = std::iter::once(self.current_addr()).chain(extra_hosts.iter().cloned());
        let mut fp = Fingerprint::compute(name, data, hosts);

        let _guard = self.save_lock.lock();

        let existing = {
            let state = self.state.read();
            let existing = state.fps.get(name).or_else(|| state.cluster.get(name));
            if let Some(existing) = existing {
                if !existing.same_content(&fp) {
                    return Err(Error::Conflict {
                        name: name.to_string(),
                        local: existing.checksum,
                        remote: fp.checksum,
                    });
                }
            }
            state.fps.contains(name)
        };

        if existing {
            let (merged, grew) = {
                let mut state = self.state.write();
                match state.fps.get_mut(name) {
                    Some(entry) => {
                        let grew = entry.merge_hosts(fp.hosts.iter());
                        (entry.clone(), grew)
                    }
                    None => return Err(Error::Internal(format!("{} vanished during save", name))),
                }
            };
            if grew {
                self.persist()?;
            }
            return Ok(merged);
        }

        self.write_file(name, data)?;

        {
            let mut state = self.state.write();
            if let Some(known) = state.cluster.remove(name) {
                fp.merge_hosts(known.hosts.iter());
            }
            state.scheduled.remove(name);
            state.fps.insert(fp.clone());
        }

        self.persist()?;
        debug!("Saved {} ({} bytes, crc64 {:016x})", name, fp.size, fp.checksum);
        Ok(fp)
    }

    /// Read the bytes of a locally held file
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        if !self.has(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        let path = self.files_dir.join(name);
        fs::read(&path).map_err(|e| persistence("read", &path, e))
    }

    /// Reconcile a remote fingerprint batch against local state.
    ///
    /// The whole batch is applied under one write lock. A bad entry is
    /// recorded in `rejected` and does not stop the rest. Merging the same
    /// batch twice yields no further work.
    pub fn merge(&self, remote: FingerprintIndex) -> Result<MergeOutcome> {
        self.ensure_open()?;

        let me = self.current_addr();
        let mut outcome = MergeOutcome::default();
        let mut guard = self.state.write();
        let state = &mut *guard;

        for rfp in remote {
            if let Err(e) = validate_name(&rfp.name) {
                outcome.rejected.push(e);
                continue;
            }

            if let Some(local) = state.fps.get_mut(&rfp.name) {
                if !local.same_content(&rfp) {
                    outcome.rejected.push(Error::Conflict {
                        name: rfp.name.clone(),
                        local: local.checksum,
                        remote: rfp.checksum,
                    });
                    continue;
                }
                if local.merge_hosts(rfp.hosts.iter()) {
                    outcome.to_report.insert(local.clone());
                }
                continue;
            }

            let known = state
                .cluster
                .entry(rfp.name.clone())
                .or_insert_with(|| Fingerprint {
                    hosts: Default::default(),
                    ..rfp.clone()
                });
            if !known.same_content(&rfp) {
                outcome.rejected.push(Error::Conflict {
                    name: rfp.name.clone(),
                    local: known.checksum,
                    remote: rfp.checksum,
                });
                continue;
            }
            known.merge_hosts(rfp.hosts.iter());

            let has_source = known.hosts.iter().any(|h| *h != me);
            if has_source && !state.scheduled.contains(&rfp.name) {
                state.scheduled.insert(rfp.name.clone());
                outcome.to_download.push(known.clone());
            }
        }

        if !outcome.rejected.is_empty() {
            warn!("Merge rejected {} entries", outcome.rejected.len());
        }
        debug!(
            "Merge produced {} reports, {} downloads",
            outcome.to_report.len(),
            outcome.to_download.len()
        );
        Ok(outcome)
    }

    /// Forget that a download was scheduled, so a later report schedules
    /// it again
    pub fn release_download(&self, name: &str) {
        self.state.write().scheduled.remove(name);
    }

    /// Write `index` to the persistence file
    pub fn fp_write(&self, index: &FingerprintIndex) -> Result<()> {
        let _guard = self.persist_lock.lock();
        index::save(&self.index_path, index)
    }

    /// Flush the current index to disk.
    ///
    /// Readers only wait for the snapshot clone, not for the disk write.
    pub fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        let snapshot = self.state.read().fps.clone();
        index::save(&self.index_path, &snapshot)
    }

    /// Flush the index and refuse further mutations
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.persist()?;
        info!("Local store closed");
        Ok(())
    }

    /// Check if the store has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Write bytes to a temp file next to the target and rename into place
    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.files_dir.join(name);
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidName(name.to_string()))?;
        fs::create_dir_all(parent).map_err(|e| persistence("create", parent, e))?;

        let tmp_path = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let result = File::create(&tmp_path)
            .and_then(|mut file| file.write_all(data))
            .and_then(|_| fs::rename(&tmp_path, &path));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(persistence("write", &path, e));
        }
        Ok(())
    }
}

/// Check that `name` is a relative path that stays inside the store
fn safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\\')
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn validate_name(name: &str) -> Result<()> {
    if safe_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}
