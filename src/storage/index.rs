//! Fingerprint index persistence
//!
//! The index is stored as a versioned JSON document. Writes go to a
//! sibling temp file which is synced and renamed over the old index, so
//! a crash mid-write leaves the previous index intact.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintIndex;

const INDEX_VERSION: u32 = 1;

/// On-disk representation of the index
#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    /// Index version for compatibility
    version: u32,
    /// Name to fingerprint mapping
    fingerprints: FingerprintIndex,
}

/// Load the index from `path`.
///
/// A missing file yields an empty index. So does an unreadable, corrupt or
/// version-mismatched one, after a warning.
pub fn load(path: &Path) -> FingerprintIndex {
    if !path.exists() {
        info!("No existing fingerprint index at {:?}, starting empty", path);
        return FingerprintIndex::new();
    }

    match read(path) {
        Ok(persisted) if persisted.version == INDEX_VERSION => {
            info!(
                "Loaded {} fingerprints from {:?}",
                persisted.fingerprints.len(),
                path
            );
            persisted.fingerprints
        }
        Ok(persisted) => {
            warn!(
                "Fingerprint index version {} != {}, starting empty",
                persisted.version, INDEX_VERSION
            );
            FingerprintIndex::new()
        }
        Err(e) => {
            warn!("Failed to load fingerprint index {:?}: {}, starting empty", path, e);
            FingerprintIndex::new()
        }
    }
}

fn read(path: &Path) -> Result<PersistedIndex> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

/// Write `index` to `path`, replacing the previous file atomically
pub fn save(path: &Path, index: &FingerprintIndex) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Persistence(format!("index path {:?} has no parent", path)))?;
    fs::create_dir_all(dir).map_err(|e| persistence("create index dir", dir, e))?;

    let tmp_path = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    if let Err(e) = write_tmp(&tmp_path, index) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(persistence("replace index", path, e));
    }

    debug!("Saved fingerprint index with {} entries", index.len());
    Ok(())
}

fn write_tmp(tmp_path: &Path, index: &FingerprintIndex) -> Result<()> {
    let file = File::create(tmp_path).map_err(|e| persistence("create", tmp_path, e))?;
    let mut writer = BufWriter::new(file);

    let persisted = PersistedIndex {
        version: INDEX_VERSION,
        fingerprints: index.clone(),
    };
    serde_json::to_writer_pretty(&mut writer, &persisted)
        .map_err(|e| Error::Persistence(format!("serialize index: {}", e)))?;
    writer.flush().map_err(|e| persistence("flush", tmp_path, e))?;

    let file = writer
        .into_inner()
        .map_err(|e| persistence("flush", tmp_path, e.into_error()))?;
    file.sync_all().map_err(|e| persistence("sync", tmp_path, e))?;
    Ok(())
}

pub(crate) fn persistence(op: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Persistence(format!("{} {}: {}", op, path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use tempfile::tempdir;

    #[test]
    fn test_missing_index_is_empty() {
        let dir = tempdir().unwrap();
        let index = load(&dir.path().join("index").join("fingerprints.json"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").join("fingerprints.json");

        let mut index = FingerprintIndex::new();
        index.insert(Fingerprint::compute("20240101/a.txt", b"alpha", ["n1", "n2"]));
        index.insert(Fingerprint::compute("20240102/b.txt", b"beta", ["n1"]));
        save(&path, &index).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded, index);

        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_index_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fingerprints.json");
        fs::write(&path, b"{ not json").unwrap();

        assert!(load(&path).is_empty());
    }

    #[test]
    fn test_version_mismatch_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fingerprints.json");
        fs::write(&path, br#"{"version": 99, "fingerprints": {}}"#).unwrap();

        assert!(load(&path).is_empty());
    }
}
