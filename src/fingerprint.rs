//! File Fingerprints
//!
//! A fingerprint identifies one replicated file: its partitioned name,
//! a CRC-64 over the content, the content size, and every node address
//! known to hold a copy.

use std::collections::{BTreeMap, BTreeSet};

use crc::{Crc, CRC_64_GO_ISO};
use serde::{Deserialize, Serialize};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Compute the content checksum used by fingerprints
pub fn checksum(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Prefix a file name with today's date partition (`YYYYMMDD/<name>`)
pub fn partition_name(name: &str) -> String {
    format!("{}/{}", chrono::Local::now().format("%Y%m%d"), name)
}

/// Identity record for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Partitioned file name
    pub name: String,
    /// CRC-64 of the content
    pub checksum: u64,
    /// Content length in bytes
    pub size: u64,
    /// Node addresses holding a copy
    pub hosts: BTreeSet<String>,
}

impl Fingerprint {
    /// Fingerprint `data` under `name`, held by `hosts`
    pub fn compute<I, S>(name: &str, data: &[u8], hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            checksum: checksum(data),
            size: data.len() as u64,
            hosts: hosts
                .into_iter()
                .map(Into::into)
                .filter(|h: &String| !h.is_empty())
                .collect(),
        }
    }

    /// Whether `other` describes the same content
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.checksum == other.checksum && self.size == other.size
    }

    /// Whether `data` matches this fingerprint
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size && checksum(data) == self.checksum
    }

    /// Union `hosts` into this record, returning true if it grew
    pub fn merge_hosts<'a, I>(&mut self, hosts: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let before = self.hosts.len();
        for host in hosts {
            if !host.is_empty() && !self.hosts.contains(host) {
                self.hosts.insert(host.clone());
            }
        }
        self.hosts.len() > before
    }

    /// Whether `host` is a known holder
    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    /// Wrap this fingerprint in a single-entry index
    pub fn into_index(self) -> FingerprintIndex {
        let mut index = FingerprintIndex::new();
        index.insert(self);
        index
    }
}

/// Mapping from file name to fingerprint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintIndex {
    entries: BTreeMap<String, Fingerprint>,
}

impl FingerprintIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a fingerprint by name
    pub fn get(&self, name: &str) -> Option<&Fingerprint> {
        self.entries.get(name)
    }

    /// Get a mutable fingerprint by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Fingerprint> {
        self.entries.get_mut(name)
    }

    /// Check if a name is present
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Insert or replace a fingerprint, keyed by its name
    pub fn insert(&mut self, fp: Fingerprint) -> Option<Fingerprint> {
        self.entries.insert(fp.name.clone(), fp)
    }

    /// Remove a fingerprint
    pub fn remove(&mut self, name: &str) -> Option<Fingerprint> {
        self.entries.remove(name)
    }

    /// Iterate over all fingerprints in name order
    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.entries.values()
    }

    /// Get all names
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union another index into this one.
    ///
    /// Entries with matching content get their host sets unioned; entries
    /// whose checksum disagrees with ours are left untouched and returned.
    pub fn absorb(&mut self, other: FingerprintIndex) -> Vec<Fingerprint> {
        let mut rejected = Vec::new();
        for fp in other {
            match self.entries.get_mut(&fp.name) {
                Some(existing) if existing.same_content(&fp) => {
                    existing.merge_hosts(fp.hosts.iter());
                }
                Some(_) => rejected.push(fp),
                None => {
                    self.entries.insert(fp.name.clone(), fp);
                }
            }
        }
        rejected
    }
}

impl IntoIterator for FingerprintIndex {
    type Item = Fingerprint;
    type IntoIter = std::collections::btree_map::IntoValues<String, Fingerprint>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

impl FromIterator<Fingerprint> for FingerprintIndex {
    fn from_iter<T: IntoIterator<Item = Fingerprint>>(iter: T) -> Self {
        let mut index = FingerprintIndex::new();
        for fp in iter {
            index.insert(fp);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        // CRC-64/GO-ISO check value
        assert_eq!(checksum(b"123456789"), 0xb909_56c7_75a4_1001);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn test_partition_name() {
        let name = partition_name("report.pdf");
        let (day, rest) = name.split_once('/').unwrap();
        assert_eq!(rest, "report.pdf");
        assert_eq!(day.len(), 8);
        assert!(day.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_compute_and_match() {
        let fp = Fingerprint::compute("20240101/a.txt", b"hello", ["10.0.0.1:7660"]);
        assert_eq!(fp.size, 5);
        assert!(fp.has_host("10.0.0.1:7660"));
        assert!(fp.matches(b"hello"));
        assert!(!fp.matches(b"hellO"));
        assert!(!fp.matches(b"hello!"));
    }

    #[test]
    fn test_merge_hosts_reports_growth() {
        let mut fp = Fingerprint::compute("a", b"x", ["n1"]);
        let incoming: Vec<String> = vec!["n1".into(), "n2".into()];

        assert!(fp.merge_hosts(incoming.iter()));
        assert!(!fp.merge_hosts(incoming.iter()));
        assert_eq!(fp.hosts.len(), 2);
    }

    #[test]
    fn test_absorb_rejects_conflicts() {
        let mut index = FingerprintIndex::new();
        index.insert(Fingerprint::compute("a", b"one", ["n1"]));

        let mut other = FingerprintIndex::new();
        other.insert(Fingerprint::compute("a", b"two", ["n2"]));
        other.insert(Fingerprint::compute("b", b"three", ["n2"]));

        let rejected = index.absorb(other);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].name, "a");
        assert!(index.get("a").unwrap().has_host("n1"));
        assert!(!index.get("a").unwrap().has_host("n2"));
        assert!(index.contains("b"));
    }
}
