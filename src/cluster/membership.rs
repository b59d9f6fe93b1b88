//! Cluster Membership
//!
//! Immutable view of the cluster as last reported by the membership
//! provider. A new snapshot replaces the old one wholesale.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Role of this node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Authoritative fingerprint coordinator
    Master,
    /// Regular member
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "MASTER"),
            Role::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// Snapshot of cluster membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Every known node address, this node included
    pub hosts: Vec<String>,
    /// Master address, if one is known
    pub master: Option<String>,
    /// This node's address
    pub current_addr: String,
    /// This node's role
    pub role: Role,
}

impl Membership {
    /// Build a snapshot. A master node is its own master.
    pub fn new(hosts: Vec<String>, master: Option<String>, current_addr: String, is_master: bool) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(hosts.len());
        for host in hosts {
            if !host.is_empty() && !unique.contains(&host) {
                unique.push(host);
            }
        }

        let (role, master) = if is_master {
            (Role::Master, Some(current_addr.clone()))
        } else {
            (Role::Secondary, master.filter(|m| !m.is_empty()))
        };

        Self {
            hosts: unique,
            master,
            current_addr,
            role,
        }
    }

    /// Membership of a node that has not been told about any cluster yet
    pub fn standalone(current_addr: String) -> Self {
        Self::new(Vec::new(), None, current_addr, false)
    }

    /// Check if this node is the master
    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Master address or `NoMaster`
    pub fn master_address(&self) -> Result<&str> {
        self.master.as_deref().ok_or(Error::NoMaster)
    }

    /// Every host except this node
    pub fn peers(&self) -> impl Iterator<Item = &String> {
        self.hosts.iter().filter(move |h| **h != self.current_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["a:1".into(), "b:1".into(), "m:1".into(), "b:1".into()]
    }

    #[test]
    fn test_master_is_own_master() {
        let m = Membership::new(hosts(), Some("b:1".into()), "m:1".into(), true);
        assert!(m.is_master());
        assert_eq!(m.master_address().unwrap(), "m:1");
        assert_eq!(m.peers().cloned().collect::<Vec<_>>(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_secondary_without_master() {
        let m = Membership::new(hosts(), None, "a:1".into(), false);
        assert_eq!(m.role, Role::Secondary);
        assert!(matches!(m.master_address(), Err(Error::NoMaster)));

        let m = Membership::standalone("a:1".into());
        assert_eq!(m.peers().count(), 0);
    }
}
