//! Remoting Client
//!
//! Talks to the rest of the cluster on behalf of this node: asks the
//! master for fingerprints, pulls file bytes from holders, announces new
//! fingerprints and, on the master, collects every peer's inventory.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::membership::{Membership, Role};
use crate::error::{Error, Result};
use crate::fingerprint::{checksum, Fingerprint, FingerprintIndex};
use crate::network::protocol::{decompress_file_data, remote_error};
use crate::network::{Message, Transport};

/// Client for cluster-wide fingerprint and file operations
pub struct RemotingClient {
    transport: Arc<dyn Transport>,
    membership: RwLock<Arc<Membership>>,
    request_timeout: Duration,
}

impl RemotingClient {
    /// Create a client that is not yet part of any cluster
    pub fn new(transport: Arc<dyn Transport>, current_addr: String, request_timeout: Duration) -> Self {
        Self {
            transport,
            membership: RwLock::new(Arc::new(Membership::standalone(current_addr))),
            request_timeout,
        }
    }

    /// Replace the membership snapshot. Calls already running keep the
    /// snapshot they started with.
    pub fn update(&self, hosts: Vec<String>, master: Option<String>, current_addr: String, is_master: bool) {
        let next = Membership::new(hosts, master, current_addr, is_master);
        debug!(
            "Membership updated: {} hosts, master {:?}, role {}",
            next.hosts.len(),
            next.master,
            next.role
        );
        *self.membership.write() = Arc::new(next);
    }

    /// Current membership snapshot
    pub fn membership(&self) -> Arc<Membership> {
        Arc::clone(&self.membership.read())
    }

    /// Check if this node is the master
    pub fn is_master(&self) -> bool {
        self.membership.read().is_master()
    }

    /// This node's role
    pub fn role(&self) -> Role {
        self.membership.read().role
    }

    /// This node's address
    pub fn current_addr(&self) -> String {
        self.membership.read().current_addr.clone()
    }

    /// Ask the master for the fingerprint of `name`
    pub async fn get_fp(&self, name: &str) -> Result<Fingerprint> {
        let membership = self.membership();
        if membership.is_master() {
            // Nobody knows more than the master
            return Err(Error::NotFound(name.to_string()));
        }
        let master = membership.master_address()?;

        let reply = self
            .call(master, Message::GetFingerprint { name: name.to_string() })
            .await?;
        match reply {
            Message::FingerprintFound { fingerprint } if fingerprint.name == name => Ok(fingerprint),
            other => Err(unexpected_reply(master, &other)),
        }
    }

    /// Fetch the bytes described by `fp` from one of its holders.
    ///
    /// Holders are tried in random order, this node excluded. The first
    /// reply whose size and checksum match wins.
    pub async fn pull(&self, fp: &Fingerprint) -> Result<Vec<u8>> {
        let membership = self.membership();
        let mut holders: Vec<&String> = fp
            .hosts
            .iter()
            .filter(|h| **h != membership.current_addr)
            .collect();
        if holders.is_empty() {
            return Err(Error::Transport(format!("no remote holder for {}", fp.name)));
        }
        holders.shuffle(&mut rand::thread_rng());

        let mut failures = Vec::with_capacity(holders.len());
        for host in holders {
            match self.pull_from(host, fp).await {
                Ok(data) => {
                    debug!("Pulled {} ({} bytes) from {}", fp.name, data.len(), host);
                    return Ok(data);
                }
                Err(e) => {
                    debug!("Pull of {} from {} failed: {}", fp.name, host, e);
                    failures.push(format!("{}: {}", host, e));
                }
            }
        }

        Err(Error::Transport(format!(
            "pull of {} failed from every holder ({})",
            fp.name,
            failures.join("; ")
        )))
    }

    /// Announce a batch of fingerprints.
    ///
    /// The master fans out to every peer, a secondary tells the master.
    pub async fn report(&self, batch: &FingerprintIndex) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let membership = self.membership();
        let notify = Message::Notify {
            from: membership.current_addr.clone(),
            fingerprints: batch.clone(),
        };

        if !membership.is_master() {
            let master = membership.master_address()?;
            return match self.call(master, notify).await? {
                Message::NotifyAck { .. } => Ok(()),
                other => Err(unexpected_reply(master, &other)),
            };
        }

        let peers: Vec<&String> = membership.peers().collect();
        let replies = join_all(peers.iter().map(|peer| self.call(peer, notify.clone()))).await;

        let mut failures = Vec::new();
        for (peer, reply) in peers.iter().zip(replies) {
            let result = match reply {
                Ok(Message::NotifyAck { .. }) => Ok(()),
                Ok(other) => Err(unexpected_reply(peer, &other)),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Report of {} fingerprints to {} failed: {}", batch.len(), peer, e);
                failures.push((peer.to_string(), e));
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        let retry = failures.iter().any(|(_, e)| e.is_retryable());
        let summary = failures
            .iter()
            .map(|(peer, e)| format!("{}: {}", peer, e))
            .collect::<Vec<_>>()
            .join("; ");
        if retry {
            Err(Error::Transport(format!("report failed for {} peers ({})", failures.len(), summary)))
        } else {
            Err(Error::Rejected {
                host: failures[0].0.clone(),
                message: summary,
            })
        }
    }

    /// Collect the inventory of every peer. Master only.
    ///
    /// Unreachable peers are skipped; the call fails only when no peer
    /// answered.
    pub async fn query_all(&self) -> Result<FingerprintIndex> {
        let membership = self.membership();
        if !membership.is_master() {
            return Err(Error::NotMaster(
                membership.master.clone().unwrap_or_else(|| "none".to_string()),
            ));
        }

        let peers: Vec<&String> = membership.peers().collect();
        if peers.is_empty() {
            return Ok(FingerprintIndex::new());
        }
        let replies = join_all(peers.iter().map(|peer| self.call(peer, Message::Query))).await;

        let mut merged = FingerprintIndex::new();
        let mut answered = 0usize;
        let mut last_error = None;
        for (peer, reply) in peers.iter().zip(replies) {
            match reply {
                Ok(Message::QueryResponse { fingerprints }) => {
                    answered += 1;
                    for fp in merged.absorb(fingerprints) {
                        warn!(
                            "{} reports {} with checksum {:016x}, keeping earlier answer",
                            peer, fp.name, fp.checksum
                        );
                    }
                }
                Ok(other) => {
                    warn!("Query to {} failed: {}", peer, unexpected_reply(peer, &other));
                }
                Err(e) => {
                    warn!("Query to {} failed: {}", peer, e);
                    last_error = Some(e);
                }
            }
        }

        if answered == 0 {
            return Err(Error::Transport(format!(
                "no peer answered query ({} tried, last error: {})",
                peers.len(),
                last_error.map(|e| e.to_string()).unwrap_or_else(|| "bad reply".to_string())
            )));
        }
        debug!("Query collected {} fingerprints from {} peers", merged.len(), answered);
        Ok(merged)
    }

    /// Fetch and verify a file from one holder
    async fn pull_from(&self, host: &str, fp: &Fingerprint) -> Result<Vec<u8>> {
        let reply = self
            .call(
                host,
                Message::Pull {
                    name: fp.name.clone(),
                    checksum: fp.checksum,
                },
            )
            .await?;

        let data = match reply {
            Message::FileData { name, data } if name == fp.name => decompress_file_data(&data, fp.size)?,
            other => return Err(unexpected_reply(host, &other)),
        };

        let actual = checksum(&data);
        if data.len() as u64 != fp.size || actual != fp.checksum {
            return Err(Error::ChecksumMismatch {
                name: fp.name.clone(),
                host: host.to_string(),
                expected: fp.checksum,
                actual,
            });
        }
        Ok(data)
    }

    /// Send one request with the request timeout, mapping error replies
    async fn call(&self, address: &str, message: Message) -> Result<Message> {
        let reply = timeout(self.request_timeout, self.transport.request(address, message))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.to_string()))??;

        match reply {
            Message::Error { code, message } => Err(remote_error(address, code, message)),
            reply => Ok(reply),
        }
    }
}

fn unexpected_reply(host: &str, reply: &Message) -> Error {
    Error::Protocol(format!("unexpected {} reply from {}", reply.type_name(), host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LoopbackTransport, RequestHandler};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted peer holding a fixed set of files
    #[derive(Default)]
    struct Peer {
        files: HashMap<String, Vec<u8>>,
        index: FingerprintIndex,
        corrupt: bool,
        notified: Mutex<Vec<FingerprintIndex>>,
    }

    impl Peer {
        fn holding(addr: &str, files: &[(&str, &[u8])]) -> Self {
            let mut peer = Peer::default();
            for (name, data) in files {
                peer.files.insert(name.to_string(), data.to_vec());
                peer.index.insert(Fingerprint::compute(name, data, [addr]));
            }
            peer
        }
    }

    #[async_trait]
    impl RequestHandler for Peer {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::GetFingerprint { name } => match self.index.get(&name) {
                    Some(fp) => Message::FingerprintFound { fingerprint: fp.clone() },
                    None => Message::from_error(&Error::NotFound(name)),
                },
                Message::Pull { name, .. } => match self.files.get(&name) {
                    Some(data) if self.corrupt => Message::file_data(&name, &data[1..]),
                    Some(data) => Message::file_data(&name, data),
                    None => Message::from_error(&Error::NotFound(name)),
                },
                Message::Notify { fingerprints, .. } => {
                    let accepted = fingerprints.len();
                    self.notified.lock().push(fingerprints);
                    Message::NotifyAck { accepted }
                }
                Message::Query => Message::QueryResponse {
                    fingerprints: self.index.clone(),
                },
                other => other.unexpected(),
            }
        }
    }

    fn client(transport: &Arc<LoopbackTransport>, me: &str) -> RemotingClient {
        let transport: Arc<dyn Transport> = transport.clone();
        RemotingClient::new(transport, me.to_string(), Duration::from_secs(1))
    }

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|h| h.to_string()).collect()
    }

    #[tokio::test]
    async fn test_get_fp_from_master() {
        let transport = Arc::new(LoopbackTransport::new());
        let master = Arc::new(Peer::holding("b:1", &[("20240101/a.txt", b"hello")]));
        transport.register("m:1", master.clone());

        let remoting = client(&transport, "a:1");
        assert!(matches!(remoting.get_fp("20240101/a.txt").await, Err(Error::NoMaster)));

        remoting.update(hosts(&["a:1", "b:1", "m:1"]), Some("m:1".into()), "a:1".into(), false);
        let fp = remoting.get_fp("20240101/a.txt").await.unwrap();
        assert!(fp.has_host("b:1"));

        let err = remoting.get_fp("20240101/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_master_get_fp_is_local() {
        let transport = Arc::new(LoopbackTransport::new());
        let remoting = client(&transport, "m:1");
        remoting.update(hosts(&["a:1", "m:1"]), None, "m:1".into(), true);

        assert!(remoting.get_fp("20240101/a.txt").await.unwrap_err().is_not_found());
        assert!(transport.requests().is_empty());
        assert_eq!(remoting.role(), Role::Master);
    }

    #[tokio::test]
    async fn test_pull_skips_bad_holders() {
        let transport = Arc::new(LoopbackTransport::new());
        let data: &[u8] = b"replicated bytes";
        let good = Arc::new(Peer::holding("b:1", &[("20240101/f", data)]));
        let mut bad = Peer::holding("c:1", &[("20240101/f", data)]);
        bad.corrupt = true;
        let bad = Arc::new(bad);
        transport.register("b:1", good.clone());
        transport.register("c:1", bad.clone());

        let remoting = client(&transport, "a:1");
        let fp = Fingerprint::compute("20240101/f", data, ["a:1", "b:1", "c:1", "d:1"]);
        for _ in 0..5 {
            assert_eq!(remoting.pull(&fp).await.unwrap(), data);
        }
        assert_eq!(transport.request_count("a:1"), 0);
    }

    #[tokio::test]
    async fn test_pull_all_holders_fail() {
        let transport = Arc::new(LoopbackTransport::new());
        let mut bad = Peer::holding("c:1", &[("20240101/f", b"abc")]);
        bad.corrupt = true;
        let bad: Arc<dyn RequestHandler> = Arc::new(bad);
        transport.register("c:1", bad.clone());

        let remoting = client(&transport, "a:1");
        let fp = Fingerprint::compute("20240101/f", b"abc", ["c:1", "d:1"]);
        let err = remoting.pull(&fp).await.unwrap_err();
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("c:1") && msg.contains("d:1"), "{}", msg);

        let only_self = Fingerprint::compute("20240101/f", b"abc", ["a:1"]);
        assert!(remoting.pull(&only_self).await.is_err());
    }

    #[tokio::test]
    async fn test_master_report_fans_out() {
        let transport = Arc::new(LoopbackTransport::new());
        let a = Arc::new(Peer::default());
        let b = Arc::new(Peer::default());
        transport.register("a:1", a.clone());
        transport.register("b:1", b.clone());

        let remoting = client(&transport, "m:1");
        remoting.update(hosts(&["a:1", "b:1", "m:1"]), None, "m:1".into(), true);

        let batch = Fingerprint::compute("20240101/x", b"x", ["m:1"]).into_index();
        remoting.report(&batch).await.unwrap();
        assert_eq!(a.notified.lock().len(), 1);
        assert_eq!(b.notified.lock().len(), 1);
        assert_eq!(transport.request_count("m:1"), 0);

        // One peer down fails the whole report
        transport.unregister("b:1");
        let err = remoting.report(&batch).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(a.notified.lock().len(), 2);

        // Empty batches never hit the network
        let before = transport.requests().len();
        remoting.report(&FingerprintIndex::new()).await.unwrap();
        assert_eq!(transport.requests().len(), before);
    }

    #[tokio::test]
    async fn test_secondary_reports_to_master() {
        let transport = Arc::new(LoopbackTransport::new());
        let master = Arc::new(Peer::default());
        transport.register("m:1", master.clone());

        let remoting = client(&transport, "a:1");
        remoting.update(hosts(&["a:1", "b:1", "m:1"]), Some("m:1".into()), "a:1".into(), false);

        let batch = Fingerprint::compute("20240101/x", b"x", ["a:1"]).into_index();
        remoting.report(&batch).await.unwrap();
        assert_eq!(master.notified.lock()[0], batch);
        assert_eq!(transport.request_count("b:1"), 0);
    }

    #[tokio::test]
    async fn test_query_all_unions_answers() {
        let transport = Arc::new(LoopbackTransport::new());
        let a: Arc<dyn RequestHandler> =
            Arc::new(Peer::holding("a:1", &[("20240101/x", b"x"), ("20240101/y", b"y")]));
        transport.register("a:1", a.clone());
        let b: Arc<dyn RequestHandler> = Arc::new(Peer::holding("b:1", &[("20240101/x", b"x")]));
        transport.register("b:1", b.clone());

        let remoting = client(&transport, "m:1");
        assert!(matches!(remoting.query_all().await, Err(Error::NotMaster(_))));

        remoting.update(hosts(&["a:1", "b:1", "c:1", "m:1"]), None, "m:1".into(), true);
        let merged = remoting.query_all().await.unwrap();
        assert_eq!(merged.len(), 2);
        let x = merged.get("20240101/x").unwrap();
        assert!(x.has_host("a:1") && x.has_host("b:1"));

        transport.unregister("a:1");
        transport.unregister("b:1");
        assert!(remoting.query_all().await.is_err());
    }
}
