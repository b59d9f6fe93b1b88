//! Loopback Transport
//!
//! Routes requests to handlers registered in the same process, used to run
//! several nodes side by side without sockets.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{Message, RequestHandler, Transport};
use crate::error::{Error, Result};

/// In-process transport keyed by node address
#[derive(Default)]
pub struct LoopbackTransport {
    /// Registered nodes. Weak so a node can be dropped while still listed
    nodes: RwLock<HashMap<String, Weak<dyn RequestHandler>>>,
    /// (destination, message type) of every request sent
    requests: Mutex<Vec<(String, &'static str)>>,
}

impl LoopbackTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handler` reachable at `address`
    pub fn register(&self, address: &str, handler: Arc<dyn RequestHandler>) {
        self.nodes
            .write()
            .insert(address.to_string(), Arc::downgrade(&handler));
    }

    /// Take `address` off the network
    pub fn unregister(&self, address: &str) {
        self.nodes.write().remove(address);
    }

    /// Requests sent so far
    pub fn requests(&self) -> Vec<(String, &'static str)> {
        self.requests.lock().clone()
    }

    /// Number of requests sent to `address`
    pub fn request_count(&self, address: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|(to, _)| to == address)
            .count()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        self.requests
            .lock()
            .push((address.to_string(), message.type_name()));

        let handler = self.nodes.read().get(address).and_then(Weak::upgrade);
        match handler {
            Some(handler) => Ok(handler.handle("loopback", message).await),
            None => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "no node registered".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(usize);

    #[async_trait]
    impl RequestHandler for Fixed {
        async fn handle(&self, _peer: &str, _message: Message) -> Message {
            Message::NotifyAck { accepted: self.0 }
        }
    }

    #[tokio::test]
    async fn test_routes_to_registered_node() {
        let transport = LoopbackTransport::new();
        let node: Arc<dyn RequestHandler> = Arc::new(Fixed(3));
        transport.register("n1:7660", Arc::clone(&node));

        let reply = transport.request("n1:7660", Message::Query).await.unwrap();
        assert!(matches!(reply, Message::NotifyAck { accepted: 3 }));
        assert_eq!(transport.request_count("n1:7660"), 1);

        transport.unregister("n1:7660");
        let err = transport.request("n1:7660", Message::Query).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_dropped_node_unreachable() {
        let transport = LoopbackTransport::new();
        transport.register("n2:7660", Arc::new(Fixed(0)));

        assert!(transport.request("n2:7660", Message::Query).await.is_err());
        assert_eq!(transport.requests(), vec![("n2:7660".to_string(), "Query")]);
    }
}
