//! Network Client
//!
//! TCP client for connecting to other nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_message, write_message, Message, Transport};
use crate::error::{Error, Result};

/// Connection pool entry
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
    /// Set while a request is on the wire; still set after a cancelled
    /// request, meaning the stream may hold an unread reply
    in_flight: bool,
}

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: Arc<RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, self.send_inner(address, &message)).await;

        match result {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: &Message) -> Result<Message> {
        // Try to reuse a pooled connection
        if let Some(entry) = self.get_connection(address).await {
            let mut entry = entry.lock().await;

            if !entry.in_flight {
                entry.in_flight = true;
                match exchange(&mut entry.stream, message).await {
                    Ok(response) => {
                        entry.in_flight = false;
                        entry.last_used = Instant::now();
                        return Ok(response);
                    }
                    Err(e) => {
                        tracing::debug!("Pooled connection to {} failed: {}", address, e);
                    }
                }
            }

            // Dead or desynchronized, reconnect
            drop(entry);
            self.remove_connection(address).await;
        }

        // Create new connection
        let mut stream = self.connect(address).await?;
        let response = exchange(&mut stream, message).await?;
        self.store_connection(address.to_string(), stream).await;

        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Store a connection in the pool
    async fn store_connection(&self, address: String, stream: TcpStream) {
        let mut pool = self.pool.write().await;

        pool.insert(
            address,
            Arc::new(Mutex::new(PoolEntry {
                stream,
                last_used: Instant::now(),
                in_flight: false,
            })),
        );
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Clean up stale connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.write().await;
        let now = Instant::now();

        pool.retain(|addr, entry| {
            if let Ok(e) = entry.try_lock() {
                if now.duration_since(e.last_used) > max_idle {
                    tracing::debug!("Removing stale connection to {}", addr);
                    return false;
                }
            }
            true
        });
    }

    /// Close all connections
    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        pool.clear();
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

#[async_trait]
impl Transport for NetworkClient {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        self.send(address, message).await
    }
}

/// Write a request and read its reply on one stream
async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        let client = NetworkClient::new(Duration::from_secs(5), Duration::from_secs(10));

        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100), Duration::from_millis(500));

        // Nothing listens on a freshly released port
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = client.send(&format!("127.0.0.1:{}", port), Message::Query).await;
        let err = result.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {}", err);
    }
}
