//! Network Server
//!
//! TCP server accepting peer connections and answering each request
//! through a `RequestHandler`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};

/// Answers requests arriving from peers
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the reply to `message` sent by `peer`
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bound listener, taken when the accept loop starts
    listener: Mutex<Option<TcpListener>>,
    /// Actual bound address
    local_addr: SocketAddr,
    /// Request handler
    handler: Arc<dyn RequestHandler>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind a new network server
    pub async fn bind(bind_address: &str, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            handler,
            shutdown: shutdown_tx,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `stop` is called
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("network server already started".into()))?;
        tracing::info!("Network server listening on {}", self.local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();

        while !*shutdown_rx.borrow() {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);
                            let shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), handler, shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server. Takes effect even if `start` has not run yet.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown.changed() => break,
        };

        match message {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(&peer_addr, message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::Query => Message::NotifyAck { accepted: 7 },
                other => other.unexpected(),
            }
        }
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let server = Arc::new(NetworkServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap());
        let addr = server.local_addr().to_string();

        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.start().await });

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(2));
        for _ in 0..3 {
            let reply = client.send(&addr, Message::Query).await.unwrap();
            assert!(matches!(reply, Message::NotifyAck { accepted: 7 }));
        }
        assert_eq!(client.connection_count().await, 1);

        server.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let server = NetworkServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        server.stop();

        tokio::time::timeout(Duration::from_secs(2), server.start())
            .await
            .expect("stopped server should not keep accepting")
            .unwrap();
        assert!(server.start().await.is_err());
    }
}
