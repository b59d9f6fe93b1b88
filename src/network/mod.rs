//! Network Module
//!
//! Handles communication between nodes: the framed wire protocol, the
//! `Transport` seam the replication engine talks through, a pooled TCP
//! client, the accepting server and an in-process loopback transport.

mod client;
mod loopback;
pub mod protocol;
mod server;

pub use client::NetworkClient;
pub use loopback::LoopbackTransport;
pub use protocol::{ErrorCode, FrameHeader, Message};
pub use server::{NetworkServer, RequestHandler};

use async_trait::async_trait;

use crate::error::{Error, Result};
use protocol::MAX_FRAME_SIZE;

/// Request/response channel to peer nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` to `address` and wait for the reply
    async fn request(&self, address: &str, message: Message) -> Result<Message>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("frame of {} bytes too large", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Transport("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!("frame of {} bytes too large", body.len())));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        write_message(&mut a, &Message::Query).await.unwrap();
        let received = read_message(&mut b).await.unwrap();
        assert!(matches!(received, Message::Query));
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = Message::Query.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xffff;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(read_message(&mut b).await.is_err());
    }
}
