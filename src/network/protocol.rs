//! Peer Protocol
//!
//! Defines the wire protocol for communication between nodes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintIndex};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Discovery ==========
    /// Ask a node (normally the master) who holds a file
    GetFingerprint { name: String },

    /// Fingerprint lookup response
    FingerprintFound { fingerprint: Fingerprint },

    // ========== Transfer ==========
    /// Request file content from a holder
    Pull { name: String, checksum: u64 },

    /// File content (LZ4, size-prefixed)
    FileData { name: String, data: Vec<u8> },

    // ========== Propagation ==========
    /// Announce fingerprints to a peer
    Notify {
        from: String,
        fingerprints: FingerprintIndex,
    },

    /// Notify acknowledgment
    NotifyAck { accepted: usize },

    /// Request a peer's full local inventory
    Query,

    /// Inventory response
    QueryResponse { fingerprints: FingerprintIndex },

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// File or fingerprint unknown
    NotFound,
    /// Checksum disagreement
    Conflict,
    /// Bad file name
    InvalidName,
    /// Operation requires the master
    NotMaster,
    /// Peer is closing
    ShuttingDown,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::GetFingerprint { .. } => "GetFingerprint",
            Message::FingerprintFound { .. } => "FingerprintFound",
            Message::Pull { .. } => "Pull",
            Message::FileData { .. } => "FileData",
            Message::Notify { .. } => "Notify",
            Message::NotifyAck { .. } => "NotifyAck",
            Message::Query => "Query",
            Message::QueryResponse { .. } => "QueryResponse",
            Message::Error { .. } => "Error",
        }
    }

    /// Build a compressed file payload
    pub fn file_data(name: &str, raw: &[u8]) -> Self {
        Message::FileData {
            name: name.to_string(),
            data: lz4_flex::compress_prepend_size(raw),
        }
    }

    /// Build an error response from a local error
    pub fn from_error(error: &Error) -> Self {
        let code = match error {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Conflict { .. } => ErrorCode::Conflict,
            Error::InvalidName(_) => ErrorCode::InvalidName,
            Error::NotMaster(_) => ErrorCode::NotMaster,
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            _ => ErrorCode::Internal,
        };
        Message::Error {
            code,
            message: error.to_string(),
        }
    }

    /// Response that carries no useful payload
    pub fn unexpected(&self) -> Self {
        Message::Error {
            code: ErrorCode::Internal,
            message: format!("unexpected message {}", self.type_name()),
        }
    }
}

/// Decompress a `FileData` payload that should hold `expected_size` bytes.
///
/// The size prefix is checked before anything is allocated.
pub fn decompress_file_data(data: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let prefix: [u8; 4] = data
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| Error::Protocol("truncated file payload".into()))?;
    let declared = u32::from_le_bytes(prefix) as u64;
    if declared != expected_size {
        return Err(Error::Protocol(format!(
            "file payload declares {} bytes, expected {}",
            declared, expected_size
        )));
    }
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Protocol(format!("corrupt file payload: {}", e)))
}

/// Convert an error response received from `host` into a local error
pub fn remote_error(host: &str, code: ErrorCode, message: String) -> Error {
    match code {
        ErrorCode::NotFound => Error::NotFound(message),
        ErrorCode::NotMaster => Error::NotMaster(host.to_string()),
        ErrorCode::ShuttingDown => Error::Transport(format!("{} is shutting down", host)),
        ErrorCode::Conflict | ErrorCode::InvalidName | ErrorCode::Internal => Error::Rejected {
            host: host.to_string(),
            message,
        },
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_serialization() {
        let fp = Fingerprint::compute("20240101/a.txt", b"abc", ["10.0.0.1:7660"]);
        let msg = Message::Notify {
            from: "10.0.0.1:7660".to_string(),
            fingerprints: fp.clone().into_index(),
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Notify { from, fingerprints } => {
                assert_eq!(from, "10.0.0.1:7660");
                assert_eq!(fingerprints.get("20240101/a.txt"), Some(&fp));
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_file_data_compression() {
        let raw = vec![7u8; 64 * 1024];
        let msg = Message::file_data("20240101/zeros.bin", &raw);

        match msg {
            Message::FileData { data, .. } => {
                assert!(data.len() < raw.len());
                assert_eq!(decompress_file_data(&data, raw.len() as u64).unwrap(), raw);
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
        assert!(decompress_file_data(&[1, 2], 2).is_err());
    }

    #[test]
    fn test_file_data_size_prefix_checked() {
        let mut data = lz4_flex::compress_prepend_size(b"twelve bytes");
        assert!(decompress_file_data(&data, 11).is_err());
        assert!(decompress_file_data(&data, 13).is_err());

        // A forged prefix is refused without decompressing
        data[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = decompress_file_data(&data, 12).unwrap_err();
        assert!(err.to_string().contains("4294967295"));
    }

    #[test]
    fn test_error_codes_map_back() {
        let msg = Message::from_error(&Error::NotFound("20240101/x".into()));
        let Message::Error { code, message } = msg else {
            panic!("expected error message");
        };
        assert_eq!(code, ErrorCode::NotFound);
        assert!(remote_error("m:1", code, message).is_not_found());

        let err = remote_error("m:1", ErrorCode::Conflict, "checksum".into());
        assert!(!err.is_retryable());
        let err = remote_error("m:1", ErrorCode::ShuttingDown, String::new());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
