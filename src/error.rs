//! WolfNFS Error Types

use thiserror::Error;

/// Result type alias for WolfNFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfNFS error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lookup errors
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("Fingerprint conflict for {name}: local checksum {local:016x}, remote checksum {remote:016x}")]
    Conflict { name: String, local: u64, remote: u64 },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Index serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Cluster errors
    #[error("No master available")]
    NoMaster,

    #[error("Not master: current master is {0}")]
    NotMaster(String),

    // Network errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Checksum mismatch for {name} from {host}: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch {
        name: String,
        host: String,
        expected: u64,
        actual: u64,
    },

    #[error("Rejected by {host}: {message}")]
    Rejected { host: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::ChecksumMismatch { .. }
                | Error::NoMaster
                | Error::Io(_)
        )
    }

    /// Check if this error is a missing file or fingerprint
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error is a checksum conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionTimeout("node-2:7660".into()).is_retryable());
        assert!(Error::Transport("all holders failed".into()).is_retryable());
        assert!(Error::NoMaster.is_retryable());

        assert!(!Error::NotFound("20240101/a.txt".into()).is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
        assert!(!Error::Conflict {
            name: "a".into(),
            local: 1,
            remote: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_conflict_display() {
        let err = Error::Conflict {
            name: "20240101/a.txt".into(),
            local: 0xabc,
            remote: 0xdef,
        };
        let msg = err.to_string();
        assert!(msg.contains("20240101/a.txt"));
        assert!(msg.contains("0000000000000abc"));
        assert!(err.is_conflict());
    }
}
