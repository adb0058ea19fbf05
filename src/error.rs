//! Error types for relcache.

use std::io;
use thiserror::Error;

/// Result type alias for relcache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache-engine operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from swap-file operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// CRC checksum mismatch on a compressed run.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// A store or container refused an allocation.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The in-block record id space of a store is used up.
    #[error("Record id space exhausted (next id {next:#x}, big-value floor {floor:#x})")]
    IdSpaceExhausted { next: u32, floor: u32 },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A task submission waited past the configured ceiling.
    #[error("Timed out submitting to shard {0}")]
    SubmitTimeout(usize),

    /// The target shard worker has stopped.
    #[error("Shard {0} is stopped")]
    ShardStopped(usize),

    /// The upstream connector failed.
    #[error("Connector error: {0}")]
    Connector(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a capacity error.
    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        Error::CapacityExceeded(msg.into())
    }

    /// Create a connector error.
    pub fn connector<S: Into<String>>(msg: S) -> Self {
        Error::Connector(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::CrcMismatch { .. })
    }

    /// Check if this error is recoverable by retrying elsewhere.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SubmitTimeout(_) | Error::ShardStopped(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corruption("bad run header");
        assert_eq!(format!("{}", err), "Corruption detected: bad run header");

        let err = Error::IdSpaceExhausted {
            next: 0x8000,
            floor: 0x8000,
        };
        assert!(format!("{}", err).contains("0x8000"));
    }

    #[test]
    fn test_error_is_corruption() {
        assert!(Error::corruption("bad").is_corruption());
        assert!(Error::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!Error::SubmitTimeout(0).is_corruption());
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::SubmitTimeout(3).is_recoverable());
        assert!(!Error::capacity("full").is_recoverable());
    }
}
