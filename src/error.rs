//! Error types for the RSSI crate.

use thiserror::Error;

/// Result type alias for RSSI operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur at the controller API surface.
///
/// Protocol-level failures (bad checksums, out-of-order data, retransmission
/// exhaustion) never surface here; they are counted on the link metrics and
/// handled inside the state machine.
#[derive(Error, Debug)]
pub enum Error {
    /// Frame handed to the controller carries no buffers
    #[error("frame must not be empty")]
    EmptyFrame,

    /// Buffer too small for the requested operation
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error indicates a caller-side sizing mistake
    pub fn is_boundary(&self) -> bool {
        matches!(self, Error::Buffer { .. } | Error::EmptyFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::EmptyFrame;
        assert_eq!(err.to_string(), "frame must not be empty");

        let err = Error::Buffer {
            expected: 12,
            actual: 4,
        };
        assert_eq!(err.to_string(), "buffer error: expected 12 bytes, got 4");
    }

    #[test]
    fn test_error_boundary() {
        assert!(Error::EmptyFrame.is_boundary());
        assert!(!Error::config("bad window").is_boundary());
    }
}
