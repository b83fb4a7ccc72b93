//! Protocol error types

use thiserror::Error;

/// Errors raised while encoding or decoding UVC wire structures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for the structure being decoded
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Control block length not one of 26, 34 or 48
    #[error("Invalid stream control block length: {0}")]
    InvalidControlLength(usize),

    /// Payload header declares a length the payload cannot hold
    #[error("Invalid payload header length {header} for payload of {payload} bytes")]
    InvalidHeaderLength { header: usize, payload: usize },

    /// Profile string could not be parsed
    #[error("Invalid stream profile '{0}', expected FOURCC:WIDTHxHEIGHT@FPS")]
    InvalidProfile(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BufferTooSmall {
            needed: 26,
            available: 10,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("needed 26"));
        assert!(msg.contains("got 10"));
    }

    #[test]
    fn test_header_length_error() {
        let err = ProtocolError::InvalidHeaderLength {
            header: 40,
            payload: 12,
        };
        assert!(err.to_string().contains("40"));
    }
}
