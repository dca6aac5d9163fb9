//! Transport layer error types.
//!
//! Inbound garbage (malformed fragments, unparseable relay envelopes) is
//! dropped and logged, never answered: see [`TransportError::is_silent_drop`].

use thiserror::Error;

use super::frame::FrameError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Fragment parsing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Relay envelope is not valid JSON or misses fields.
    #[error("malformed relay envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// Relay payload is not valid base64.
    #[error("malformed relay payload: {0}")]
    Payload(#[from] base64::DecodeError),

    /// Relay-rebuilt fragment header is out of range.
    #[error("relay fragment field out of range: {field}={value}")]
    FieldOutOfRange {
        /// Field name.
        field: &'static str,
        /// Value received.
        value: i64,
    },

    /// Operation needs an open link.
    #[error("link not connected")]
    NotConnected,
}

impl TransportError {
    /// Check if this error should result in a silent drop (no response sent).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Frame(_)
                | TransportError::Envelope(_)
                | TransportError::Payload(_)
                | TransportError::FieldOutOfRange { .. }
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
