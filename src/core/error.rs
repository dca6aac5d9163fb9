//! Error types for the Obsqura link.

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::OwnerId;
use crate::transport::{FrameError, TransportKind};

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD open failed: tag mismatch, tampered or truncated data.
    #[error("authentication failed (tampered or corrupted ciphertext)")]
    AuthenticationFailed,

    /// Sealed envelope shorter than nonce + tag.
    #[error("sealed message too short: {len} bytes")]
    EnvelopeTooShort {
        /// Length received.
        len: usize,
    },

    /// Key too short for the cipher.
    #[error("invalid key length: {len} bytes (need at least {min})")]
    InvalidKeyLength {
        /// Length supplied.
        len: usize,
        /// Minimum accepted.
        min: usize,
    },

    /// The configured cipher suite was compiled out.
    #[error("cipher suite not available in this build: {0}")]
    UnsupportedSuite(&'static str),
}

/// Failure reported by the external key-encapsulation capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("encapsulation failed: {reason}")]
pub struct KemError {
    /// Reason given by the primitive.
    pub reason: String,
}

impl KemError {
    /// Create a KEM error with a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors in the handshake orchestrator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Received data does not look like a public key.
    #[error("invalid public key length: {len} bytes (expected {min}..={max})")]
    InvalidPublicKey {
        /// Length received.
        len: usize,
        /// Lower bound of the accepted window.
        min: usize,
        /// Upper bound of the accepted window.
        max: usize,
    },

    /// An encapsulation is already running.
    #[error("encapsulation already in progress")]
    Busy,

    /// The KEM capability failed.
    #[error(transparent)]
    Encapsulation(#[from] KemError),

    /// The encapsulation worker panicked or was cancelled.
    #[error("encapsulation worker failed: {0}")]
    Worker(String),

    /// A handshake message could not be delivered.
    #[error("handshake message undeliverable")]
    DeliveryFailed,
}

/// Errors returned by send operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No session key exists for the active owner.
    #[error("no session key for {owner}; run the key handshake first")]
    KeyMissing {
        /// Owner the key was looked up under.
        owner: OwnerId,
    },

    /// Text operations refuse blank input.
    #[error("refusing to send blank text")]
    EmptyText,

    /// Framing failed.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// Sealing failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The active mode has no transport attached.
    #[error("no {0} transport configured")]
    NoTransport(TransportKind),
}

/// Top-level link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Send error.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The controller task has stopped.
    #[error("link controller stopped")]
    ControllerStopped,
}

/// Result type for caller-facing link operations.
pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_missing_names_owner() {
        let err = SendError::KeyMissing {
            owner: OwnerId::new("AA:BB:CC:DD:EE:FF"),
        };
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_kem_error_converts_into_handshake_error() {
        let err: HandshakeError = KemError::new("bad key").into();
        assert_eq!(err.to_string(), "encapsulation failed: bad key");
    }

    #[test]
    fn test_link_error_wraps_layers() {
        let err: LinkError = SendError::EmptyText.into();
        assert!(matches!(err, LinkError::Send(SendError::EmptyText)));

        let err: LinkError = CryptoError::AuthenticationFailed.into();
        assert!(matches!(err, LinkError::Crypto(CryptoError::AuthenticationFailed)));
    }
}
