//! Fragment encoding and decoding for the Obsqura link.
//!
//! Every write on the link is one fragment of at most 20 bytes:
//!
//! ```text
//! +--------+--------+--------+--------+---------------------------+
//! | Type   | MsgId  | Index  | Total  | Payload                   |
//! | 1 byte | 1 byte | 1 byte | 1 byte | <= 16 bytes               |
//! +--------+--------+--------+--------+---------------------------+
//! ```
//!
//! Payloads are exactly 16 bytes except possibly the last fragment of a
//! message, which carries the remainder unpadded.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::core::{
    FRAGMENT_HEADER_SIZE, FRAGMENT_PAYLOAD_SIZE, MAX_FRAGMENT_SIZE, MAX_FRAGMENTS,
    MAX_MESSAGE_SIZE, MESSAGE_TYPE_KEY_CIPHERTEXT, MESSAGE_TYPE_KEY_REQUEST, MESSAGE_TYPE_PLAIN,
    MESSAGE_TYPE_SECURE,
};

/// Message type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Public key request, and the public key sent in reply.
    KeyRequest = MESSAGE_TYPE_KEY_REQUEST,
    /// KEM ciphertext returned to the key owner.
    KeyCiphertext = MESSAGE_TYPE_KEY_CIPHERTEXT,
    /// AEAD-sealed payload (`nonce || ciphertext || tag`).
    SecureMessage = MESSAGE_TYPE_SECURE,
    /// Raw plaintext payload.
    PlainMessage = MESSAGE_TYPE_PLAIN,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            MESSAGE_TYPE_KEY_REQUEST => Some(Self::KeyRequest),
            MESSAGE_TYPE_KEY_CIPHERTEXT => Some(Self::KeyCiphertext),
            MESSAGE_TYPE_SECURE => Some(Self::SecureMessage),
            MESSAGE_TYPE_PLAIN => Some(Self::PlainMessage),
            _ => None,
        }
    }

    /// Convert the message type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Tag used on relay envelopes for viewer-side filtering.
    pub fn relay_hint(self) -> &'static str {
        match self {
            Self::KeyRequest | Self::KeyCiphertext => "handshake",
            Self::SecureMessage => "secure",
            Self::PlainMessage => "legacy",
        }
    }
}

/// Per-message identifier, scoped to one peer.
///
/// Not globally unique: collisions are absorbed by the reassembly reset rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u8);

impl MessageId {
    /// Create a message id from a byte.
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    /// Draw a random message id.
    pub fn random() -> Self {
        Self(rand::random::<u8>())
    }

    /// Get the raw byte.
    pub fn as_byte(self) -> u8 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for MessageId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// One wire unit of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Message type (identical across all fragments of a message).
    pub message_type: MessageType,
    /// Message identifier.
    pub msg_id: MessageId,
    /// Zero-based fragment index, always `< total`.
    pub index: u8,
    /// Fragment count of the logical message, `1..=255`.
    pub total: u8,
    /// Payload section, at most 16 bytes.
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Serialize to wire bytes (header followed by payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        buf.push(self.message_type.as_byte());
        buf.push(self.msg_id.as_byte());
        buf.push(self.index);
        buf.push(self.total);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a fragment from wire bytes.
    ///
    /// Rejects short or oversized writes, an unknown type byte, `total == 0`
    /// and `index >= total`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes.len() > MAX_FRAGMENT_SIZE {
            return Err(FrameError::TooLong {
                max: MAX_FRAGMENT_SIZE,
                actual: bytes.len(),
            });
        }

        let message_type =
            MessageType::from_byte(bytes[0]).ok_or(FrameError::UnknownType(bytes[0]))?;
        let index = bytes[2];
        let total = bytes[3];

        if total == 0 {
            return Err(FrameError::InvalidTotal(total));
        }
        if index >= total {
            return Err(FrameError::IndexOutOfRange { index, total });
        }

        Ok(Self {
            message_type,
            msg_id: MessageId(bytes[1]),
            index,
            total,
            payload: bytes[FRAGMENT_HEADER_SIZE..].to_vec(),
        })
    }

    /// Total wire length of this fragment.
    pub fn wire_len(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.payload.len()
    }
}

/// Splits payloads into fragments and joins them back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Framer;

impl Framer {
    /// Number of fragments needed for a payload of `len` bytes.
    ///
    /// An empty payload still occupies one (empty) fragment.
    pub fn fragment_count(len: usize) -> usize {
        len.div_ceil(FRAGMENT_PAYLOAD_SIZE).max(1)
    }

    /// Split `payload` into 16-byte fragments.
    ///
    /// Fails with [`FrameError::PayloadTooLarge`] when more than 255
    /// fragments would be required: the one-byte `total` cannot express it.
    pub fn split(
        payload: &[u8],
        message_type: MessageType,
        msg_id: MessageId,
    ) -> Result<Vec<Fragment>, FrameError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let count = Self::fragment_count(payload.len());
        debug_assert!(count <= MAX_FRAGMENTS);
        let total = count as u8;

        if payload.is_empty() {
            return Ok(vec![Fragment {
                message_type,
                msg_id,
                index: 0,
                total,
                payload: Vec::new(),
            }]);
        }

        Ok(payload
            .chunks(FRAGMENT_PAYLOAD_SIZE)
            .enumerate()
            .map(|(i, chunk)| Fragment {
                message_type,
                msg_id,
                index: i as u8,
                total,
                payload: chunk.to_vec(),
            })
            .collect())
    }

    /// Concatenate fragment payloads in index order.
    ///
    /// The caller must already have verified completeness; gaps are not
    /// detected here.
    pub fn reassemble(fragments: &BTreeMap<u8, Fragment>) -> Vec<u8> {
        let len = fragments.values().map(|f| f.payload.len()).sum();
        let mut out = Vec::with_capacity(len);
        for fragment in fragments.values() {
            out.extend_from_slice(&fragment.payload);
        }
        out
    }
}

/// Fragment parsing and framing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Write is shorter than the header.
    #[error("fragment too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Write exceeds the link's write size.
    #[error("fragment too long: at most {max} bytes, got {actual}")]
    TooLong {
        /// Maximum size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Unknown message type byte.
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    /// `total` outside `1..=255`.
    #[error("invalid fragment total: {0}")]
    InvalidTotal(u8),

    /// `index >= total`.
    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange {
        /// Index received.
        index: u8,
        /// Total received.
        total: u8,
    },

    /// Payload needs more than 255 fragments.
    #[error("payload of {len} bytes exceeds the {max}-byte message limit")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest framable payload.
        max: usize,
    },
}
