//! Observable output of the link controller.

use tokio::sync::mpsc;

use crate::core::{CryptoError, HandshakeError};
use crate::crypto::OwnerId;
use crate::delivery::TransferSummary;
use crate::transport::{ConnectionState, MessageId, MessageType};

/// Why an inbound secure message was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// No session key for the active owner.
    KeyMissing,
    /// The AEAD refused the message (tampered, wrong key or truncated).
    Crypto(CryptoError),
}

/// Event emitted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connection state transition.
    StateChanged(ConnectionState),
    /// Outbound progress in fragments.
    SendProgress {
        /// Fragments delivered.
        sent: usize,
        /// Fragments in the transfer.
        total: usize,
    },
    /// Inbound progress in fragments.
    ReceiveProgress {
        /// Fragments received.
        received: usize,
        /// Fragments expected.
        total: usize,
    },
    /// An outbound transfer was delivered in full.
    TransferComplete {
        /// Message id.
        msg_id: MessageId,
        /// Message type.
        message_type: MessageType,
        /// Counts.
        summary: TransferSummary,
    },
    /// An outbound transfer was abandoned.
    TransferFailed {
        /// Message id.
        msg_id: MessageId,
        /// Message type.
        message_type: MessageType,
        /// Fragment that exhausted its attempts.
        index: u8,
        /// Counts.
        summary: TransferSummary,
    },
    /// A reassembled message that is not interpreted by the engine.
    Message {
        /// Message type.
        message_type: MessageType,
        /// Message id.
        msg_id: MessageId,
        /// Payload bytes.
        payload: Vec<u8>,
    },
    /// A secure message that passed authentication.
    SecureMessage {
        /// Message id.
        msg_id: MessageId,
        /// Decrypted payload.
        plaintext: Vec<u8>,
    },
    /// A secure message was discarded.
    MessageRejected {
        /// Message id.
        msg_id: MessageId,
        /// Reason.
        reason: RejectReason,
    },
    /// A session key was derived and stored.
    KeyEstablished {
        /// Owner the key is stored under.
        owner: OwnerId,
    },
    /// The KEM ciphertext reached the peer.
    HandshakeComplete,
    /// The key exchange was abandoned.
    HandshakeFailed(HandshakeError),
    /// Status line reported by the relay peer.
    RelayStatus {
        /// Relay session.
        session: Option<String>,
        /// Status text.
        status: String,
        /// Message the status refers to.
        msg_id: Option<i64>,
    },
    /// Human-readable diagnostic line.
    Diagnostic(String),
}

/// Receiver for [`LinkEvent`]s.
#[derive(Debug)]
pub struct LinkEvents {
    pub(crate) rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl LinkEvents {
    /// Receive the next event.
    ///
    /// Returns `None` once the controller has stopped.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }

    /// Take an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        self.rx.try_recv().ok()
    }
}
