//! Incoming fragment reassembly.
//!
//! One buffer per active peer or relay session. A fragment whose `msg_id`
//! differs from the message being collected starts a new message; so does a
//! `total` that disagrees with the one already seen. Neither is an error.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use super::frame::{Fragment, FrameError, Framer, MessageId, MessageType};

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// Message type of its fragments.
    pub message_type: MessageType,
    /// Message identifier.
    pub msg_id: MessageId,
    /// Concatenated payload.
    pub payload: Vec<u8>,
}

/// Result of accepting a well-formed fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Stored; more fragments are needed.
    Partial {
        /// Distinct fragments held.
        received: usize,
        /// Fragments expected.
        total: usize,
    },
    /// Already held; ignored.
    Duplicate {
        /// Index of the repeated fragment.
        index: u8,
    },
    /// Last missing fragment arrived; state has been cleared.
    Complete {
        /// Fragment count of the message.
        total: usize,
        /// The message.
        message: CompletedMessage,
    },
}

/// Per-peer reassembly state.
#[derive(Debug, Clone, Default)]
pub struct ReassemblyBuffer {
    fragments: BTreeMap<u8, Fragment>,
    current_msg_id: Option<MessageId>,
    expected_total: u8,
}

impl ReassemblyBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse raw bytes and accept the fragment.
    ///
    /// Malformed input is rejected without touching state.
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<Accepted, FrameError> {
        let fragment = Fragment::parse(bytes)?;
        Ok(self.accept(fragment))
    }

    /// Accept a parsed fragment.
    pub fn accept(&mut self, fragment: Fragment) -> Accepted {
        trace!(
            msg_id = %fragment.msg_id,
            index = fragment.index,
            total = fragment.total,
            len = fragment.payload.len(),
            "fragment in"
        );

        if self.current_msg_id != Some(fragment.msg_id) {
            if self.current_msg_id.is_some() && !self.fragments.is_empty() {
                debug!(
                    old = ?self.current_msg_id,
                    new = %fragment.msg_id,
                    held = self.fragments.len(),
                    "new message started, discarding partial"
                );
            }
            self.fragments.clear();
            self.current_msg_id = Some(fragment.msg_id);
            self.expected_total = fragment.total;
        } else if fragment.total != self.expected_total {
            debug!(
                msg_id = %fragment.msg_id,
                old = self.expected_total,
                new = fragment.total,
                "fragment total changed, restarting message"
            );
            self.fragments.clear();
            self.expected_total = fragment.total;
        }

        let index = fragment.index;
        if self.fragments.contains_key(&index) {
            debug!(msg_id = %fragment.msg_id, index, "duplicate fragment ignored");
            return Accepted::Duplicate { index };
        }
        self.fragments.insert(index, fragment);

        let total = self.expected_total as usize;
        let received = self.fragments.len();
        if received == total {
            if (0..self.expected_total).all(|i| self.fragments.contains_key(&i)) {
                return Accepted::Complete {
                    total,
                    message: self.take_message(),
                };
            }
            warn!(received, total, "fragment set has gaps, waiting");
        }

        Accepted::Partial { received, total }
    }

    fn take_message(&mut self) -> CompletedMessage {
        let payload = Framer::reassemble(&self.fragments);
        let first = self.fragments.values().next();
        let message_type = first.map_or(MessageType::PlainMessage, |f| f.message_type);
        let msg_id = self.current_msg_id.unwrap_or(MessageId::new(0));
        self.reset();
        CompletedMessage {
            message_type,
            msg_id,
            payload,
        }
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.fragments.clear();
        self.current_msg_id = None;
        self.expected_total = 0;
    }

    /// `(received, total)` of the message being collected.
    pub fn progress(&self) -> (usize, usize) {
        (self.fragments.len(), self.expected_total as usize)
    }

    /// Whether a partial message is held.
    pub fn is_idle(&self) -> bool {
        self.fragments.is_empty()
    }
}
