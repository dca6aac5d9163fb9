//! Transport abstraction shared by the direct link and the relay.
//!
//! Both transports push fragments one at a time and differ only in how a
//! write is acknowledged:
//!
//! - direct: one write in flight, completion arrives later as
//!   [`TransportEvent::WriteComplete`]
//! - relay: the send call answers accept/reject synchronously and there is
//!   no completion at all
//!
//! The delivery scheduler reads the [`Submission`] and applies one retry and
//! pacing policy to both.

use std::fmt;

use super::error::TransportResult;
use super::frame::Fragment;
use crate::crypto::OwnerId;
use crate::delivery::Generation;

/// Which transport a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Direct hardware link.
    Direct,
    /// Message-passing relay.
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Relay => f.write_str("relay"),
        }
    }
}

/// Caller-facing name for the active transport selection.
pub type TransportMode = TransportKind;

/// Outcome of handing one fragment to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A previous write is still in flight; nothing was written.
    Busy,
    /// The transport refused the write.
    Rejected,
    /// Written; completion will follow asynchronously.
    Pending,
    /// Accepted, and no completion will follow.
    Accepted,
}

/// Signals a transport implementation reports to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link (or relay channel) is up.
    LinkUp,
    /// Capability discovery finished; the link is ready for traffic.
    DiscoveryComplete,
    /// The link went down.
    LinkDown {
        /// Teardown was requested by the local user.
        user_initiated: bool,
        /// Platform error code, if the teardown carried one.
        code: Option<i32>,
    },
    /// The in-flight direct write finished.
    WriteComplete {
        /// Whether the peer acknowledged the write.
        success: bool,
    },
    /// A raw fragment arrived on the direct link.
    Inbound(Vec<u8>),
    /// A text envelope arrived on the relay.
    RelayText(String),
}

/// A transport the controller can drive.
pub trait Transport: Send + 'static {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Start opening the link to `peer`. Completion arrives as
    /// [`TransportEvent::LinkUp`].
    fn open(&mut self, peer: &OwnerId) -> TransportResult<()>;

    /// Start capability discovery. Completion arrives as
    /// [`TransportEvent::DiscoveryComplete`].
    fn discover(&mut self) -> TransportResult<()>;

    /// Release link resources. Must be safe to call repeatedly.
    fn close(&mut self);

    /// Hand one fragment to the link.
    ///
    /// `generation` tags a pending write so that its completion can be
    /// matched to the transfer that issued it.
    fn submit(&mut self, generation: Generation, fragment: &Fragment) -> Submission;

    /// Clear the in-flight write and return the generation it was issued
    /// under. Transports without completions return `None`.
    fn complete_write(&mut self) -> Option<Generation> {
        None
    }

    /// Ask the peer for its public key out of band, where supported.
    fn request_public_key(&mut self) -> TransportResult<()> {
        Ok(())
    }
}
