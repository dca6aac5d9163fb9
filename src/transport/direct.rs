//! Direct hardware link transport.
//!
//! The link accepts one write at a time. A write that the link accepts is
//! outstanding until the platform reports its completion; until then every
//! further submit answers [`Submission::Busy`].
//!
//! A write still outstanding when the link is closed or reopened keeps its
//! issuing generation. Its late completion is handed back under that stale
//! generation, ahead of any write issued after the reconnect.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::error::TransportResult;
use super::frame::Fragment;
use super::link::{Submission, Transport, TransportKind};
use crate::crypto::OwnerId;
use crate::delivery::Generation;

/// Platform side of the direct link.
///
/// Implementations report asynchronous outcomes (link up/down, discovery,
/// write completion, notifications) through an
/// [`EventSink`](crate::client::EventSink) created for
/// [`TransportKind::Direct`].
pub trait DirectLink: Send + 'static {
    /// Begin connecting to `peer`.
    fn connect(&mut self, peer: &OwnerId) -> TransportResult<()>;

    /// Begin capability discovery on the connected peer.
    fn discover(&mut self) -> TransportResult<()>;

    /// Tear the connection down.
    fn disconnect(&mut self);

    /// Issue one write. Returns whether the platform accepted it.
    ///
    /// Every accepted write must be completed exactly once through
    /// [`EventSink::write_complete`](crate::client::EventSink::write_complete),
    /// also across a disconnect (report failure when the link dropped it).
    fn write(&mut self, bytes: &[u8]) -> bool;
}

/// [`Transport`] over a [`DirectLink`].
#[derive(Debug)]
pub struct DirectTransport<L> {
    link: L,
    in_flight: Option<Generation>,
    orphans: VecDeque<Generation>,
}

impl<L: DirectLink> DirectTransport<L> {
    /// Wrap a platform link.
    pub fn new(link: L) -> Self {
        Self {
            link,
            in_flight: None,
            orphans: VecDeque::new(),
        }
    }

    /// Whether a write is outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Writes abandoned by a teardown whose completion has not arrived yet.
    pub fn orphaned(&self) -> usize {
        self.orphans.len()
    }

    fn orphan_in_flight(&mut self) {
        if let Some(generation) = self.in_flight.take() {
            debug!(%generation, "write outstanding at teardown");
            self.orphans.push_back(generation);
        }
    }

    /// Access the platform link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutable access to the platform link.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}

impl<L: DirectLink> Transport for DirectTransport<L> {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn open(&mut self, peer: &OwnerId) -> TransportResult<()> {
        self.orphan_in_flight();
        self.link.connect(peer)
    }

    fn discover(&mut self) -> TransportResult<()> {
        self.link.discover()
    }

    fn close(&mut self) {
        self.orphan_in_flight();
        self.link.disconnect();
    }

    fn submit(&mut self, generation: Generation, fragment: &Fragment) -> Submission {
        if let Some(pending) = self.in_flight {
            trace!(%generation, %pending, "direct write still in flight");
            return Submission::Busy;
        }

        let bytes = fragment.to_bytes();
        if self.link.write(&bytes) {
            self.in_flight = Some(generation);
            Submission::Pending
        } else {
            debug!(index = fragment.index, len = bytes.len(), "direct write refused");
            Submission::Rejected
        }
    }

    fn complete_write(&mut self) -> Option<Generation> {
        // Completions arrive in write order, so orphans drain first.
        self.orphans.pop_front().or_else(|| self.in_flight.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Framer, MessageId, MessageType};

    #[derive(Default)]
    struct ScriptedLink {
        accept: bool,
        writes: Vec<Vec<u8>>,
        disconnects: usize,
    }

    impl DirectLink for ScriptedLink {
        fn connect(&mut self, _peer: &OwnerId) -> TransportResult<()> {
            Ok(())
        }

        fn discover(&mut self) -> TransportResult<()> {
            Ok(())
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }

        fn write(&mut self, bytes: &[u8]) -> bool {
            self.writes.push(bytes.to_vec());
            self.accept
        }
    }

    fn fragment() -> Fragment {
        Framer::split(b"ping", MessageType::PlainMessage, MessageId::new(4))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_one_write_in_flight() {
        let mut t = DirectTransport::new(ScriptedLink {
            accept: true,
            ..Default::default()
        });
        let g = Generation::default();

        assert_eq!(t.submit(g, &fragment()), Submission::Pending);
        assert!(t.is_busy());
        assert_eq!(t.submit(g, &fragment()), Submission::Busy);
        assert_eq!(t.link().writes.len(), 1);
        assert_eq!(t.link().writes[0], hex::decode("0604000170696e67").unwrap());

        assert_eq!(t.complete_write(), Some(g));
        assert!(!t.is_busy());
        assert_eq!(t.complete_write(), None);
    }

    #[test]
    fn test_refused_write_is_not_in_flight() {
        let mut t = DirectTransport::new(ScriptedLink::default());
        assert_eq!(t.submit(Generation::default(), &fragment()), Submission::Rejected);
        assert!(!t.is_busy());
    }

    #[test]
    fn test_completion_carries_issuing_generation() {
        let mut t = DirectTransport::new(ScriptedLink {
            accept: true,
            ..Default::default()
        });
        let old = Generation::default();
        let new = old.next();
        t.submit(old, &fragment());
        // A newer transfer cannot write until the old completion drains.
        assert_eq!(t.submit(new, &fragment()), Submission::Busy);
        assert_eq!(t.complete_write(), Some(old));
        assert_eq!(t.submit(new, &fragment()), Submission::Pending);
        assert_eq!(t.complete_write(), Some(new));
    }

    #[test]
    fn test_close_clears_in_flight() {
        let mut t = DirectTransport::new(ScriptedLink {
            accept: true,
            ..Default::default()
        });
        t.submit(Generation::default(), &fragment());
        t.close();
        assert!(!t.is_busy());
        assert_eq!(t.orphaned(), 1);
        assert_eq!(t.link().disconnects, 1);
    }

    #[test]
    fn test_late_completion_after_reconnect_keeps_old_generation() {
        let mut t = DirectTransport::new(ScriptedLink {
            accept: true,
            ..Default::default()
        });
        let old = Generation::default();
        let new = old.next();
        assert_eq!(t.submit(old, &fragment()), Submission::Pending);
        t.close();
        t.open(&OwnerId::new("peer")).unwrap();

        // The new transfer may write while the old completion is pending.
        assert_eq!(t.submit(new, &fragment()), Submission::Pending);
        assert_eq!(t.complete_write(), Some(old));
        assert!(t.is_busy());
        assert_eq!(t.complete_write(), Some(new));
        assert_eq!(t.complete_write(), None);
        assert_eq!(t.orphaned(), 0);
    }
}
