//! Mailbox plumbing and the caller-facing handle.
//!
//! Everything that touches protocol state is marshaled onto the controller
//! task as an input: caller commands, transport callbacks, timer firings
//! and KEM worker results.

use tokio::sync::{mpsc, oneshot, watch};

use crate::core::{HandshakeError, LinkError, LinkResult, SendError};
use crate::crypto::{Encapsulation, EncapsulationJob, OwnerId};
use crate::delivery::{Generation, OutboundMessage};
use crate::transport::{
    ConnectionState, MessageId, MessageType, TransportEvent, TransportKind, TransportMode,
    WatchdogKind,
};

type Reply<T> = oneshot::Sender<Result<T, SendError>>;

/// Caller command.
#[derive(Debug)]
pub(crate) enum Command {
    Connect(OwnerId),
    Disconnect,
    Send {
        message: OutboundMessage,
        reply: Reply<MessageId>,
    },
    SendSecureText {
        text: String,
        reply: Reply<MessageId>,
    },
    RequestHandshake {
        reply: Reply<MessageId>,
    },
    Abort,
    PreserveKeyOnTeardown,
    SwitchTransport(TransportMode),
    Shutdown,
}

/// Timer firing. Staleness is judged by generation or epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Fragment { index: u8, generation: Generation },
    Watchdog { kind: WatchdogKind, epoch: u64 },
    Reconnect { epoch: u64 },
}

/// Anything the controller task reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    Transport {
        kind: TransportKind,
        event: TransportEvent,
    },
    Timer(Timer),
    Encapsulated {
        job: EncapsulationJob,
        result: Result<Encapsulation, HandshakeError>,
    },
}

/// The controller's inbox.
///
/// Create it first, hand [`EventSink`]s to the platform transports, then
/// pass it to [`LinkBuilder::spawn`](super::LinkBuilder::spawn).
#[derive(Debug)]
pub struct Mailbox {
    pub(crate) tx: mpsc::UnboundedSender<Input>,
    pub(crate) rx: mpsc::UnboundedReceiver<Input>,
}

impl Mailbox {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Sink for callbacks of the transport of `kind`.
    pub fn sink(&self, kind: TransportKind) -> EventSink {
        EventSink {
            kind,
            tx: self.tx.clone(),
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback endpoint for one platform transport.
///
/// Cheap to clone and safe to call from any thread. Every method returns
/// `false` once the controller has stopped.
#[derive(Debug, Clone)]
pub struct EventSink {
    kind: TransportKind,
    tx: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    /// Transport this sink reports for.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Post a raw transport event.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Input::Transport {
                kind: self.kind,
                event,
            })
            .is_ok()
    }

    /// The link came up.
    pub fn link_up(&self) -> bool {
        self.emit(TransportEvent::LinkUp)
    }

    /// Capability discovery finished.
    pub fn discovery_complete(&self) -> bool {
        self.emit(TransportEvent::DiscoveryComplete)
    }

    /// The link went down.
    pub fn link_down(&self, user_initiated: bool, code: Option<i32>) -> bool {
        self.emit(TransportEvent::LinkDown {
            user_initiated,
            code,
        })
    }

    /// The in-flight direct write completed.
    pub fn write_complete(&self, success: bool) -> bool {
        self.emit(TransportEvent::WriteComplete { success })
    }

    /// Raw inbound fragment bytes.
    pub fn notify(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.emit(TransportEvent::Inbound(bytes.into()))
    }

    /// Inbound relay envelope text.
    pub fn relay_text(&self, text: impl Into<String>) -> bool {
        self.emit(TransportEvent::RelayText(text.into()))
    }
}

/// Handle to a running link controller.
///
/// Dropping the handle shuts the controller down.
#[derive(Debug)]
pub struct LinkHandle {
    pub(crate) tx: mpsc::UnboundedSender<Input>,
    pub(crate) state: watch::Receiver<ConnectionState>,
}

impl LinkHandle {
    fn command(&self, command: Command) -> LinkResult<()> {
        self.tx
            .send(Input::Command(command))
            .map_err(|_| LinkError::ControllerStopped)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> LinkResult<T> {
        let (reply, rx) = oneshot::channel();
        self.command(build(reply))?;
        Ok(rx.await.map_err(|_| LinkError::ControllerStopped)??)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Connect to `peer` over the active transport.
    pub fn connect(&self, peer: impl Into<OwnerId>) -> LinkResult<()> {
        self.command(Command::Connect(peer.into()))
    }

    /// Tear the link down without reconnecting.
    pub fn disconnect(&self) -> LinkResult<()> {
        self.command(Command::Disconnect)
    }

    /// Send `payload` as one message of `message_type` under a fresh id.
    ///
    /// Resolves once the message is accepted for delivery (started or
    /// queued); completion is reported through [`LinkEvent`](super::LinkEvent)s.
    pub async fn send_large_message(
        &self,
        payload: impl Into<Vec<u8>>,
        message_type: MessageType,
    ) -> LinkResult<MessageId> {
        self.send_message(OutboundMessage::new(message_type, payload))
            .await
    }

    /// Like [`send_large_message`](Self::send_large_message) with an explicit id.
    pub async fn send_large_message_with_id(
        &self,
        payload: impl Into<Vec<u8>>,
        message_type: MessageType,
        msg_id: MessageId,
    ) -> LinkResult<MessageId> {
        self.send_message(OutboundMessage::with_id(message_type, msg_id, payload))
            .await
    }

    async fn send_message(&self, message: OutboundMessage) -> LinkResult<MessageId> {
        self.request(|reply| Command::Send { message, reply }).await
    }

    /// Send UTF-8 text as a plain message.
    pub async fn send_plain_text(&self, text: &str) -> LinkResult<MessageId> {
        if text.trim().is_empty() {
            return Err(SendError::EmptyText.into());
        }
        self.send_large_message(text.as_bytes(), MessageType::PlainMessage)
            .await
    }

    /// Seal UTF-8 text with the active owner's session key and send it.
    pub async fn send_secure_text(&self, text: &str) -> LinkResult<MessageId> {
        if text.trim().is_empty() {
            return Err(SendError::EmptyText.into());
        }
        let text = text.to_owned();
        self.request(|reply| Command::SendSecureText { text, reply })
            .await
    }

    /// Ask the peer for its public key.
    pub async fn request_handshake(&self) -> LinkResult<MessageId> {
        self.request(|reply| Command::RequestHandshake { reply })
            .await
    }

    /// Cancel the current transfer and drop queued ones.
    pub fn abort(&self) -> LinkResult<()> {
        self.command(Command::Abort)
    }

    /// Keep the session key through the next teardown only.
    pub fn set_preserve_key_on_teardown(&self) -> LinkResult<()> {
        self.command(Command::PreserveKeyOnTeardown)
    }

    /// Make `mode` the active transport.
    pub fn switch_transport(&self, mode: TransportMode) -> LinkResult<()> {
        self.command(Command::SwitchTransport(mode))
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Input::Command(Command::Shutdown));
    }
}
