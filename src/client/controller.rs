//! The link controller task.
//!
//! `LinkController` is the single owner of protocol state. It runs on one
//! tokio task and reacts to mailbox inputs in arrival order; nothing else
//! mutates the scheduler, reassembly buffer, key store, handshake or
//! connection state. Timers are short-lived tasks posting back into the
//! mailbox, and the KEM runs on the blocking pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::event::{LinkEvent, LinkEvents, RejectReason};
use super::handle::{Command, Input, LinkHandle, Mailbox, Timer};
use crate::config::LinkConfig;
use crate::core::{Aead, CODE_OPEN_FAILED, HandshakeError, Kem, LinkResult, SendError};
use crate::crypto::{
    Encapsulation, EncapsulationJob, HandshakeOrchestrator, OwnerId, SessionKeyStore, cipher_for,
};
use crate::delivery::{DeliveryPolicy, OutboundMessage, SchedulerAction, SendScheduler};
use crate::transport::{
    Accepted, CompletedMessage, ConnectionAction, ConnectionState, ConnectionStateMachine,
    MessageId, MessageType, ReassemblyBuffer, RelayInbound, Transport, TransportError,
    TransportEvent, TransportKind, TransportMode, decode_relay_text,
};

/// Owner id used for direct-mode key lookups before any peer was chosen.
const UNBOUND_OWNER: &str = "unbound";

/// Builder for a running link controller.
///
/// # Example
///
/// ```ignore
/// let mailbox = Mailbox::new();
/// let direct = DirectTransport::new(BleLink::new(mailbox.sink(TransportKind::Direct)));
/// let relay = RelayTransport::new(WsChannel::new(mailbox.sink(TransportKind::Relay)), &config.relay);
///
/// let (link, mut events) = LinkBuilder::new(config, Arc::new(KyberFfi))
///     .direct(direct)
///     .relay(relay)
///     .spawn(mailbox)?;
///
/// link.connect("AA:BB:CC:DD:EE:FF")?;
/// ```
pub struct LinkBuilder {
    config: LinkConfig,
    kem: Arc<dyn Kem>,
    direct: Option<Box<dyn Transport>>,
    relay: Option<Box<dyn Transport>>,
    mode: TransportMode,
}

impl LinkBuilder {
    /// Start a builder with the KEM capability.
    pub fn new(config: LinkConfig, kem: Arc<dyn Kem>) -> Self {
        Self {
            config,
            kem,
            direct: None,
            relay: None,
            mode: TransportMode::Direct,
        }
    }

    /// Set the direct transport.
    pub fn direct(mut self, transport: impl Transport) -> Self {
        self.direct = Some(Box::new(transport));
        self
    }

    /// Set the relay transport.
    pub fn relay(mut self, transport: impl Transport) -> Self {
        self.relay = Some(Box::new(transport));
        self
    }

    /// Transport active at start. Defaults to direct.
    pub fn mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Spawn the controller on the current tokio runtime.
    ///
    /// Fails if the configuration is invalid or the configured cipher suite
    /// is not compiled in.
    pub fn spawn(self, mailbox: Mailbox) -> LinkResult<(LinkHandle, LinkEvents)> {
        self.config.validate()?;
        let aead = cipher_for(self.config.crypto.cipher_suite)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let Mailbox { tx, rx } = mailbox;

        let controller = LinkController {
            scheduler: SendScheduler::new(DeliveryPolicy::from_config(&self.config)),
            reassembly: ReassemblyBuffer::new(),
            keys: SessionKeyStore::new(),
            connection: ConnectionStateMachine::new(&self.config),
            handshake: HandshakeOrchestrator::new(&self.config.handshake),
            direct: self.direct,
            relay: self.relay,
            mode: self.mode,
            kem: self.kem,
            aead,
            config: self.config,
            tx: tx.clone(),
            events: events_tx,
            state: state_tx,
        };
        info!(mode = %controller.mode, cipher = controller.aead.name(), "link controller starting");
        tokio::spawn(controller.run(rx));

        Ok((
            LinkHandle { tx, state: state_rx },
            LinkEvents { rx: events_rx },
        ))
    }
}

/// Pick the active transport out of the two slots.
fn active<'a>(
    mode: TransportMode,
    direct: &'a mut Option<Box<dyn Transport>>,
    relay: &'a mut Option<Box<dyn Transport>>,
) -> Option<&'a mut (dyn Transport + 'static)> {
    match mode {
        TransportKind::Direct => direct.as_deref_mut(),
        TransportKind::Relay => relay.as_deref_mut(),
    }
}

/// Log inbound data that could not be used. Nothing is sent back.
fn drop_inbound(kind: TransportKind, len: usize, e: &TransportError) {
    if e.is_silent_drop() {
        warn!(%kind, len, "dropping inbound data: {e}");
    } else {
        error!(%kind, len, "inbound data failed: {e}");
    }
}

/// Single-task owner of all protocol state.
struct LinkController {
    config: LinkConfig,
    direct: Option<Box<dyn Transport>>,
    relay: Option<Box<dyn Transport>>,
    mode: TransportMode,
    kem: Arc<dyn Kem>,
    aead: Box<dyn Aead>,
    scheduler: SendScheduler,
    reassembly: ReassemblyBuffer,
    keys: SessionKeyStore,
    connection: ConnectionStateMachine,
    handshake: HandshakeOrchestrator,
    tx: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Sender<ConnectionState>,
}

impl LinkController {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = rx.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        info!("link controller stopped");
    }

    /// Process one input. Returns `false` when the controller should stop.
    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(command) => return self.on_command(command),
            Input::Transport { kind, event } => self.on_transport(kind, event),
            Input::Timer(timer) => self.on_timer(timer),
            Input::Encapsulated { job, result } => self.on_encapsulated(job, result),
        }
        true
    }

    fn emit(&self, event: LinkEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn diagnostic(&self, line: impl Into<String>) {
        self.emit(LinkEvent::Diagnostic(line.into()));
    }

    /// Owner whose session key protects traffic on the active transport.
    fn active_owner(&self) -> OwnerId {
        match self.mode {
            TransportKind::Relay => OwnerId::new(self.config.relay.session.clone()),
            TransportKind::Direct => self
                .connection
                .peer()
                .cloned()
                .unwrap_or_else(|| OwnerId::new(UNBOUND_OWNER)),
        }
    }

    fn owner_for(&self, peer: &OwnerId) -> OwnerId {
        match self.mode {
            TransportKind::Relay => OwnerId::new(self.config.relay.session.clone()),
            TransportKind::Direct => peer.clone(),
        }
    }

    fn arm(&self, after: Duration, timer: Timer) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Input::Timer(timer));
        });
    }

    // Commands

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(peer) => {
                let actions = self.connection.connect(peer);
                self.apply_connection(actions);
            }
            Command::Disconnect => {
                let actions = self.connection.disconnect();
                self.apply_connection(actions);
            }
            Command::Send { message, reply } => {
                let _ = reply.send(self.start_send(message));
            }
            Command::SendSecureText { text, reply } => {
                let result = self
                    .seal_text(&text)
                    .and_then(|sealed| self.start_send(OutboundMessage::new(MessageType::SecureMessage, sealed)));
                let _ = reply.send(result);
            }
            Command::RequestHandshake { reply } => {
                let _ = reply.send(self.request_handshake());
            }
            Command::Abort => {
                self.abort_transfers();
                self.diagnostic("transfer aborted");
            }
            Command::PreserveKeyOnTeardown => self.keys.preserve_on_next_teardown(),
            Command::SwitchTransport(mode) => self.switch_transport(mode),
            Command::Shutdown => {
                let actions = self.connection.disconnect();
                self.apply_connection(actions);
                return false;
            }
        }
        true
    }

    fn start_send(&mut self, message: OutboundMessage) -> Result<MessageId, SendError> {
        let msg_id = message.msg_id;
        let owner = self.active_owner();
        let Some(transport) = active(self.mode, &mut self.direct, &mut self.relay) else {
            warn!(mode = %self.mode, "no transport configured for active mode");
            return Err(SendError::NoTransport(self.mode));
        };
        let actions = self
            .scheduler
            .send_large_message(message, &self.keys, &owner, transport)?;
        self.apply_scheduler(actions);
        Ok(msg_id)
    }

    fn seal_text(&self, text: &str) -> Result<Vec<u8>, SendError> {
        let owner = self.active_owner();
        let Some(key) = self.keys.load(&owner) else {
            warn!(owner = %owner, "secure text without session key");
            return Err(SendError::KeyMissing { owner });
        };
        Ok(self.aead.seal(key, text.as_bytes())?)
    }

    fn request_handshake(&mut self) -> Result<MessageId, SendError> {
        let payload = self.config.handshake.request_payload.clone().into_bytes();
        // A relay send can complete before start_send returns.
        self.handshake.on_request_sent();
        let msg_id = match self.start_send(OutboundMessage::new(MessageType::KeyRequest, payload)) {
            Ok(msg_id) => msg_id,
            Err(e) => {
                self.handshake.abort();
                return Err(e);
            }
        };
        if let Some(transport) = active(self.mode, &mut self.direct, &mut self.relay) {
            if let Err(e) = transport.request_public_key() {
                warn!("public key request command failed: {e}");
            }
        }
        Ok(msg_id)
    }

    fn abort_transfers(&mut self) {
        let actions = self.scheduler.abort();
        self.apply_scheduler(actions);
        self.reassembly.reset();
        self.handshake.abort();
    }

    fn switch_transport(&mut self, mode: TransportMode) {
        if mode == self.mode {
            return;
        }
        let carry_key = self.keys.is_preserve_armed();
        let from = self.active_owner();

        // Tear down the old transport while it is still the active one.
        let actions = self.connection.disconnect();
        self.apply_connection(actions);
        self.abort_transfers();
        info!(from = %self.mode, to = %mode, "switching transport");
        self.mode = mode;

        let to = self.active_owner();
        if carry_key && self.keys.rehome(&from, &to) {
            self.diagnostic(format!("session key carried from {from} to {to}"));
        }
        self.diagnostic(format!("active transport: {mode}"));
    }

    // Transport callbacks

    fn on_transport(&mut self, kind: TransportKind, event: TransportEvent) {
        match event {
            TransportEvent::WriteComplete { success } => {
                let slot = match kind {
                    TransportKind::Direct => self.direct.as_deref_mut(),
                    TransportKind::Relay => self.relay.as_deref_mut(),
                };
                let Some(generation) = slot.and_then(|t| t.complete_write()) else {
                    debug!(%kind, "write completion without a write in flight");
                    return;
                };
                let Some(transport) = active(self.mode, &mut self.direct, &mut self.relay) else {
                    return;
                };
                let actions = self.scheduler.on_write_ack(generation, success, transport);
                self.apply_scheduler(actions);
            }
            _ if kind != self.mode => {
                debug!(%kind, ?event, "event from inactive transport ignored");
            }
            TransportEvent::Inbound(bytes) => self.on_inbound(kind, &bytes),
            TransportEvent::RelayText(text) => self.on_relay_text(kind, &text),
            TransportEvent::LinkUp => {
                let actions = self.connection.on_link_up();
                self.apply_connection(actions);
            }
            TransportEvent::DiscoveryComplete => {
                let actions = self.connection.on_discovery_complete();
                self.apply_connection(actions);
            }
            TransportEvent::LinkDown { user_initiated, code } => {
                let actions = self.connection.on_link_down(user_initiated, code);
                self.apply_connection(actions);
            }
        }
    }

    fn on_relay_text(&mut self, kind: TransportKind, text: &str) {
        match decode_relay_text(text) {
            Ok(RelayInbound::Fragment(bytes)) => self.on_inbound(kind, &bytes),
            Ok(RelayInbound::Ready { session }) => {
                debug!(?session, "relay ready");
                self.on_transport(kind, TransportEvent::DiscoveryComplete);
            }
            Ok(RelayInbound::Status { session, status, msg_id }) => {
                info!(?session, %status, ?msg_id, "relay peer status");
                self.emit(LinkEvent::RelayStatus { session, status, msg_id });
            }
            Err(e) => drop_inbound(kind, text.len(), &e),
        }
    }

    fn on_inbound(&mut self, kind: TransportKind, bytes: &[u8]) {
        match self.reassembly.accept_bytes(bytes) {
            Err(e) => drop_inbound(kind, bytes.len(), &TransportError::from(e)),
            Ok(Accepted::Duplicate { .. }) => {}
            Ok(Accepted::Partial { received, total }) => {
                self.emit(LinkEvent::ReceiveProgress { received, total });
            }
            Ok(Accepted::Complete { total, message }) => {
                // Once for the last fragment, once for the completed message.
                for _ in 0..2 {
                    self.emit(LinkEvent::ReceiveProgress {
                        received: total,
                        total,
                    });
                }
                self.dispatch_message(message);
            }
        }
    }

    fn dispatch_message(&mut self, message: CompletedMessage) {
        let CompletedMessage {
            message_type,
            msg_id,
            payload,
        } = message;
        match message_type {
            MessageType::SecureMessage => self.open_secure(msg_id, &payload),
            MessageType::KeyRequest => {
                let owner = self.active_owner();
                match self.handshake.on_public_key(owner, payload) {
                    Ok(job) => self.spawn_encapsulation(job),
                    Err(e) => self.emit(LinkEvent::HandshakeFailed(e)),
                }
            }
            MessageType::PlainMessage | MessageType::KeyCiphertext => {
                self.emit(LinkEvent::Message {
                    message_type,
                    msg_id,
                    payload,
                });
            }
        }
    }

    fn open_secure(&self, msg_id: MessageId, payload: &[u8]) {
        let owner = self.active_owner();
        let Some(key) = self.keys.load(&owner) else {
            warn!(owner = %owner, %msg_id, "secure message without session key, discarded");
            self.emit(LinkEvent::MessageRejected {
                msg_id,
                reason: RejectReason::KeyMissing,
            });
            return;
        };
        match self.aead.open_bytes(key, payload) {
            Ok(plaintext) => self.emit(LinkEvent::SecureMessage { msg_id, plaintext }),
            Err(e) => {
                warn!(owner = %owner, %msg_id, len = payload.len(), "secure message discarded: {e}");
                self.emit(LinkEvent::MessageRejected {
                    msg_id,
                    reason: RejectReason::Crypto(e),
                });
            }
        }
    }

    // Handshake

    fn spawn_encapsulation(&self, job: EncapsulationJob) {
        let kem = Arc::clone(&self.kem);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let worker_job = job.clone();
            let result = match tokio::task::spawn_blocking(move || worker_job.run(&kem)).await {
                Ok(result) => result.map_err(HandshakeError::from),
                Err(e) => Err(HandshakeError::Worker(e.to_string())),
            };
            let _ = tx.send(Input::Encapsulated { job, result });
        });
    }

    fn on_encapsulated(
        &mut self,
        job: EncapsulationJob,
        result: Result<Encapsulation, HandshakeError>,
    ) {
        let completion = match self.handshake.on_encapsulated(job, result) {
            Ok(Some(completion)) => completion,
            Ok(None) => return,
            Err(e) => {
                self.emit(LinkEvent::HandshakeFailed(e));
                return;
            }
        };

        let owner = completion.owner;
        let encapsulation = completion.encapsulation;
        self.keys.save(&owner, encapsulation.shared_secret);
        self.emit(LinkEvent::KeyEstablished { owner });

        let message = OutboundMessage::new(MessageType::KeyCiphertext, encapsulation.ciphertext);
        if let Err(e) = self.start_send(message) {
            error!("could not send key ciphertext: {e}");
            self.handshake.abort();
            self.emit(LinkEvent::HandshakeFailed(HandshakeError::DeliveryFailed));
        }
    }

    // Timers

    fn on_timer(&mut self, timer: Timer) {
        let actions = match timer {
            Timer::Fragment { index, generation } => {
                let Some(transport) = active(self.mode, &mut self.direct, &mut self.relay) else {
                    return;
                };
                let actions = self.scheduler.send_fragment_at(index, generation, transport);
                self.apply_scheduler(actions);
                return;
            }
            Timer::Watchdog { kind, epoch } => self.connection.on_watchdog(kind, epoch),
            Timer::Reconnect { epoch } => self.connection.on_reconnect_timer(epoch),
        };
        self.apply_connection(actions);
    }

    // Side effects

    fn apply_scheduler(&mut self, actions: Vec<SchedulerAction>) {
        for action in actions {
            match action {
                SchedulerAction::Schedule {
                    index,
                    generation,
                    after,
                } => self.arm(after, Timer::Fragment { index, generation }),
                SchedulerAction::Progress { sent, total } => {
                    self.emit(LinkEvent::SendProgress { sent, total });
                }
                SchedulerAction::Completed {
                    msg_id,
                    message_type,
                    summary,
                } => {
                    match message_type {
                        MessageType::KeyRequest => self.handshake.on_request_delivered(),
                        MessageType::KeyCiphertext => {
                            if self.handshake.on_ciphertext_delivered() {
                                self.emit(LinkEvent::HandshakeComplete);
                            }
                        }
                        _ => {}
                    }
                    self.emit(LinkEvent::TransferComplete {
                        msg_id,
                        message_type,
                        summary,
                    });
                }
                SchedulerAction::Failed {
                    msg_id,
                    message_type,
                    index,
                    summary,
                } => {
                    if matches!(message_type, MessageType::KeyRequest | MessageType::KeyCiphertext)
                        && self.handshake.is_active()
                    {
                        self.handshake.abort();
                        self.emit(LinkEvent::HandshakeFailed(HandshakeError::DeliveryFailed));
                    }
                    self.emit(LinkEvent::TransferFailed {
                        msg_id,
                        message_type,
                        index,
                        summary,
                    });
                }
                SchedulerAction::Diagnostic(line) => self.diagnostic(line),
            }
        }
    }

    fn apply_connection(&mut self, actions: Vec<ConnectionAction>) {
        let mut pending: VecDeque<ConnectionAction> = actions.into();
        while let Some(action) = pending.pop_front() {
            match action {
                ConnectionAction::OpenLink { peer } => {
                    let opened = match active(self.mode, &mut self.direct, &mut self.relay) {
                        Some(transport) => transport.open(&peer).map_err(|e| e.to_string()),
                        None => Err(format!("no {} transport configured", self.mode)),
                    };
                    if let Err(reason) = opened {
                        warn!(peer = %peer, "open failed: {reason}");
                        pending.extend(self.connection.on_link_down(false, Some(CODE_OPEN_FAILED)));
                    }
                }
                ConnectionAction::Discover => {
                    if let Some(transport) = active(self.mode, &mut self.direct, &mut self.relay) {
                        if let Err(e) = transport.discover() {
                            warn!("discovery failed to start: {e}");
                        }
                    }
                }
                ConnectionAction::TearDown => {
                    if let Some(transport) = active(self.mode, &mut self.direct, &mut self.relay) {
                        transport.close();
                    }
                }
                ConnectionAction::StartWatchdog { kind, epoch, after } => {
                    self.arm(after, Timer::Watchdog { kind, epoch });
                }
                ConnectionAction::ScheduleReconnect { epoch, after } => {
                    self.arm(after, Timer::Reconnect { epoch });
                }
                ConnectionAction::AbortTransfers => self.abort_transfers(),
                ConnectionAction::DropKey { peer } => {
                    let owner = self.owner_for(&peer);
                    self.keys.delete_on_teardown(&owner);
                }
                ConnectionAction::Emit(state) => {
                    self.state.send_replace(state);
                    if let ConnectionState::Failed { code } = state {
                        error!(code, "reconnect attempts exhausted");
                    }
                    self.emit(LinkEvent::StateChanged(state));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    use super::*;
    use crate::client::EventSink;
    use crate::core::{CryptoError, KemError, LinkError};
    use crate::crypto::{Aes256GcmCipher, SessionKey};
    use crate::transport::{
        DirectLink, DirectTransport, Fragment, Framer, RelayChannel, RelayTransport, TransportResult,
    };

    const SHARED_SECRET: [u8; 32] = [0x42; 32];
    const CIPHERTEXT: [u8; 768] = [0xC7; 768];

    type Log<T> = Arc<Mutex<Vec<T>>>;

    /// Direct link that comes up immediately and acknowledges every write.
    struct LoopbackLink {
        sink: EventSink,
        written: Log<Vec<u8>>,
    }

    impl DirectLink for LoopbackLink {
        fn connect(&mut self, _peer: &OwnerId) -> TransportResult<()> {
            self.sink.link_up();
            Ok(())
        }

        fn discover(&mut self) -> TransportResult<()> {
            self.sink.discovery_complete();
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn write(&mut self, bytes: &[u8]) -> bool {
            self.written.lock().unwrap().push(bytes.to_vec());
            self.sink.write_complete(true);
            true
        }
    }

    /// Relay channel whose proxy announces readiness on open.
    struct LoopbackChannel {
        sink: EventSink,
        sent: Log<String>,
    }

    impl RelayChannel for LoopbackChannel {
        fn open(&mut self) -> TransportResult<()> {
            self.sink.link_up();
            self.sink.relay_text(r#"{"type":"ready","session":"relay-session"}"#);
            Ok(())
        }

        fn close(&mut self) {}

        fn send_text(&mut self, text: &str) -> bool {
            self.sent.lock().unwrap().push(text.to_owned());
            true
        }
    }

    struct StubKem;

    impl Kem for StubKem {
        fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, KemError> {
            if public_key.iter().all(|b| *b == 0) {
                return Err(KemError::new("degenerate key"));
            }
            Ok(Encapsulation::new(
                CIPHERTEXT.to_vec(),
                SessionKey::from_bytes(SHARED_SECRET.to_vec()),
            ))
        }
    }

    struct Rig {
        link: LinkHandle,
        events: LinkEvents,
        direct: EventSink,
        relay: EventSink,
        written: Log<Vec<u8>>,
        relay_sent: Log<String>,
    }

    fn rig(mode: TransportMode) -> Rig {
        let config = LinkConfig::default();
        let mailbox = Mailbox::new();
        let direct = mailbox.sink(TransportKind::Direct);
        let relay = mailbox.sink(TransportKind::Relay);
        let written = Log::default();
        let relay_sent = Log::default();

        let (link, events) = LinkBuilder::new(config.clone(), Arc::new(StubKem))
            .direct(DirectTransport::new(LoopbackLink {
                sink: direct.clone(),
                written: Arc::clone(&written),
            }))
            .relay(RelayTransport::new(
                LoopbackChannel {
                    sink: relay.clone(),
                    sent: Arc::clone(&relay_sent),
                },
                &config.relay,
            ))
            .mode(mode)
            .spawn(mailbox)
            .unwrap();

        Rig {
            link,
            events,
            direct,
            relay,
            written,
            relay_sent,
        }
    }

    async fn wait_for(events: &mut LinkEvents, pred: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
        let wait = async {
            loop {
                let event = events.recv().await.expect("controller stopped");
                if pred(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .expect("event not observed")
    }

    async fn wait_ready(events: &mut LinkEvents) {
        wait_for(events, |e| {
            matches!(e, LinkEvent::StateChanged(ConnectionState::Connected { ready: true }))
        })
        .await;
    }

    async fn wait_transfer(events: &mut LinkEvents, message_type: MessageType) -> MessageId {
        match wait_for(events, |e| {
            matches!(e, LinkEvent::TransferComplete { message_type: t, .. } if *t == message_type)
        })
        .await
        {
            LinkEvent::TransferComplete { msg_id, .. } => msg_id,
            _ => unreachable!(),
        }
    }

    /// Push a message from the peer, fragment by fragment.
    fn deliver(sink: &EventSink, message_type: MessageType, id: u8, payload: &[u8]) {
        for fragment in Framer::split(payload, message_type, MessageId::new(id)).unwrap() {
            sink.notify(fragment.to_bytes());
        }
    }

    /// Messages the peer would reassemble from everything written so far.
    fn written_messages(written: &Log<Vec<u8>>) -> Vec<CompletedMessage> {
        let mut buffer = ReassemblyBuffer::new();
        let mut messages = Vec::new();
        for bytes in written.lock().unwrap().iter() {
            if let Ok(Accepted::Complete { message, .. }) = buffer.accept_bytes(bytes) {
                messages.push(message);
            }
        }
        messages
    }

    /// Messages the relay peer would reassemble from every envelope sent so far.
    fn relayed_messages(sent: &Log<String>) -> Vec<CompletedMessage> {
        let mut buffer = ReassemblyBuffer::new();
        let mut messages = Vec::new();
        for text in sent.lock().unwrap().iter() {
            let envelope: serde_json::Value = serde_json::from_str(text).unwrap();
            let Some(payload) = envelope["payload_b64"].as_str() else {
                continue;
            };
            if let Ok(Accepted::Complete { message, .. }) = buffer.accept_bytes(&BASE64.decode(payload).unwrap()) {
                messages.push(message);
            }
        }
        messages
    }

    /// Inbound relay envelope carrying raw fragment bytes.
    fn relay_envelope(bytes: &[u8]) -> String {
        format!(
            r#"{{"type":"relay","direction":"rpi->app","payload_b64":"{}"}}"#,
            BASE64.encode(bytes)
        )
    }

    async fn establish_key(rig: &mut Rig) {
        rig.link.request_handshake().await.unwrap();
        wait_transfer(&mut rig.events, MessageType::KeyRequest).await;
        deliver(&rig.direct, MessageType::KeyRequest, 0x33, &[0x9A; 800]);
        wait_for(&mut rig.events, |e| matches!(e, LinkEvent::HandshakeComplete)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_then_secure_roundtrip() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        assert!(rig.link.state().is_ready());

        rig.link.request_handshake().await.unwrap();
        wait_transfer(&mut rig.events, MessageType::KeyRequest).await;
        let sent = written_messages(&rig.written);
        assert_eq!(sent[0].message_type, MessageType::KeyRequest);
        assert_eq!(sent[0].payload, b"KYBER_REQ");

        deliver(&rig.direct, MessageType::KeyRequest, 0x33, &[0x9A; 800]);
        let established = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::KeyEstablished { .. })).await;
        assert_eq!(
            established,
            LinkEvent::KeyEstablished {
                owner: OwnerId::new("peer-1")
            }
        );
        wait_for(&mut rig.events, |e| matches!(e, LinkEvent::HandshakeComplete)).await;

        let sent = written_messages(&rig.written);
        let ct = sent
            .iter()
            .find(|m| m.message_type == MessageType::KeyCiphertext)
            .expect("ciphertext sent");
        assert_eq!(ct.payload, CIPHERTEXT);

        // Outbound secure text opens under the shared secret.
        let id = rig.link.send_secure_text("HELLO").await.unwrap();
        assert_eq!(wait_transfer(&mut rig.events, MessageType::SecureMessage).await, id);
        let sent = written_messages(&rig.written);
        let sealed = sent
            .iter()
            .find(|m| m.message_type == MessageType::SecureMessage)
            .expect("secure message sent");
        let key = SessionKey::from_bytes(SHARED_SECRET.to_vec());
        assert_eq!(Aes256GcmCipher.open_bytes(&key, &sealed.payload).unwrap(), b"HELLO");

        // Inbound secure text from the peer.
        let reply = Aes256GcmCipher.seal(&key, b"PONG").unwrap();
        deliver(&rig.direct, MessageType::SecureMessage, 0x40, &reply);
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::SecureMessage { .. })).await;
        assert_eq!(
            got,
            LinkEvent::SecureMessage {
                msg_id: MessageId::new(0x40),
                plaintext: b"PONG".to_vec()
            }
        );

        // Tampered ciphertext is discarded.
        let mut tampered = reply.clone();
        tampered[14] ^= 0x01;
        deliver(&rig.direct, MessageType::SecureMessage, 0x41, &tampered);
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::MessageRejected { .. })).await;
        assert_eq!(
            got,
            LinkEvent::MessageRejected {
                msg_id: MessageId::new(0x41),
                reason: RejectReason::Crypto(CryptoError::AuthenticationFailed)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_secure_text_requires_key() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;

        let err = rig.link.send_secure_text("HELLO").await.unwrap_err();
        assert!(matches!(err, LinkError::Send(SendError::KeyMissing { ref owner }) if owner.as_str() == "peer-1"));
        assert!(rig.written.lock().unwrap().is_empty());

        deliver(&rig.direct, MessageType::SecureMessage, 0x07, &[0u8; 40]);
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::MessageRejected { .. })).await;
        assert!(matches!(
            got,
            LinkEvent::MessageRejected {
                reason: RejectReason::KeyMissing,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_messages_both_ways() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;

        let text = "x".repeat(100);
        let id = rig.link.send_plain_text(&text).await.unwrap();
        let summary = match wait_for(&mut rig.events, |e| matches!(e, LinkEvent::TransferComplete { .. })).await {
            LinkEvent::TransferComplete { msg_id, summary, .. } => {
                assert_eq!(msg_id, id);
                summary
            }
            _ => unreachable!(),
        };
        assert_eq!(summary.total, 7);
        assert_eq!(summary.failed, 0);
        assert_eq!(rig.written.lock().unwrap().len(), 7);

        deliver(&rig.direct, MessageType::PlainMessage, 0x11, b"status: ok");
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::Message { .. })).await;
        assert_eq!(
            got,
            LinkEvent::Message {
                message_type: MessageType::PlainMessage,
                msg_id: MessageId::new(0x11),
                payload: b"status: ok".to_vec()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_public_key_fails_handshake() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;

        deliver(&rig.direct, MessageType::KeyRequest, 0x21, &[0x9A; 100]);
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::HandshakeFailed(_))).await;
        assert!(matches!(
            got,
            LinkEvent::HandshakeFailed(HandshakeError::InvalidPublicKey { len: 100, .. })
        ));

        // A failing KEM stores nothing and sends nothing.
        deliver(&rig.direct, MessageType::KeyRequest, 0x22, &[0x00; 800]);
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::HandshakeFailed(_))).await;
        assert!(matches!(got, LinkEvent::HandshakeFailed(HandshakeError::Encapsulation(_))));
        assert!(rig.link.send_secure_text("HELLO").await.is_err());
        assert!(written_messages(&rig.written).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_link_loss() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        establish_key(&mut rig).await;

        rig.direct.link_down(false, Some(8));
        let got = wait_for(&mut rig.events, |e| {
            matches!(e, LinkEvent::StateChanged(ConnectionState::Reconnecting { .. }))
        })
        .await;
        assert_eq!(
            got,
            LinkEvent::StateChanged(ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1)
            })
        );
        wait_ready(&mut rig.events).await;

        // The key survives a reconnect cycle.
        rig.link.send_secure_text("still here").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserve_key_is_one_shot() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        establish_key(&mut rig).await;

        rig.link.set_preserve_key_on_teardown().unwrap();
        rig.link.disconnect().unwrap();
        wait_for(&mut rig.events, |e| matches!(e, LinkEvent::StateChanged(ConnectionState::Disconnected))).await;
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        rig.link.send_secure_text("kept").await.unwrap();

        rig.link.disconnect().unwrap();
        wait_for(&mut rig.events, |e| matches!(e, LinkEvent::StateChanged(ConnectionState::Disconnected))).await;
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        let err = rig.link.send_secure_text("gone").await.unwrap_err();
        assert!(matches!(err, LinkError::Send(SendError::KeyMissing { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_mode_envelopes() {
        let mut rig = rig(TransportMode::Relay);
        rig.link.connect("ignored").unwrap();
        wait_ready(&mut rig.events).await;

        let id = rig.link.send_plain_text("hi").await.unwrap();
        wait_transfer(&mut rig.events, MessageType::PlainMessage).await;
        let sent = rig.relay_sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let envelope: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(envelope["kind"], "relay");
        assert_eq!(envelope["direction"], "app->rpi");
        assert_eq!(envelope["type_hint"], "legacy");
        let bytes = BASE64.decode(envelope["payload_b64"].as_str().unwrap()).unwrap();
        assert_eq!(bytes, [&[0x06, id.as_byte(), 0, 1][..], b"hi"].concat());

        rig.link.request_handshake().await.unwrap();
        wait_transfer(&mut rig.events, MessageType::KeyRequest).await;
        let sent = rig.relay_sent.lock().unwrap().clone();
        assert!(sent.contains(&r#"{"cmd":"request_pubkey","session":"relay-session"}"#.to_owned()));

        let fragment = Fragment {
            message_type: MessageType::PlainMessage,
            msg_id: MessageId::new(0x51),
            index: 0,
            total: 1,
            payload: b"pong".to_vec(),
        };
        rig.relay.relay_text(format!(
            r#"{{"type":"relay","direction":"rpi->app","payload_b64":"{}"}}"#,
            BASE64.encode(fragment.to_bytes())
        ));
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::Message { .. })).await;
        assert!(matches!(got, LinkEvent::Message { payload, .. } if payload == b"pong"));

        rig.relay
            .relay_text(r#"{"type":"rpi_status","session":"relay-session","status":"decrypted","msgId":81}"#);
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::RelayStatus { .. })).await;
        assert_eq!(
            got,
            LinkEvent::RelayStatus {
                session: Some("relay-session".into()),
                status: "decrypted".into(),
                msg_id: Some(81)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_transport() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;

        rig.link.switch_transport(TransportMode::Relay).unwrap();
        wait_for(&mut rig.events, |e| matches!(e, LinkEvent::StateChanged(ConnectionState::Disconnected))).await;
        wait_for(&mut rig.events, |e| matches!(e, LinkEvent::Diagnostic(line) if line.contains("relay"))).await;

        // Lifecycle events from the inactive transport are ignored.
        rig.direct.link_down(false, Some(8));
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        rig.link.send_plain_text("via relay").await.unwrap();
        wait_transfer(&mut rig.events, MessageType::PlainMessage).await;
        assert_eq!(rig.relay_sent.lock().unwrap().len(), 1);
        assert!(rig.written.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_transport_carries_preserved_key() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        establish_key(&mut rig).await;

        rig.link.set_preserve_key_on_teardown().unwrap();
        rig.link.switch_transport(TransportMode::Relay).unwrap();
        wait_for(&mut rig.events, |e| matches!(e, LinkEvent::StateChanged(ConnectionState::Disconnected))).await;
        wait_for(&mut rig.events, |e| {
            matches!(e, LinkEvent::Diagnostic(line) if line == "session key carried from peer-1 to relay-session")
        })
        .await;

        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        let id = rig.link.send_secure_text("after switch").await.unwrap();
        assert_eq!(wait_transfer(&mut rig.events, MessageType::SecureMessage).await, id);

        let sent = rig.relay_sent.lock().unwrap().clone();
        assert!(sent.iter().all(|text| text.contains(r#""type_hint":"secure""#)));
        let sealed = relayed_messages(&rig.relay_sent)
            .into_iter()
            .find(|m| m.message_type == MessageType::SecureMessage)
            .expect("secure message relayed");
        let key = SessionKey::from_bytes(SHARED_SECRET.to_vec());
        assert_eq!(Aes256GcmCipher.open_bytes(&key, &sealed.payload).unwrap(), b"after switch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_transport_drops_key_without_preserve() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        establish_key(&mut rig).await;

        rig.link.switch_transport(TransportMode::Relay).unwrap();
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;
        let err = rig.link.send_secure_text("after switch").await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::Send(SendError::KeyMissing { ref owner }) if owner.as_str() == "relay-session"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_transport_data_does_not_disturb_reassembly() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;

        let payload: Vec<u8> = (0..40).collect();
        let fragments = Framer::split(&payload, MessageType::PlainMessage, MessageId::new(0x12)).unwrap();
        assert_eq!(fragments.len(), 3);
        rig.direct.notify(fragments[0].to_bytes());
        rig.direct.notify(fragments[1].to_bytes());

        let stray = Fragment {
            message_type: MessageType::PlainMessage,
            msg_id: MessageId::new(9),
            index: 0,
            total: 1,
            payload: b"stray".to_vec(),
        };
        rig.relay.relay_text(relay_envelope(&stray.to_bytes()));
        rig.relay.notify(stray.to_bytes());
        rig.direct.notify(fragments[2].to_bytes());

        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::Message { .. })).await;
        assert_eq!(
            got,
            LinkEvent::Message {
                message_type: MessageType::PlainMessage,
                msg_id: MessageId::new(0x12),
                payload
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_relay_envelopes_are_dropped() {
        let mut rig = rig(TransportMode::Relay);
        rig.link.connect("ignored").unwrap();
        wait_ready(&mut rig.events).await;

        let payload = b"relay payload!!!then more".to_vec();
        let fragments = Framer::split(&payload, MessageType::PlainMessage, MessageId::new(0x60)).unwrap();
        assert_eq!(fragments.len(), 2);
        rig.relay.relay_text(relay_envelope(&fragments[0].to_bytes()));

        rig.relay.relay_text("not json");
        rig.relay.relay_text(r#"{"type":"relay","payload_b64":"%%%"}"#);
        rig.relay.relay_text(r#"{"type":"pubkey_fragment","msgId":1,"idx":5,"total":5,"payload_b64":""}"#);
        rig.relay.relay_text(relay_envelope(&[0x06, 0x60, 5, 5]));
        rig.relay.relay_text(relay_envelope(&[0x06, 0x60]));

        rig.relay.relay_text(relay_envelope(&fragments[1].to_bytes()));
        let got = wait_for(&mut rig.events, |e| matches!(e, LinkEvent::Message { .. })).await;
        assert_eq!(
            got,
            LinkEvent::Message {
                message_type: MessageType::PlainMessage,
                msg_id: MessageId::new(0x60),
                payload
            }
        );
        assert_eq!(rig.relay_sent.lock().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_progress_per_fragment_and_completion() {
        let mut rig = rig(TransportMode::Direct);
        rig.link.connect("peer-1").unwrap();
        wait_ready(&mut rig.events).await;

        let fragments = Framer::split(&[0x5A; 20], MessageType::PlainMessage, MessageId::new(0x70)).unwrap();
        assert_eq!(fragments.len(), 2);
        rig.direct.notify(fragments[0].to_bytes());
        rig.direct.notify(fragments[0].to_bytes());
        rig.direct.notify(fragments[1].to_bytes());

        let mut progress = Vec::new();
        loop {
            match wait_for(&mut rig.events, |e| {
                matches!(e, LinkEvent::ReceiveProgress { .. } | LinkEvent::Message { .. })
            })
            .await
            {
                LinkEvent::ReceiveProgress { received, total } => progress.push((received, total)),
                _ => break,
            }
        }
        assert_eq!(progress, [(1, 2), (2, 2), (2, 2)]);
    }
}
