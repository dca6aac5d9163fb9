//! Outbound transfer scheduling.
//!
//! One transfer is in flight at a time. Each fragment is submitted to the
//! active transport and the outcome decides what happens next:
//!
//! | Outcome               | Next step                                   |
//! |-----------------------|---------------------------------------------|
//! | busy (direct)         | same fragment after 50 ms, attempt not used |
//! | rejected (direct)     | same fragment after 100 ms                  |
//! | rejected (relay)      | same fragment after 200 ms                  |
//! | pending (direct)      | wait for the write completion               |
//! | completion failed     | same fragment after 200 ms                  |
//! | accepted / completed  | next fragment after 60 ms pacing            |
//!
//! A fragment that has used all its attempts halts the transfer.
//!
//! Every timer and write completion carries the [`Generation`] that was
//! current when it was issued. [`SendScheduler::abort`] bumps the
//! generation, so anything belonging to an older transfer is ignored.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::core::SendError;
use crate::crypto::{OwnerId, SessionKeyStore};
use crate::transport::{Fragment, Framer, MessageId, MessageType, Submission, Transport, TransportKind};

/// Cancellation epoch of the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    /// The generation after this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Raw counter value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A logical message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Message type.
    pub message_type: MessageType,
    /// Message id.
    pub msg_id: MessageId,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Create a message with a fresh random id.
    pub fn new(message_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(message_type, MessageId::random(), payload)
    }

    /// Create a message with an explicit id.
    pub fn with_id(message_type: MessageType, msg_id: MessageId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type,
            msg_id,
            payload: payload.into(),
        }
    }
}

/// Per-transfer delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Fragments in the transfer.
    pub total: usize,
    /// Fragments delivered.
    pub succeeded: usize,
    /// Fragments that exhausted their attempts.
    pub failed: usize,
    /// Fragments that needed more than one attempt.
    pub retried: usize,
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} ok={} failed={} retried={}",
            self.total, self.succeeded, self.failed, self.retried
        )
    }
}

/// Side effects requested by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Call [`SendScheduler::send_fragment_at`] with these arguments after `after`.
    Schedule {
        /// Fragment index.
        index: u8,
        /// Generation the timer belongs to.
        generation: Generation,
        /// Delay.
        after: Duration,
    },
    /// Send progress.
    Progress {
        /// Fragments delivered.
        sent: usize,
        /// Fragments in the transfer.
        total: usize,
    },
    /// The transfer was delivered in full.
    Completed {
        /// Message id.
        msg_id: MessageId,
        /// Message type.
        message_type: MessageType,
        /// Counts.
        summary: TransferSummary,
    },
    /// The transfer was abandoned.
    Failed {
        /// Message id.
        msg_id: MessageId,
        /// Message type.
        message_type: MessageType,
        /// Fragment that exhausted its attempts.
        index: u8,
        /// Counts.
        summary: TransferSummary,
    },
    /// Human-readable diagnostic line.
    Diagnostic(String),
}

/// Delivery timers and caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Delay before the next fragment after a delivered one.
    pub pacing: Duration,
    /// Re-attempt delay while a write is in flight.
    pub busy_retry: Duration,
    /// Retry delay after a refused direct write.
    pub submit_retry: Duration,
    /// Retry delay after a failed write completion.
    pub ack_retry: Duration,
    /// Retry delay after a refused relay send.
    pub relay_retry: Duration,
    /// Attempts per fragment.
    pub max_attempts: u8,
}

impl DeliveryPolicy {
    /// Build from the link configuration.
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            pacing: config.timing.pacing(),
            busy_retry: config.timing.busy_retry(),
            submit_retry: config.timing.submit_retry(),
            ack_retry: config.timing.ack_retry(),
            relay_retry: config.timing.relay_retry(),
            max_attempts: config.retry.max_fragment_attempts,
        }
    }

    fn reject_delay(&self, kind: TransportKind) -> Duration {
        match kind {
            TransportKind::Direct => self.submit_retry,
            TransportKind::Relay => self.relay_retry,
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

#[derive(Debug)]
struct QueuedTransfer {
    message_type: MessageType,
    msg_id: MessageId,
    fragments: Vec<Fragment>,
}

/// The transfer currently being delivered.
#[derive(Debug)]
pub struct InFlightSend {
    fragments: Vec<Fragment>,
    current_index: usize,
    attempts: Vec<u8>,
    generation: Generation,
    msg_id: MessageId,
    message_type: MessageType,
}

impl InFlightSend {
    /// Index of the fragment being delivered.
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Fragments in the transfer.
    pub fn total(&self) -> usize {
        self.fragments.len()
    }

    /// Generation the transfer was started under.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Message id.
    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }

    /// Message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Attempts used on fragment `index`.
    pub fn attempts(&self, index: usize) -> u8 {
        self.attempts.get(index).copied().unwrap_or(0)
    }

    fn summary(&self, failed: usize) -> TransferSummary {
        TransferSummary {
            total: self.fragments.len(),
            succeeded: self.current_index,
            failed,
            retried: self.attempts.iter().filter(|&&a| a > 1).count(),
        }
    }
}

/// Owns the outbound transfer, its retries and the cancellation generation.
#[derive(Debug)]
pub struct SendScheduler {
    policy: DeliveryPolicy,
    generation: Generation,
    in_flight: Option<InFlightSend>,
    queue: VecDeque<QueuedTransfer>,
}

impl SendScheduler {
    /// Create an idle scheduler.
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            policy,
            generation: Generation::default(),
            in_flight: None,
            queue: VecDeque::new(),
        }
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// The transfer in flight, if any.
    pub fn in_flight(&self) -> Option<&InFlightSend> {
        self.in_flight.as_ref()
    }

    /// Whether nothing is in flight or queued.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    /// Messages waiting behind the current transfer.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Frame and start sending `message`, or queue it behind the current
    /// transfer.
    ///
    /// A [`MessageType::SecureMessage`] is refused with
    /// [`SendError::KeyMissing`] when `owner` has no session key.
    pub fn send_large_message(
        &mut self,
        message: OutboundMessage,
        keys: &SessionKeyStore,
        owner: &OwnerId,
        transport: &mut dyn Transport,
    ) -> Result<Vec<SchedulerAction>, SendError> {
        if message.message_type == MessageType::SecureMessage && !keys.contains(owner) {
            warn!(owner = %owner, msg_id = %message.msg_id, "secure send without session key");
            return Err(SendError::KeyMissing {
                owner: owner.clone(),
            });
        }

        let fragments = Framer::split(&message.payload, message.message_type, message.msg_id)?;
        let transfer = QueuedTransfer {
            message_type: message.message_type,
            msg_id: message.msg_id,
            fragments,
        };

        let mut actions = Vec::new();
        if self.in_flight.is_some() {
            debug!(msg_id = %transfer.msg_id, queued = self.queue.len() + 1, "transfer queued");
            self.queue.push_back(transfer);
        } else {
            self.begin(transfer, transport, &mut actions);
        }
        Ok(actions)
    }

    fn begin(&mut self, transfer: QueuedTransfer, transport: &mut dyn Transport, actions: &mut Vec<SchedulerAction>) {
        let total = transfer.fragments.len();
        info!(
            msg_id = %transfer.msg_id,
            message_type = ?transfer.message_type,
            total,
            generation = %self.generation,
            transport = %transport.kind(),
            "transfer started"
        );
        actions.push(SchedulerAction::Progress { sent: 0, total });
        actions.push(SchedulerAction::Diagnostic(format!(
            "send {:?} msg_id={} fragments={total} via {}",
            transfer.message_type,
            transfer.msg_id,
            transport.kind()
        )));

        self.in_flight = Some(InFlightSend {
            attempts: vec![0; total],
            fragments: transfer.fragments,
            current_index: 0,
            generation: self.generation,
            msg_id: transfer.msg_id,
            message_type: transfer.message_type,
        });
        self.dispatch(0, self.generation, transport, actions);
    }

    /// Submit fragment `index` of the transfer started under `generation`.
    ///
    /// Does nothing if the generation is stale.
    pub fn send_fragment_at(
        &mut self,
        index: u8,
        generation: Generation,
        transport: &mut dyn Transport,
    ) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        self.dispatch(index, generation, transport, &mut actions);
        actions
    }

    fn dispatch(
        &mut self,
        index: u8,
        generation: Generation,
        transport: &mut dyn Transport,
        actions: &mut Vec<SchedulerAction>,
    ) {
        if generation != self.generation {
            debug!(%generation, current = %self.generation, index, "stale fragment timer ignored");
            return;
        }
        let policy = self.policy;
        let Some(send) = self.in_flight.as_mut() else {
            return;
        };
        let i = index as usize;
        if i != send.current_index {
            debug!(index, current = send.current_index, "out-of-turn fragment timer ignored");
            return;
        }

        if send.attempts[i] >= policy.max_attempts {
            self.fail(index, transport, actions);
            return;
        }

        let submission = transport.submit(generation, &send.fragments[i]);
        if submission != Submission::Busy {
            send.attempts[i] += 1;
        }
        debug!(
            msg_id = %send.msg_id,
            index,
            total = send.fragments.len(),
            attempt = send.attempts[i],
            ?submission,
            "fragment submitted"
        );

        match submission {
            Submission::Busy => actions.push(SchedulerAction::Schedule {
                index,
                generation,
                after: policy.busy_retry,
            }),
            Submission::Rejected => {
                warn!(msg_id = %send.msg_id, index, attempt = send.attempts[i], "fragment refused, retrying");
                actions.push(SchedulerAction::Schedule {
                    index,
                    generation,
                    after: policy.reject_delay(transport.kind()),
                });
            }
            Submission::Pending => {}
            Submission::Accepted => self.advance(transport, actions),
        }
    }

    /// Handle a write completion issued under `generation`.
    pub fn on_write_ack(
        &mut self,
        generation: Generation,
        success: bool,
        transport: &mut dyn Transport,
    ) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        if generation != self.generation {
            debug!(%generation, current = %self.generation, "stale write completion ignored");
            return actions;
        }
        let Some(send) = self.in_flight.as_ref() else {
            return actions;
        };

        if success {
            self.advance(transport, &mut actions);
        } else {
            let index = send.current_index as u8;
            warn!(msg_id = %send.msg_id, index, "write completion failed, retrying");
            actions.push(SchedulerAction::Schedule {
                index,
                generation,
                after: self.policy.ack_retry,
            });
        }
        actions
    }

    fn advance(&mut self, transport: &mut dyn Transport, actions: &mut Vec<SchedulerAction>) {
        let Some(send) = self.in_flight.as_mut() else {
            return;
        };
        send.current_index += 1;
        let total = send.fragments.len();
        actions.push(SchedulerAction::Progress {
            sent: send.current_index,
            total,
        });

        if send.current_index < total {
            actions.push(SchedulerAction::Schedule {
                index: send.current_index as u8,
                generation: send.generation,
                after: self.policy.pacing,
            });
            return;
        }

        let summary = send.summary(0);
        info!(msg_id = %send.msg_id, %summary, "transfer complete");
        actions.push(SchedulerAction::Completed {
            msg_id: send.msg_id,
            message_type: send.message_type,
            summary,
        });
        actions.push(SchedulerAction::Diagnostic(format!("msg_id={} done: {summary}", send.msg_id)));
        self.in_flight = None;
        self.start_next(transport, actions);
    }

    fn fail(&mut self, index: u8, transport: &mut dyn Transport, actions: &mut Vec<SchedulerAction>) {
        let Some(send) = self.in_flight.take() else {
            return;
        };
        let summary = send.summary(1);
        error!(msg_id = %send.msg_id, index, %summary, "fragment attempts exhausted, transfer abandoned");
        actions.push(SchedulerAction::Failed {
            msg_id: send.msg_id,
            message_type: send.message_type,
            index,
            summary,
        });
        actions.push(SchedulerAction::Diagnostic(format!(
            "msg_id={} failed at fragment {index}: {summary}",
            send.msg_id
        )));
        self.start_next(transport, actions);
    }

    fn start_next(&mut self, transport: &mut dyn Transport, actions: &mut Vec<SchedulerAction>) {
        if let Some(next) = self.queue.pop_front() {
            self.begin(next, transport, actions);
        }
    }

    /// Cancel the transfer and the queue; invalidate every pending timer and
    /// completion.
    pub fn abort(&mut self) -> Vec<SchedulerAction> {
        self.generation = self.generation.next();
        if let Some(send) = self.in_flight.take() {
            info!(msg_id = %send.msg_id, generation = %self.generation, "transfer aborted");
        }
        self.queue.clear();
        vec![SchedulerAction::Progress { sent: 0, total: 0 }]
    }
}
