//! Relay transport.
//!
//! The relay is a text message channel (JSON envelopes) to a proxy that
//! forwards fragments to the peripheral. It has no per-write acknowledgment:
//! a send is accepted or refused on the spot, and the scheduler paces the
//! rest.
//!
//! Outbound fragment:
//!
//! ```json
//! {"kind":"relay","direction":"app->rpi","payload_b64":"BgQAAXBpbmc=","type_hint":"legacy"}
//! ```
//!
//! Inbound envelopes are tagged by `type`: `relay`, `pubkey_fragment`,
//! `ready` and `rpi_status`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::error::{TransportError, TransportResult};
use super::frame::{Fragment, MessageId, MessageType};
use super::link::{Submission, Transport, TransportKind};
use crate::config::RelayConfig;
use crate::core::{FRAGMENT_PAYLOAD_SIZE, MAX_FRAGMENTS};
use crate::crypto::OwnerId;
use crate::delivery::Generation;

/// Platform side of the relay connection.
///
/// Implementations deliver inbound text and lifecycle changes through an
/// [`EventSink`](crate::client::EventSink) created for
/// [`TransportKind::Relay`].
pub trait RelayChannel: Send + 'static {
    /// Begin opening the channel.
    fn open(&mut self) -> TransportResult<()>;

    /// Close the channel.
    fn close(&mut self);

    /// Send one text frame. Returns whether the channel accepted it.
    fn send_text(&mut self, text: &str) -> bool;
}

#[derive(Debug, Serialize)]
struct OutboundFragment<'a> {
    kind: &'static str,
    direction: &'a str,
    payload_b64: String,
    type_hint: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum RelayCommand<'a> {
    RequestPubkey { session: &'a str },
}

/// Inbound relay envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEnvelope {
    /// A complete fragment forwarded from the peer.
    Relay {
        /// Direction tag, e.g. `rpi->app`.
        #[serde(default)]
        direction: Option<String>,
        /// Base64 of the 4-byte header and payload.
        payload_b64: String,
    },
    /// One fragment of the peer's public key, header fields split out.
    PubkeyFragment {
        /// Relay session.
        #[serde(default)]
        session: Option<String>,
        /// Message id.
        #[serde(rename = "msgId")]
        msg_id: i64,
        /// Fragment index.
        idx: i64,
        /// Fragment count.
        total: i64,
        /// Base64 of the payload section only.
        payload_b64: String,
    },
    /// The proxy has reached the peer and is ready to forward.
    Ready {
        /// Relay session.
        #[serde(default)]
        session: Option<String>,
    },
    /// Peer status report.
    RpiStatus {
        /// Relay session.
        #[serde(default)]
        session: Option<String>,
        /// Status text.
        status: String,
        /// Message the status refers to.
        #[serde(default, rename = "msgId")]
        msg_id: Option<i64>,
    },
}

/// What an inbound envelope means to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInbound {
    /// Raw fragment bytes for reassembly.
    Fragment(Vec<u8>),
    /// Relay capability discovery is complete.
    Ready {
        /// Relay session, if given.
        session: Option<String>,
    },
    /// Diagnostic status from the peer.
    Status {
        /// Relay session, if given.
        session: Option<String>,
        /// Status text.
        status: String,
        /// Message the status refers to.
        msg_id: Option<i64>,
    },
}

impl RelayEnvelope {
    /// Parse an envelope from text.
    pub fn parse(text: &str) -> TransportResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Unwrap into fragment bytes or a control signal.
    pub fn into_inbound(self) -> TransportResult<RelayInbound> {
        match self {
            Self::Relay { payload_b64, .. } => Ok(RelayInbound::Fragment(BASE64.decode(payload_b64)?)),
            Self::PubkeyFragment {
                msg_id,
                idx,
                total,
                payload_b64,
                ..
            } => {
                let total = header_byte("total", total, 1, MAX_FRAGMENTS as i64)?;
                let index = header_byte("idx", idx, 0, i64::from(total) - 1)?;
                let payload = BASE64.decode(payload_b64)?;
                if payload.len() > FRAGMENT_PAYLOAD_SIZE {
                    return Err(TransportError::FieldOutOfRange {
                        field: "payload_b64",
                        value: payload.len() as i64,
                    });
                }
                let fragment = Fragment {
                    message_type: MessageType::KeyRequest,
                    msg_id: MessageId::new((msg_id & 0xFF) as u8),
                    index,
                    total,
                    payload,
                };
                Ok(RelayInbound::Fragment(fragment.to_bytes()))
            }
            Self::Ready { session } => Ok(RelayInbound::Ready { session }),
            Self::RpiStatus {
                session,
                status,
                msg_id,
            } => Ok(RelayInbound::Status {
                session,
                status,
                msg_id,
            }),
        }
    }
}

fn header_byte(field: &'static str, value: i64, min: i64, max: i64) -> TransportResult<u8> {
    if (min..=max).contains(&value) {
        Ok(value as u8)
    } else {
        Err(TransportError::FieldOutOfRange { field, value })
    }
}

/// Parse and unwrap one inbound relay text frame.
pub fn decode_relay_text(text: &str) -> TransportResult<RelayInbound> {
    RelayEnvelope::parse(text)?.into_inbound()
}

/// [`Transport`] over a [`RelayChannel`].
#[derive(Debug)]
pub struct RelayTransport<C> {
    channel: C,
    session: String,
    direction: String,
}

impl<C: RelayChannel> RelayTransport<C> {
    /// Wrap a relay channel.
    pub fn new(channel: C, config: &RelayConfig) -> Self {
        Self {
            channel,
            session: config.session.clone(),
            direction: config.direction.clone(),
        }
    }

    /// Relay session id.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Access the channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Encode a fragment as an outbound envelope.
    pub fn encode_fragment(&self, fragment: &Fragment) -> TransportResult<String> {
        let envelope = OutboundFragment {
            kind: "relay",
            direction: &self.direction,
            payload_b64: BASE64.encode(fragment.to_bytes()),
            type_hint: fragment.message_type.relay_hint(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

impl<C: RelayChannel> Transport for RelayTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn open(&mut self, _peer: &OwnerId) -> TransportResult<()> {
        self.channel.open()
    }

    fn discover(&mut self) -> TransportResult<()> {
        // The proxy announces readiness on its own with a `ready` envelope.
        Ok(())
    }

    fn close(&mut self) {
        self.channel.close();
    }

    fn submit(&mut self, generation: Generation, fragment: &Fragment) -> Submission {
        let text = match self.encode_fragment(fragment) {
            Ok(text) => text,
            Err(e) => {
                debug!(%generation, "relay encode failed: {e}");
                return Submission::Rejected;
            }
        };
        trace!(%generation, index = fragment.index, "relay send");
        if self.channel.send_text(&text) {
            Submission::Accepted
        } else {
            Submission::Rejected
        }
    }

    fn request_public_key(&mut self) -> TransportResult<()> {
        let command = serde_json::to_string(&RelayCommand::RequestPubkey {
            session: &self.session,
        })?;
        if self.channel.send_text(&command) {
            debug!(session = %self.session, "request_pubkey sent");
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}
