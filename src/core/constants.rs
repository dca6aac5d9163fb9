//! Protocol constants for the Obsqura link.
//!
//! Wire sizes are fixed by the peripheral firmware and MUST NOT be changed.
//! Timing values are defaults; [`LinkConfig`](crate::config::LinkConfig) can override them.

use std::time::Duration;

// =============================================================================
// FRAGMENT WIRE FORMAT
// =============================================================================

/// Largest single write the link characteristic accepts.
pub const MAX_FRAGMENT_SIZE: usize = 20;

/// Fragment header size (type + msg_id + index + total).
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// Payload bytes carried by every fragment except possibly the last.
pub const FRAGMENT_PAYLOAD_SIZE: usize = MAX_FRAGMENT_SIZE - FRAGMENT_HEADER_SIZE;

/// Highest fragment count the one-byte `total` field can express.
pub const MAX_FRAGMENTS: usize = 255;

/// Largest payload a single logical message can carry.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAGMENTS * FRAGMENT_PAYLOAD_SIZE;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Public key request / public key response.
pub const MESSAGE_TYPE_KEY_REQUEST: u8 = 0x01;

/// Encapsulated shared secret.
pub const MESSAGE_TYPE_KEY_CIPHERTEXT: u8 = 0x02;

/// AEAD-sealed command or text.
pub const MESSAGE_TYPE_SECURE: u8 = 0x03;

/// Plaintext command or text.
pub const MESSAGE_TYPE_PLAIN: u8 = 0x06;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// AEAD nonce size.
pub const AEAD_NONCE_SIZE: usize = 12;

/// AEAD authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Symmetric key size used by both cipher suites.
pub const AEAD_KEY_SIZE: usize = 32;

/// Stored session keys shorter than this are treated as corrupt.
pub const MIN_SESSION_KEY_SIZE: usize = 32;

/// Fixed payload of a key request.
pub const KEY_REQUEST_PAYLOAD: &[u8] = b"KYBER_REQ";

/// Smallest byte length accepted as a peer public key.
pub const MIN_PUBLIC_KEY_SIZE: usize = 700;

/// Largest byte length accepted as a peer public key.
pub const MAX_PUBLIC_KEY_SIZE: usize = 1100;

// =============================================================================
// TIMING CONSTANTS - DELIVERY
// =============================================================================

/// Delay between an acknowledged fragment and the next one.
pub const PACING_DELAY: Duration = Duration::from_millis(60);

/// Re-attempt delay when a direct write is still in flight.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Retry delay when a direct write is refused at submission.
pub const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Retry delay when a direct write completes unsuccessfully.
pub const ACK_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Retry delay when the relay refuses a fragment.
pub const RELAY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Attempts allowed per fragment before the transfer is abandoned.
pub const MAX_FRAGMENT_ATTEMPTS: u8 = 3;

// =============================================================================
// TIMING CONSTANTS - CONNECTION
// =============================================================================

/// Watchdog for the link to come up after `connect`.
pub const CONNECT_WATCHDOG: Duration = Duration::from_secs(10);

/// Watchdog for capability discovery after the link is up.
pub const DISCOVERY_WATCHDOG: Duration = Duration::from_secs(10);

/// First reconnect delay.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 8;

/// Failure code reported when a watchdog forced the final reset.
pub const CODE_WATCHDOG_TIMEOUT: i32 = -1;

/// Failure code reported when the transport refused to open.
pub const CODE_OPEN_FAILED: i32 = -2;

// =============================================================================
// RELAY
// =============================================================================

/// Owner id under which relay-session keys are stored.
pub const DEFAULT_RELAY_SESSION: &str = "relay-session";

/// Direction tag stamped on outbound relay envelopes.
pub const DEFAULT_RELAY_DIRECTION: &str = "app->rpi";
