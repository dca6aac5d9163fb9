//! # Obsqura Link
//!
//! Reliable, fragmented, end-to-end encrypted messaging over a narrow
//! point-to-point link (20-byte writes, one write in flight) with a
//! message-passing relay as an alternative transport.
//!
//! - **Framing**: messages up to 4080 bytes split into 4-byte-header fragments
//! - **Delivery**: paced, per-fragment retries, generation-based cancellation
//! - **Security**: KEM handshake, AEAD-sealed payloads, tamper detection
//! - **Supervision**: watchdogs and exponential reconnect backoff
//!
//! ## Feature Flags
//!
//! - `aes` (default): AES-256-GCM cipher suite
//! - `chacha` (default): ChaCha20-Poly1305 cipher suite
//!
//! ## Modules
//!
//! - [`core`]: Capability traits, constants, and error types
//! - [`config`]: Layered configuration (env, file, defaults)
//! - [`transport`]: Framing, reassembly, transports, connection state
//! - [`crypto`]: Session keys, AEAD suites, handshake orchestration
//! - [`delivery`]: The outbound send scheduler
//! - [`client`]: The controller task and its handle
//!
//! ## Example Usage
//!
//! ```ignore
//! use obsqura_link::prelude::*;
//!
//! let config = LinkConfig::load()?;
//! let mailbox = Mailbox::new();
//! let direct = DirectTransport::new(BleLink::new(mailbox.sink(TransportKind::Direct)));
//!
//! let (link, mut events) = LinkBuilder::new(config, Arc::new(KyberFfi))
//!     .direct(direct)
//!     .spawn(mailbox)?;
//!
//! link.connect("AA:BB:CC:DD:EE:FF")?;
//! link.request_handshake().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let LinkEvent::HandshakeComplete = event {
//!         link.send_secure_text("HELLO").await?;
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod config;
pub mod core;
pub mod crypto;
pub mod delivery;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::*;
    pub use crate::config::{CipherSuite, LinkConfig};
    pub use crate::core::*;
    pub use crate::crypto::*;
    pub use crate::delivery::{Generation, OutboundMessage, TransferSummary};
    pub use crate::transport::{
        ConnectionState, DirectLink, DirectTransport, MessageId, MessageType, RelayChannel,
        RelayTransport, Transport, TransportError, TransportKind, TransportMode,
        TransportResult,
    };
}

// Re-export commonly used items at crate root
pub use crate::client::{LinkBuilder, LinkEvent, LinkEvents, LinkHandle, Mailbox};
pub use crate::config::LinkConfig;
pub use crate::core::{LinkError, LinkResult};
