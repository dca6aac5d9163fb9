//! Obsqura Link - Transport Layer
//!
//! - **Framing**: [`Fragment`], [`Framer`] and the 4-byte header wire format
//! - **Reassembly**: [`ReassemblyBuffer`] with reset-on-new-message semantics
//! - **Transports**: the [`Transport`] trait, [`DirectTransport`] over a
//!   one-write-in-flight hardware link and [`RelayTransport`] over a JSON
//!   text channel
//! - **Connection supervision**: [`ConnectionStateMachine`] with watchdogs
//!   and [`ReconnectBackoff`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Controller (delivery, handshake)      │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │  fragments, reassembly, link lifecycle  │
//! ├────────────────────┬────────────────────┤
//! │  DirectLink (20 B) │  RelayChannel (JSON)│
//! └────────────────────┴────────────────────┘
//! ```

mod connection;
mod direct;
mod error;
mod frame;
mod link;
mod reassembly;
mod relay;
mod timing;

pub use connection::*;
pub use direct::*;
pub use error::*;
pub use frame::*;
pub use link::*;
pub use reassembly::*;
pub use relay::*;
pub use timing::ReconnectBackoff;
