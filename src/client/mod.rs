//! Obsqura Link - Client API
//!
//! The [`LinkBuilder`] spawns the controller task; the caller drives it
//! through a [`LinkHandle`] and observes it through [`LinkEvents`].
//! Platform transports report back through [`EventSink`]s taken from the
//! [`Mailbox`] before spawning.

mod controller;
mod event;
mod handle;

pub use controller::LinkBuilder;
pub use event::*;
pub use handle::{EventSink, LinkHandle, Mailbox};
