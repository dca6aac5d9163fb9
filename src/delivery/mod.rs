//! Obsqura Link - Delivery Layer
//!
//! At-least-once delivery of framed messages over whichever transport is
//! active, with per-fragment retry caps, pacing and generation-based
//! cancellation. See [`SendScheduler`].

mod scheduler;

pub use scheduler::*;
