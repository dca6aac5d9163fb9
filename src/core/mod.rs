//! Core capability traits, constants, and error types for the Obsqura link.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;
