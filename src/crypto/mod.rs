//! Obsqura Link - Security Layer
//!
//! - **Session keys**: [`SessionKey`] (zeroized on drop) and the per-owner
//!   [`SessionKeyStore`] with its one-shot preserve flag
//! - **AEAD**: [`Aes256GcmCipher`] and [`ChaCha20Poly1305Cipher`] sealing to
//!   `nonce || ciphertext || tag`
//! - **Handshake**: [`HandshakeOrchestrator`] sequencing the KEM exchange
//!
//! The KEM itself is external; see [`crate::core::Kem`].

mod aead;
mod handshake;
mod keys;

pub use aead::*;
pub use handshake::*;
pub use keys::*;
