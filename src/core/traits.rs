//! Capability traits consumed by the link engine.
//!
//! The engine does not implement post-quantum key encapsulation or pick an
//! AEAD by itself; both are supplied by the embedding application through
//! these traits. [`crate::crypto`] ships two AEAD implementations.

use super::error::{CryptoError, KemError};
use crate::crypto::{Encapsulation, SealedMessage, SessionKey};

/// External key-encapsulation capability.
///
/// Implementations may be slow (lattice arithmetic on a phone CPU); the
/// controller always calls [`Kem::encapsulate`] from a blocking worker thread.
///
/// # Example
///
/// ```ignore
/// struct KyberFfi;
///
/// impl Kem for KyberFfi {
///     fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, KemError> {
///         let (ct, ss) = ffi::kyber512_enc(public_key).map_err(KemError::new)?;
///         Ok(Encapsulation::new(ct, SessionKey::from_bytes(ss)))
///     }
/// }
/// ```
pub trait Kem: Send + Sync + 'static {
    /// Encapsulate a fresh shared secret to `public_key`.
    ///
    /// Returns the ciphertext to hand back to the key owner and the shared
    /// secret to keep locally.
    fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, KemError>;
}

/// Authenticated encryption capability.
///
/// Wire format of a sealed message is exactly `nonce(12) || ciphertext || tag(16)`.
pub trait Aead: Send + Sync + 'static {
    /// Human-readable suite name, used in logs.
    fn name(&self) -> &'static str;

    /// Seal `plaintext` under `key` with a fresh random nonce.
    fn seal(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Open a sealed message.
    ///
    /// MUST return [`CryptoError::AuthenticationFailed`] for any modification
    /// of nonce, ciphertext or tag. Never relax this: a failed open is the
    /// protocol's tamper signal.
    fn open(&self, key: &SessionKey, sealed: &SealedMessage<'_>) -> Result<Vec<u8>, CryptoError>;

    /// Parse and open a `nonce || ciphertext || tag` buffer.
    fn open_bytes(&self, key: &SessionKey, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sealed = SealedMessage::parse(bytes)?;
        self.open(key, &sealed)
    }
}
