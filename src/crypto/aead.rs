//! AEAD sealing for secure messages.
//!
//! A sealed message on the wire is exactly:
//!
//! ```text
//! [ nonce (12) | ciphertext (n) | tag (16) ]
//! ```
//!
//! Nonces are drawn fresh from the OS RNG for every seal. No associated data
//! is bound; the peripheral firmware does not use any.

use std::fmt;

use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroize;

use crate::config::CipherSuite;
use crate::core::{AEAD_KEY_SIZE, AEAD_NONCE_SIZE, AEAD_TAG_SIZE, Aead, CryptoError, MIN_SESSION_KEY_SIZE};

/// Symmetric session key, as produced by the KEM.
///
/// Length is whatever the KEM yields (at least 32 bytes for a usable key);
/// ciphers use the first 32 bytes. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: Vec<u8>,
}

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Whether the key is long enough to be used.
    pub fn is_usable(&self) -> bool {
        self.key.len() >= MIN_SESSION_KEY_SIZE
    }

    fn cipher_key(&self) -> Result<&[u8], CryptoError> {
        self.key
            .get(..AEAD_KEY_SIZE)
            .ok_or(CryptoError::InvalidKeyLength {
                len: self.key.len(),
                min: AEAD_KEY_SIZE,
            })
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("len", &self.key.len())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Borrowed view of a `nonce || ciphertext || tag` buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedMessage<'a> {
    /// 12-byte nonce.
    pub nonce: &'a [u8],
    /// Ciphertext body.
    pub ciphertext: &'a [u8],
    /// 16-byte authentication tag.
    pub tag: &'a [u8],
}

impl<'a> SealedMessage<'a> {
    /// Split a sealed buffer into its parts.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CryptoError> {
        if bytes.len() < AEAD_NONCE_SIZE + AEAD_TAG_SIZE {
            return Err(CryptoError::EnvelopeTooShort { len: bytes.len() });
        }
        let (nonce, rest) = bytes.split_at(AEAD_NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - AEAD_TAG_SIZE);
        Ok(Self {
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Ciphertext followed by tag, the layout the AEAD crates expect.
    fn ciphertext_and_tag(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.ciphertext.len() + AEAD_TAG_SIZE);
        buf.extend_from_slice(self.ciphertext);
        buf.extend_from_slice(self.tag);
        buf
    }
}

fn fresh_nonce() -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn envelope(nonce: &[u8; AEAD_NONCE_SIZE], ciphertext_and_tag: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(AEAD_NONCE_SIZE + ciphertext_and_tag.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext_and_tag);
    out
}

/// AES-256-GCM.
#[cfg(feature = "aes")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes256GcmCipher;

#[cfg(feature = "aes")]
impl Aead for Aes256GcmCipher {
    fn name(&self) -> &'static str {
        CipherSuite::Aes256Gcm.as_str()
    }

    fn seal(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use aes_gcm::aead::{Aead as _, KeyInit};
        use aes_gcm::{Aes256Gcm, Nonce};

        let cipher = Aes256Gcm::new_from_slice(key.cipher_key()?)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let nonce = fresh_nonce();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(envelope(&nonce, sealed))
    }

    fn open(&self, key: &SessionKey, sealed: &SealedMessage<'_>) -> Result<Vec<u8>, CryptoError> {
        use aes_gcm::aead::{Aead as _, KeyInit};
        use aes_gcm::{Aes256Gcm, Nonce};

        let cipher = Aes256Gcm::new_from_slice(key.cipher_key()?)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        cipher
            .decrypt(Nonce::from_slice(sealed.nonce), sealed.ciphertext_and_tag().as_slice())
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// ChaCha20-Poly1305 (IETF, 12-byte nonce).
#[cfg(feature = "chacha")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaCha20Poly1305Cipher;

#[cfg(feature = "chacha")]
impl Aead for ChaCha20Poly1305Cipher {
    fn name(&self) -> &'static str {
        CipherSuite::ChaCha20Poly1305.as_str()
    }

    fn seal(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use chacha20poly1305::aead::{Aead as _, KeyInit};
        use chacha20poly1305::{ChaCha20Poly1305, Nonce};

        let cipher = ChaCha20Poly1305::new_from_slice(key.cipher_key()?)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let nonce = fresh_nonce();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(envelope(&nonce, sealed))
    }

    fn open(&self, key: &SessionKey, sealed: &SealedMessage<'_>) -> Result<Vec<u8>, CryptoError> {
        use chacha20poly1305::aead::{Aead as _, KeyInit};
        use chacha20poly1305::{ChaCha20Poly1305, Nonce};

        let cipher = ChaCha20Poly1305::new_from_slice(key.cipher_key()?)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        cipher
            .decrypt(Nonce::from_slice(sealed.nonce), sealed.ciphertext_and_tag().as_slice())
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// Instantiate the AEAD for a configured suite.
pub fn cipher_for(suite: CipherSuite) -> Result<Box<dyn Aead>, CryptoError> {
    match suite {
        #[cfg(feature = "aes")]
        CipherSuite::Aes256Gcm => Ok(Box::new(Aes256GcmCipher)),
        #[cfg(feature = "chacha")]
        CipherSuite::ChaCha20Poly1305 => Ok(Box::new(ChaCha20Poly1305Cipher)),
        #[allow(unreachable_patterns)]
        other => Err(CryptoError::UnsupportedSuite(other.as_str())),
    }
}
