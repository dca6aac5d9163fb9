//! Session key storage.
//!
//! Keys are stored per owner: the peer address on the direct link, or the
//! relay session identifier when the relay is active.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info};

use super::aead::SessionKey;

/// Identity under which a session key is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create an owner id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// In-memory map from owner id to session key.
///
/// Teardown deletions go through [`delete_on_teardown`](Self::delete_on_teardown),
/// which honors a one-shot preserve flag; explicit [`delete`](Self::delete)
/// calls do too, so a single teardown never loses a key the caller asked to keep.
#[derive(Debug, Default)]
pub struct SessionKeyStore {
    keys: HashMap<OwnerId, SessionKey>,
    preserve_next: bool,
}

impl SessionKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `key` under `owner`, replacing any previous key.
    pub fn save(&mut self, owner: &OwnerId, key: SessionKey) {
        debug!(owner = %owner, len = key.len(), "session key saved");
        self.keys.insert(owner.clone(), key);
    }

    /// Look up the key for `owner`.
    ///
    /// Keys shorter than 32 bytes are treated as corrupt and not returned.
    pub fn load(&self, owner: &OwnerId) -> Option<&SessionKey> {
        self.keys.get(owner).filter(|k| k.is_usable())
    }

    /// Whether a usable key exists for `owner`.
    pub fn contains(&self, owner: &OwnerId) -> bool {
        self.load(owner).is_some()
    }

    /// Delete the key for `owner`.
    ///
    /// If [`preserve_on_next_teardown`](Self::preserve_on_next_teardown) was
    /// called, this call is a no-op that consumes the flag. Returns whether
    /// a key was removed.
    pub fn delete(&mut self, owner: &OwnerId) -> bool {
        if std::mem::take(&mut self.preserve_next) {
            info!(owner = %owner, "session key preserved across teardown");
            return false;
        }
        let removed = self.keys.remove(owner).is_some();
        if removed {
            debug!(owner = %owner, "session key deleted");
        }
        removed
    }

    /// Teardown-triggered deletion. Same semantics as [`delete`](Self::delete).
    pub fn delete_on_teardown(&mut self, owner: &OwnerId) -> bool {
        self.delete(owner)
    }

    /// Move the key stored under `from` to `to`, replacing any key `to` had.
    ///
    /// Returns whether a usable key was moved. An unusable key is left where
    /// it is.
    pub fn rehome(&mut self, from: &OwnerId, to: &OwnerId) -> bool {
        if from == to || !self.contains(from) {
            return false;
        }
        let Some(key) = self.keys.remove(from) else {
            return false;
        };
        info!(from = %from, to = %to, "session key moved to new owner");
        self.keys.insert(to.clone(), key);
        true
    }

    /// Keep the key through the next teardown deletion.
    pub fn preserve_on_next_teardown(&mut self) {
        self.preserve_next = true;
    }

    /// Whether the preserve flag is armed.
    pub fn is_preserve_armed(&self) -> bool {
        self.preserve_next
    }

    /// Number of stored keys, usable or not.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
