//! Typed pre-key persistence.
//!
//! Two record kinds back the rotation engine: long-term keys age through a
//! created -> outdated -> deleted lifecycle, one-time keys through a
//! created -> consumed-or-orphaned -> deleted one. Both marks are one-way;
//! a record is never un-marked.

mod long_term;
mod one_time;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use long_term::LongTermKeyStore;
pub use one_time::{InteractionScope, OneTimeKeyStore};

use crate::{identity::KeyId, storage::StorageError};

/// Persisted long-term pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermKeyRecord {
    /// Digest id of the public half.
    pub id: KeyId,
    /// Private key bytes (stored only inside the encrypted envelope).
    pub private_key: Vec<u8>,
    /// When the key was generated.
    pub created_at: SystemTime,
    /// When the key was marked outdated; `None` while current.
    pub outdated_from: Option<SystemTime>,
}

/// Persisted one-time pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKeyRecord {
    /// Digest id of the public half.
    pub id: KeyId,
    /// Private key bytes (stored only inside the encrypted envelope).
    pub private_key: Vec<u8>,
    /// When the server reported the key consumed; `None` while active.
    pub orphaned_from: Option<SystemTime>,
}

/// Errors from the key stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    /// No record under the given key id.
    #[error("key not found: {id}")]
    NotFound {
        /// Id that was looked up.
        id: KeyId,
    },

    /// A record under the given key id already exists.
    ///
    /// Key ids are digests of distinct key material; hitting this means the
    /// caller tried to store the same key twice, not an id collision.
    #[error("key already exists: {id}")]
    AlreadyExists {
        /// Id that was stored twice.
        id: KeyId,
    },

    /// The record was already marked (orphaned) by an earlier call.
    #[error("key already marked: {id}")]
    AlreadyMarked {
        /// Id of the already-marked record.
        id: KeyId,
    },

    /// Operation requires an open interaction scope and none is open.
    #[error("no interaction scope open")]
    NoInteraction,

    /// Operation requires all interaction scopes closed and one is open.
    #[error("interaction scope still open")]
    InteractionOpen,

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Failed to encode or decode a key record.
    #[error("key record serialization error: {0}")]
    Serialization(String),
}
