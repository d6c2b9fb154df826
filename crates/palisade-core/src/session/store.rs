//! Persistence of serialized pairwise session state.

use super::DEFAULT_SESSION_NAME;
use crate::{
    identity::Identity,
    storage::{BlobStore, EncryptedStore, StorageError},
};

/// Blob persistence for pairwise sessions, keyed by (participant, name).
pub struct SessionStore<B: BlobStore> {
    store: EncryptedStore<B>,
}

impl<B: BlobStore> SessionStore<B> {
    /// Wrap an encrypted store scoped to the sessions category.
    pub fn new(store: EncryptedStore<B>) -> Self {
        Self { store }
    }

    /// Persist serialized engine state for a session.
    pub fn write_state(
        &self,
        participant: &Identity,
        name: &str,
        state: &[u8],
    ) -> Result<(), StorageError> {
        self.store.write(&blob_name(participant, name), state)
    }

    /// Read serialized engine state. `None` if no session is stored.
    pub fn read_state(
        &self,
        participant: &Identity,
        name: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read(&blob_name(participant, name))
    }

    /// Whether a session is stored under (participant, name).
    pub fn exists(&self, participant: &Identity, name: &str) -> Result<bool, StorageError> {
        self.store.exists(&blob_name(participant, name))
    }

    /// Delete a stored session. [`StorageError::NotFound`] if absent.
    pub fn delete(&self, participant: &Identity, name: &str) -> Result<(), StorageError> {
        self.store.delete(&blob_name(participant, name))
    }

    /// Delete every stored session.
    pub fn delete_all(&self) -> Result<(), StorageError> {
        self.store.delete_all()
    }
}

fn blob_name(participant: &Identity, name: &str) -> String {
    if name == DEFAULT_SESSION_NAME {
        participant.as_str().to_string()
    } else {
        format!("{participant}+{name}")
    }
}
