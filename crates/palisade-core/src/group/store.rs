//! Persistence of serialized group session state.

use crate::{
    engine::SessionId,
    identity::Identity,
    storage::{BlobStore, EncryptedStore, StorageError},
};

/// Blob persistence for group sessions.
///
/// Blobs are keyed by the hex-encoded session id plus the local member
/// identity, so two local members of the same group never collide.
pub struct GroupSessionStore<B: BlobStore> {
    store: EncryptedStore<B>,
    local: Identity,
}

impl<B: BlobStore> GroupSessionStore<B> {
    /// Wrap an encrypted store scoped to the group-sessions category.
    pub fn new(store: EncryptedStore<B>, local: Identity) -> Self {
        Self { store, local }
    }

    /// Persist serialized engine state for a group.
    pub fn write_state(&self, session_id: &SessionId, state: &[u8]) -> Result<(), StorageError> {
        self.store.write(&self.blob_name(session_id), state)
    }

    /// Read serialized engine state. `None` if no session is stored.
    pub fn read_state(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read(&self.blob_name(session_id))
    }

    /// Whether a group session is stored under this id.
    pub fn exists(&self, session_id: &SessionId) -> Result<bool, StorageError> {
        self.store.exists(&self.blob_name(session_id))
    }

    /// Delete a stored group session. [`StorageError::NotFound`] if absent.
    pub fn delete(&self, session_id: &SessionId) -> Result<(), StorageError> {
        self.store.delete(&self.blob_name(session_id))
    }

    /// Delete every stored group session.
    pub fn delete_all(&self) -> Result<(), StorageError> {
        self.store.delete_all()
    }

    fn blob_name(&self, session_id: &SessionId) -> String {
        format!("{}+{}", hex::encode(session_id), self.local)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::storage::{MemoryBlobStore, StoreCrypto, category};

    fn test_store(local: &str) -> GroupSessionStore<MemoryBlobStore> {
        let signing = SigningKey::from_bytes(&[11u8; 32]);
        let crypto = StoreCrypto::derive(&signing, category::GROUP_SESSIONS);
        GroupSessionStore::new(
            EncryptedStore::new(MemoryBlobStore::new(), crypto),
            Identity::new(local),
        )
    }

    #[test]
    fn roundtrip_by_session_id() {
        let store = test_store("alice");
        let id = [0xAB; 32];

        assert_eq!(store.read_state(&id).unwrap(), None);
        store.write_state(&id, b"group state").unwrap();
        assert_eq!(store.read_state(&id).unwrap(), Some(b"group state".to_vec()));
        assert!(store.exists(&id).unwrap());

        store.delete(&id).unwrap();
        assert!(!store.exists(&id).unwrap());
    }
}
