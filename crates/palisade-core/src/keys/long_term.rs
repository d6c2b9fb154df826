//! Long-term pre-key store, one encrypted blob per key id.

use std::time::SystemTime;

use super::{KeyStoreError, LongTermKeyRecord};
use crate::{
    identity::KeyId,
    storage::{BlobStore, EncryptedStore},
};

/// Persistence for long-term pre-keys.
///
/// Each record lives in its own blob named by the lowercase-hex key id.
pub struct LongTermKeyStore<B: BlobStore> {
    store: EncryptedStore<B>,
}

impl<B: BlobStore> LongTermKeyStore<B> {
    /// Wrap an encrypted store scoped to the long-term-key category.
    pub fn new(store: EncryptedStore<B>) -> Self {
        Self { store }
    }

    /// Store a freshly generated key.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::AlreadyExists`] if a record under `id` exists.
    pub fn store_key(
        &self,
        private_key: &[u8],
        id: KeyId,
        created_at: SystemTime,
    ) -> Result<LongTermKeyRecord, KeyStoreError> {
        let name = id.to_hex();
        if self.store.exists(&name)? {
            return Err(KeyStoreError::AlreadyExists { id });
        }
        let record = LongTermKeyRecord {
            id,
            private_key: private_key.to_vec(),
            created_at,
            outdated_from: None,
        };
        self.write(&record)?;
        Ok(record)
    }

    /// Retrieve a record by id.
    pub fn retrieve(&self, id: KeyId) -> Result<LongTermKeyRecord, KeyStoreError> {
        let blob = self
            .store
            .read(&id.to_hex())?
            .ok_or(KeyStoreError::NotFound { id })?;
        decode(&blob)
    }

    /// Retrieve every stored record.
    pub fn retrieve_all(&self) -> Result<Vec<LongTermKeyRecord>, KeyStoreError> {
        let mut records = Vec::new();
        for name in self.store.list()? {
            let Some(id) = KeyId::from_hex(&name) else {
                continue;
            };
            records.push(self.retrieve(id)?);
        }
        Ok(records)
    }

    /// Delete a record by id. [`KeyStoreError::NotFound`] if absent.
    pub fn delete(&self, id: KeyId) -> Result<(), KeyStoreError> {
        if !self.store.exists(&id.to_hex())? {
            return Err(KeyStoreError::NotFound { id });
        }
        self.store.delete(&id.to_hex())?;
        Ok(())
    }

    /// Mark a key outdated as of `at`.
    ///
    /// A key that is already outdated keeps its original mark; the mark is
    /// never moved or cleared.
    pub fn mark_outdated(&self, at: SystemTime, id: KeyId) -> Result<(), KeyStoreError> {
        let mut record = self.retrieve(id)?;
        if record.outdated_from.is_some() {
            return Ok(());
        }
        record.outdated_from = Some(at);
        self.write(&record)
    }

    /// Wipe every record.
    pub fn reset(&self) -> Result<(), KeyStoreError> {
        self.store.delete_all()?;
        Ok(())
    }

    fn write(&self, record: &LongTermKeyRecord) -> Result<(), KeyStoreError> {
        let mut blob = Vec::new();
        ciborium::into_writer(record, &mut blob)
            .map_err(|e| KeyStoreError::Serialization(e.to_string()))?;
        self.store.write(&record.id.to_hex(), &blob)?;
        Ok(())
    }
}

fn decode(blob: &[u8]) -> Result<LongTermKeyRecord, KeyStoreError> {
    ciborium::from_reader(blob).map_err(|e| KeyStoreError::Serialization(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::storage::{MemoryBlobStore, StoreCrypto, category};

    fn test_store() -> LongTermKeyStore<MemoryBlobStore> {
        let signing = SigningKey::from_bytes(&[3u8; 32]);
        let crypto = StoreCrypto::derive(&signing, category::LONG_TERM_KEYS);
        LongTermKeyStore::new(EncryptedStore::new(MemoryBlobStore::new(), crypto))
    }

    #[test]
    fn store_and_retrieve() {
        let store = test_store();
        let id = KeyId::of(b"public");
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);

        let record = store.store_key(b"private", id, now).unwrap();
        assert_eq!(record.outdated_from, None);

        let loaded = store.retrieve(id).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn duplicate_store_is_already_exists() {
        let store = test_store();
        let id = KeyId::of(b"public");
        let now = SystemTime::UNIX_EPOCH;

        store.store_key(b"private", id, now).unwrap();
        assert!(matches!(
            store.store_key(b"private", id, now),
            Err(KeyStoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn retrieve_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(
            store.retrieve(KeyId::of(b"nope")),
            Err(KeyStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(
            store.delete(KeyId::of(b"nope")),
            Err(KeyStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn mark_outdated_sets_timestamp_once() {
        let store = test_store();
        let id = KeyId::of(b"public");
        let created = SystemTime::UNIX_EPOCH;
        store.store_key(b"private", id, created).unwrap();

        let first_mark = created + Duration::from_secs(100);
        store.mark_outdated(first_mark, id).unwrap();
        assert_eq!(store.retrieve(id).unwrap().outdated_from, Some(first_mark));

        // A later mark does not move the original one.
        store.mark_outdated(first_mark + Duration::from_secs(50), id).unwrap();
        assert_eq!(store.retrieve(id).unwrap().outdated_from, Some(first_mark));
    }

    #[test]
    fn retrieve_all_and_reset() {
        let store = test_store();
        let now = SystemTime::UNIX_EPOCH;
        store.store_key(b"one", KeyId::of(b"pub1"), now).unwrap();
        store.store_key(b"two", KeyId::of(b"pub2"), now).unwrap();

        assert_eq!(store.retrieve_all().unwrap().len(), 2);

        store.reset().unwrap();
        assert!(store.retrieve_all().unwrap().is_empty());
    }
}
