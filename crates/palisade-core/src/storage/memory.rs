//! In-memory blob store for tests and simulation.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{BlobStore, BlobStoreProvider, StorageError};
use crate::identity::Identity;

/// In-memory blob store.
///
/// Clone shares the same underlying map, mirroring how a reopened file
/// store observes previously written data.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored. Useful in tests.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("MemoryBlobStore mutex poisoned").len()
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.blobs
            .lock()
            .expect("MemoryBlobStore mutex poisoned")
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.lock().expect("MemoryBlobStore mutex poisoned").get(name).cloned())
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .blobs
            .lock()
            .expect("MemoryBlobStore mutex poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.blobs
            .lock()
            .expect("MemoryBlobStore mutex poisoned")
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound { name: name.to_string() })
    }

    fn delete_all(&self) -> Result<(), StorageError> {
        self.blobs.lock().expect("MemoryBlobStore mutex poisoned").clear();
        Ok(())
    }
}

/// Provider handing out shared [`MemoryBlobStore`] instances.
///
/// Opening the same (identity, category) pair twice returns stores backed
/// by the same map, so "restarting" a component in a test sees its data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreProvider {
    stores: Arc<Mutex<HashMap<(String, String), MemoryBlobStore>>>,
}

impl MemoryStoreProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStoreProvider for MemoryStoreProvider {
    type Store = MemoryBlobStore;

    fn open(&self, identity: &Identity, category: &str) -> Result<MemoryBlobStore, StorageError> {
        let key = (identity.as_str().to_string(), category.to_string());
        Ok(self
            .stores
            .lock()
            .expect("MemoryStoreProvider mutex poisoned")
            .entry(key)
            .or_default()
            .clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_state() {
        let store = MemoryBlobStore::new();
        let clone = store.clone();

        store.write("name", b"data").unwrap();
        assert_eq!(clone.read("name").unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = MemoryBlobStore::new();
        assert!(matches!(store.delete("nope"), Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn provider_reopens_same_store() {
        let provider = MemoryStoreProvider::new();
        let identity = Identity::new("alice");

        let first = provider.open(&identity, "sessions").unwrap();
        first.write("peer", b"state").unwrap();

        let second = provider.open(&identity, "sessions").unwrap();
        assert_eq!(second.read("peer").unwrap(), Some(b"state".to_vec()));
    }
}
