//! One-time pre-key store with a stacked interaction scope.
//!
//! The whole key set lives in one encrypted blob. Any access requires an
//! open interaction scope: the first scope entry loads the set into memory,
//! the matching last exit flushes it back and discards the copy. Scopes
//! stack, so nested batch operations share one load/flush pair.
//!
//! The scope is a real critical section: depth counter and in-memory
//! snapshot are guarded by one mutex, so two threads can never both believe
//! they performed the initial load.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{collections::BTreeMap, sync::Mutex, time::SystemTime};

use super::{KeyStoreError, OneTimeKeyRecord};
use crate::{
    identity::KeyId,
    storage::{BlobStore, EncryptedStore},
};

/// Blob name of the serialized key set inside the one-time-keys category.
const SET_BLOB: &str = "set";

struct ScopeState {
    depth: usize,
    snapshot: Option<BTreeMap<KeyId, OneTimeKeyRecord>>,
}

/// Persistence for one-time pre-keys.
pub struct OneTimeKeyStore<B: BlobStore> {
    store: EncryptedStore<B>,
    state: Mutex<ScopeState>,
}

impl<B: BlobStore> OneTimeKeyStore<B> {
    /// Wrap an encrypted store scoped to the one-time-key category.
    pub fn new(store: EncryptedStore<B>) -> Self {
        Self { store, state: Mutex::new(ScopeState { depth: 0, snapshot: None }) }
    }

    /// Open an interaction scope.
    ///
    /// The outermost scope loads the full key set from disk; nested scopes
    /// reuse the in-memory copy. Call [`InteractionScope::close`] to flush
    /// with error propagation; dropping the guard flushes as a backstop and
    /// only logs failures.
    pub fn begin_interaction(&self) -> Result<InteractionScope<'_, B>, KeyStoreError> {
        self.enter()?;
        Ok(InteractionScope { store: self, closed: false })
    }

    /// Store a freshly generated key. Requires an open scope.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::AlreadyExists`] if a record under `id` exists.
    pub fn store_key(
        &self,
        private_key: &[u8],
        id: KeyId,
    ) -> Result<OneTimeKeyRecord, KeyStoreError> {
        let mut state = self.lock();
        let snapshot = open_snapshot(&mut state)?;
        if snapshot.contains_key(&id) {
            return Err(KeyStoreError::AlreadyExists { id });
        }
        let record = OneTimeKeyRecord { id, private_key: private_key.to_vec(), orphaned_from: None };
        snapshot.insert(id, record.clone());
        Ok(record)
    }

    /// Retrieve a record by id. Requires an open scope.
    pub fn retrieve(&self, id: KeyId) -> Result<OneTimeKeyRecord, KeyStoreError> {
        let mut state = self.lock();
        let snapshot = open_snapshot(&mut state)?;
        snapshot.get(&id).cloned().ok_or(KeyStoreError::NotFound { id })
    }

    /// Retrieve every record. Requires an open scope.
    pub fn retrieve_all(&self) -> Result<Vec<OneTimeKeyRecord>, KeyStoreError> {
        let mut state = self.lock();
        let snapshot = open_snapshot(&mut state)?;
        Ok(snapshot.values().cloned().collect())
    }

    /// Delete a record by id. Requires an open scope.
    pub fn delete(&self, id: KeyId) -> Result<(), KeyStoreError> {
        let mut state = self.lock();
        let snapshot = open_snapshot(&mut state)?;
        snapshot.remove(&id).map(|_| ()).ok_or(KeyStoreError::NotFound { id })
    }

    /// Mark a key orphaned as of `at`. Requires an open scope.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::AlreadyMarked`] if the record is already orphaned.
    pub fn mark_orphaned(&self, at: SystemTime, id: KeyId) -> Result<(), KeyStoreError> {
        let mut state = self.lock();
        let snapshot = open_snapshot(&mut state)?;
        let record = snapshot.get_mut(&id).ok_or(KeyStoreError::NotFound { id })?;
        if record.orphaned_from.is_some() {
            return Err(KeyStoreError::AlreadyMarked { id });
        }
        record.orphaned_from = Some(at);
        Ok(())
    }

    /// Wipe the whole set.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::InteractionOpen`] if any scope is still open; the
    /// in-memory snapshot would otherwise resurrect the data on flush.
    pub fn reset(&self) -> Result<(), KeyStoreError> {
        let state = self.lock();
        if state.depth > 0 {
            return Err(KeyStoreError::InteractionOpen);
        }
        drop(state);
        if self.store.exists(SET_BLOB)? {
            self.store.delete(SET_BLOB)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        self.state.lock().expect("OneTimeKeyStore mutex poisoned")
    }

    fn enter(&self) -> Result<(), KeyStoreError> {
        let mut state = self.lock();
        if state.depth == 0 {
            state.snapshot = Some(self.load()?);
        }
        state.depth += 1;
        Ok(())
    }

    fn exit(&self) -> Result<(), KeyStoreError> {
        let mut state = self.lock();
        if state.depth == 0 {
            return Err(KeyStoreError::NoInteraction);
        }
        state.depth -= 1;
        if state.depth == 0 {
            let snapshot = state.snapshot.take().unwrap_or_default();
            // Flush while still holding the lock so a concurrent enter()
            // cannot observe a half-written set.
            self.flush(&snapshot)?;
        }
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<KeyId, OneTimeKeyRecord>, KeyStoreError> {
        match self.store.read(SET_BLOB)? {
            None => Ok(BTreeMap::new()),
            Some(blob) if blob.is_empty() => Ok(BTreeMap::new()),
            Some(blob) => {
                ciborium::from_reader(blob.as_slice())
                    .map_err(|e| KeyStoreError::Serialization(e.to_string()))
            },
        }
    }

    fn flush(&self, snapshot: &BTreeMap<KeyId, OneTimeKeyRecord>) -> Result<(), KeyStoreError> {
        let mut blob = Vec::new();
        ciborium::into_writer(snapshot, &mut blob)
            .map_err(|e| KeyStoreError::Serialization(e.to_string()))?;
        self.store.write(SET_BLOB, &blob)?;
        Ok(())
    }
}

fn open_snapshot(
    state: &mut ScopeState,
) -> Result<&mut BTreeMap<KeyId, OneTimeKeyRecord>, KeyStoreError> {
    state.snapshot.as_mut().ok_or(KeyStoreError::NoInteraction)
}

/// RAII guard for one interaction scope level.
pub struct InteractionScope<'a, B: BlobStore> {
    store: &'a OneTimeKeyStore<B>,
    closed: bool,
}

impl<B: BlobStore> InteractionScope<'_, B> {
    /// Close this scope level explicitly, propagating flush errors.
    pub fn close(mut self) -> Result<(), KeyStoreError> {
        self.closed = true;
        self.store.exit()
    }
}

impl<B: BlobStore> Drop for InteractionScope<'_, B> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.store.exit() {
            tracing::warn!(error = %err, "one-time key set flush failed on scope drop");
        }
    }
}
