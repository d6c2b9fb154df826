//! Pairwise encrypted sessions.
//!
//! A [`Session`] is a thin wrapper around one opaque ratchet engine plus the
//! (participant, name) pair that keys its storage. Every encrypt/decrypt
//! mutates the engine, so both re-persist the serialized state before
//! returning; a successful call implies the blob on disk reflects the
//! post-call engine.

mod store;

use std::sync::Arc;

use thiserror::Error;

pub use store::SessionStore;

use crate::{
    engine::{EngineError, RatchetEngine, RatchetMessage},
    identity::Identity,
    storage::{BlobStore, StorageError},
};

/// Session name used when the caller does not specify one.
pub const DEFAULT_SESSION_NAME: &str = "default";

/// Errors from session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The opaque engine rejected the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Persisting the mutated engine state failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One pairwise session with a participant.
pub struct Session<B: BlobStore> {
    participant: Identity,
    name: String,
    engine: Box<dyn RatchetEngine>,
    store: Arc<SessionStore<B>>,
}

impl<B: BlobStore> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("participant", &self.participant)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<B: BlobStore> Session<B> {
    pub(crate) fn new(
        participant: Identity,
        name: String,
        engine: Box<dyn RatchetEngine>,
        store: Arc<SessionStore<B>>,
    ) -> Self {
        Self { participant, name, engine, store }
    }

    /// Participant this session talks to.
    pub fn participant(&self) -> &Identity {
        &self.participant
    }

    /// Session name within the participant's namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encrypt a plaintext and persist the advanced engine state.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, SessionError> {
        let message = self.engine.encrypt(plaintext)?;
        self.persist()?;
        Ok(message)
    }

    /// Decrypt a message and persist the advanced engine state.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, SessionError> {
        let plaintext = self.engine.decrypt(message)?;
        self.persist()?;
        Ok(plaintext)
    }

    /// Re-persist the current engine state.
    ///
    /// Called automatically after every mutation; exposed for callers that
    /// mutate the engine through future extensions.
    pub fn persist(&self) -> Result<(), SessionError> {
        let state = self.engine.serialize()?;
        self.store.write_state(&self.participant, &self.name, &state)?;
        Ok(())
    }
}
