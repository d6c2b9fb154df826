//! Blob storage abstraction for encrypted-at-rest persistence.
//!
//! Everything this layer persists (keys, sessions, group sessions) goes
//! through a named-blob interface scoped per identity and sub-category. The
//! trait is synchronous; callers that need async hand the work to their own
//! runtime.

mod encrypted;
mod file;
mod memory;

use thiserror::Error;

pub use encrypted::{EncryptedStore, StoreCrypto};
pub use file::{FileBlobStore, FileStoreProvider};
pub use memory::{MemoryBlobStore, MemoryStoreProvider};

use crate::identity::Identity;

/// Per-identity storage sub-categories.
pub mod category {
    /// Long-term pre-key records, one blob per key id.
    pub const LONG_TERM_KEYS: &str = "long-term-keys";
    /// One-time pre-key set, a single blob holding all records.
    pub const ONE_TIME_KEYS: &str = "one-time-keys";
    /// Serialized pairwise ratchet sessions.
    pub const SESSIONS: &str = "sessions";
    /// Serialized group ratchet sessions.
    pub const GROUP_SESSIONS: &str = "group-sessions";
}

/// Errors from blob storage and the at-rest envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Named blob does not exist.
    #[error("blob not found: {name}")]
    NotFound {
        /// Name of the missing blob.
        name: String,
    },

    /// Underlying file system or backend failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Failed to encode or decode a stored record.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Envelope encryption or decryption failed.
    #[error("envelope crypto error: {0}")]
    Crypto(String),

    /// Envelope signature did not verify after decryption.
    ///
    /// Either the blob was tampered with or it was written under a
    /// different identity key.
    #[error("envelope signature verification failed for blob {name}")]
    Verification {
        /// Name of the blob that failed verification.
        name: String,
    },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Named-blob store.
///
/// Implementations are plain byte stores; confidentiality and integrity are
/// layered on top by [`EncryptedStore`].
pub trait BlobStore: Send + Sync + 'static {
    /// Write a blob, replacing any previous content under the same name.
    fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Read a blob. Returns `None` if no blob exists under the name.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// List all blob names in this store.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the backing directory is unreadable.
    fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Delete a blob.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the blob does not exist.
    /// Callers that tolerate missing blobs must check first.
    fn delete(&self, name: &str) -> Result<(), StorageError>;

    /// Delete every blob in this store.
    fn delete_all(&self) -> Result<(), StorageError>;
}

/// Factory opening one [`BlobStore`] per (identity, category) pair.
///
/// Opening the same pair twice must yield stores observing the same data.
pub trait BlobStoreProvider: Send + Sync {
    /// Concrete store type produced by this provider.
    type Store: BlobStore;

    /// Open (creating if needed) the store for an identity sub-category.
    fn open(&self, identity: &Identity, category: &str) -> Result<Self::Store, StorageError>;
}
