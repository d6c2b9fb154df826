//! Palisade session layer.
//!
//! Manages the lifecycle of pairwise and group encrypted sessions on top of
//! an opaque ratchet engine: pre-key storage and rotation against a remote
//! key directory, ticket-based group membership, and encrypted-at-rest
//! persistence of everything.
//!
//! # Layering
//!
//! ```text
//! Chat (orchestrator)
//!   ├── Session / GroupSession        thin engine wrappers, auto-persisting
//!   ├── KeysRotator                   cloud/local pre-key reconciliation
//!   ├── key stores                    long-term + one-time records
//!   └── EncryptedStore                sign-then-encrypt blob envelope
//! ```
//!
//! The Diffie-Hellman and ratchet math is supplied by the caller through the
//! [`engine`] traits; the remote key directory and access-token provider
//! through the [`directory`] traits. Everything here is synchronous and
//! blocking; callers that need async wrap the calls in their own runtime.

pub mod chat;
pub mod clock;
pub mod directory;
pub mod engine;
pub mod group;
pub mod identity;
pub mod keys;
pub mod rotation;
pub mod session;
pub mod storage;

pub use chat::{Chat, ChatContext, ChatError};
pub use clock::{Clock, SystemClock};
pub use directory::{
    AccessTokenProvider, DirectoryError, IdentityPublicKeySet, KeyDirectory, PublicKeySet,
    SignedPublicKey, ValidationReport,
};
pub use engine::{
    EngineError, GroupMember, GroupRatchet, GroupRatchetProvider, InitiationKeys, KeyPair,
    PrekeyEnvelope, RatchetCrypto, RatchetEngine, RatchetMessage, ResponderKeys, SessionId,
    Ticket, TicketKind,
};
pub use group::{GroupSession, GroupSessionError, GroupSessionStore, SESSION_ID_LEN};
pub use identity::{Card, Identity, KEY_ID_LEN, KeyAlgorithm, KeyId, RawPublicKey};
pub use keys::{
    InteractionScope, KeyStoreError, LongTermKeyRecord, LongTermKeyStore, OneTimeKeyRecord,
    OneTimeKeyStore,
};
pub use rotation::{KeysRotator, RotationConfig, RotationError, RotationLog};
pub use session::{DEFAULT_SESSION_NAME, Session, SessionError, SessionStore};
pub use storage::{
    BlobStore, BlobStoreProvider, EncryptedStore, FileBlobStore, FileStoreProvider,
    MemoryBlobStore, MemoryStoreProvider, StorageError, StoreCrypto,
};
