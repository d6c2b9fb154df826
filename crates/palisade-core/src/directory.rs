//! Boundary traits for the remote key directory and token provider.
//!
//! Both collaborators are consumed, never implemented, by this crate. The
//! directory holds the public halves of every pre-key; this layer reconciles
//! its local private halves against it during rotation and fetches peer
//! bundles when starting sessions. Absent data is modeled with `Option`,
//! not with error types.

use thiserror::Error;

use crate::identity::{Identity, KeyId, RawPublicKey};

/// Long-term public key together with its identity-key signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPublicKey {
    /// The public key.
    pub key: RawPublicKey,
    /// Signature over the raw key bytes by the owner's identity key.
    pub signature: Vec<u8>,
}

/// Pre-key bundle for one identity, as served by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeySet {
    /// Identity public key registered with the directory.
    pub identity_key: RawPublicKey,
    /// Current signed long-term key.
    pub long_term_key: SignedPublicKey,
    /// A one-time key, if the pool was not exhausted. The directory never
    /// hands out the same one-time key twice.
    pub one_time_key: Option<RawPublicKey>,
}

/// Bundle entry of a batch fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPublicKeySet {
    /// Identity this bundle belongs to.
    pub identity: Identity,
    /// The bundle itself.
    pub keys: PublicKeySet,
}

/// Server-side view of which locally-held keys are no longer usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// The submitted long-term key id, echoed back if the server considers
    /// it used or unknown.
    pub used_long_term_key_id: Option<KeyId>,
    /// Submitted one-time key ids the server reports consumed or absent.
    pub used_one_time_key_ids: Vec<KeyId>,
}

/// Errors from the remote collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Transport failure before a response was produced.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with an error status.
    #[error("remote error {status}: {message}")]
    Remote {
        /// Status code reported by the service.
        status: u16,
        /// Human-readable message from the service.
        message: String,
    },

    /// The token provider failed to produce a token.
    #[error("access token error: {0}")]
    Token(String),
}

/// Remote key directory.
pub trait KeyDirectory: Send + Sync {
    /// Upload public key material in one call.
    ///
    /// `identity_card_id` is supplied only on the first-ever upload for an
    /// identity, registering it with the directory.
    fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[RawPublicKey],
        token: &str,
    ) -> Result<(), DirectoryError>;

    /// Ask the server which of the given keys are used, consumed, or absent.
    fn validate_public_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
        token: &str,
    ) -> Result<ValidationReport, DirectoryError>;

    /// Fetch a peer's bundle, consuming one of its one-time keys if any.
    fn get_public_key_set(
        &self,
        identity: &Identity,
        token: &str,
    ) -> Result<PublicKeySet, DirectoryError>;

    /// Batch fetch. The response size must equal the request size; callers
    /// validate and reject mismatches.
    fn get_multiple_public_key_sets(
        &self,
        identities: &[Identity],
        token: &str,
    ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError>;

    /// Delete the calling identity's entire key record.
    fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError>;
}

/// Access token provider.
///
/// Each call site passes a distinct operation name so the provider can audit
/// which operation requested a token.
pub trait AccessTokenProvider: Send + Sync {
    /// Obtain a token for the named operation.
    fn get_token(&self, operation: &str) -> Result<String, DirectoryError>;
}
