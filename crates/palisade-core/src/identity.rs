//! Participant identities, PKI cards, and key-id derivation.
//!
//! An [`Identity`] is an opaque handle minted by the PKI layer; this crate
//! only compares and stores it. A [`KeyId`] is the stable digest used both as
//! the storage filename for a key and as its wire identifier, so its encoding
//! must never change between releases.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

/// Number of digest bytes used for a [`KeyId`].
pub const KEY_ID_LEN: usize = 8;

/// Opaque participant handle.
///
/// Derived from a PKI card elsewhere; treated as an owned string here.
/// Identities are used in storage blob names and must be filesystem-safe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Wrap a raw identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Closed set of key algorithms this layer accepts.
///
/// Checked at ingestion boundaries (card validation, bundle validation,
/// member adds) so business logic never has to inspect raw key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Ed25519 signing keys (identity keys, envelope signatures).
    Ed25519,
    /// Curve25519 agreement keys (long-term and one-time pre-keys).
    Curve25519,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ed25519 => f.write_str("ed25519"),
            Self::Curve25519 => f.write_str("curve25519"),
        }
    }
}

/// Raw public key with its algorithm tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPublicKey {
    /// Algorithm this key belongs to.
    pub algorithm: KeyAlgorithm,
    /// Encoded public key bytes.
    pub bytes: Vec<u8>,
}

/// Identity card issued by the PKI collaborator.
///
/// This layer only reads cards; it never creates or mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Participant identity the card belongs to.
    pub identity: Identity,
    /// The card's identity public key.
    pub public_key: RawPublicKey,
    /// Card identifier assigned by the PKI service.
    pub card_id: String,
}

/// Stable identifier of a public key.
///
/// First [`KEY_ID_LEN`] bytes of the SHA-512 digest of the public key bytes.
/// Rendered as lowercase hex wherever a filename or log line needs it, which
/// keeps lookups unambiguous on case-insensitive filesystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    /// Derive the id of a public key.
    pub fn of(public_key: &[u8]) -> Self {
        let digest = Sha512::digest(public_key);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        Self(id)
    }

    /// Construct from raw digest bytes.
    pub fn from_bytes(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the digest bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, suitable for filenames.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a lowercase hex rendering produced by [`KeyId::to_hex`].
    pub fn from_hex(encoded: &str) -> Option<Self> {
        let raw = hex::decode(encoded).ok()?;
        let bytes: [u8; KEY_ID_LEN] = raw.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
