//! Seam to the opaque ratchet engines.
//!
//! The Diffie-Hellman and symmetric ratchet math lives behind these traits.
//! This layer never inspects engine state; it only honors the mutation
//! contract: every encrypt/decrypt mutates the engine and must be followed
//! by re-persisting its serialized form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{Identity, KeyId, RawPublicKey};

/// Group session identifier, always exactly 32 bytes.
pub type SessionId = [u8; 32];

/// Freshly generated asymmetric key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Public half, uploaded to the key directory.
    pub public_key: Vec<u8>,
    /// Private half, persisted in the local key stores.
    pub private_key: Vec<u8>,
}

/// First message of a pairwise session, carrying the pre-key references the
/// receiver needs to respond.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyEnvelope {
    /// Id of the long-term key the initiator used.
    pub long_term_key_id: KeyId,
    /// Id of the one-time key the initiator used, if one was available.
    pub one_time_key_id: Option<KeyId>,
    /// Opaque engine payload.
    pub payload: Vec<u8>,
}

/// Wire message of a pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetMessage {
    /// Session-initiation message; only valid as the first message.
    Prekey(PrekeyEnvelope),
    /// Ordinary ratchet message.
    Regular(Vec<u8>),
}

/// Group control/data message.
///
/// Tickets form a strictly sequential chain per group: a `GroupInfo` ticket
/// advances the epoch by exactly one, and the engine rejects any gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Which kind of ticket this is.
    pub kind: TicketKind,
    /// Group session this ticket belongs to.
    pub session_id: SessionId,
    /// Epoch the ticket was produced for (`GroupInfo`: the epoch it
    /// establishes; `Regular`: the epoch it encrypts under).
    pub epoch: u64,
    /// Membership snapshot, present on `GroupInfo` tickets only.
    pub roster: Option<BTreeMap<Identity, KeyId>>,
    /// Opaque engine payload.
    pub payload: Vec<u8>,
}

impl Ticket {
    /// Number of participants after this ticket, if it is a membership
    /// snapshot.
    pub fn participant_count(&self) -> Option<usize> {
        self.roster.as_ref().map(BTreeMap::len)
    }
}

/// Ticket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketKind {
    /// Full membership snapshot; joins a group or changes its members.
    GroupInfo,
    /// Encrypted application payload.
    Regular,
}

/// Group member reference used when creating or joining groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    /// Member identity.
    pub identity: Identity,
    /// Member public key; its digest becomes the roster key id.
    pub public_key: RawPublicKey,
}

/// Errors surfaced by the opaque engines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A membership ticket skipped an epoch or arrived out of order.
    ///
    /// Fatal: the session cannot process this ticket, now or later.
    #[error("non-consequent ticket: session at epoch {current_epoch}, ticket for {ticket_epoch}")]
    NonConsequent {
        /// Epoch the session currently reflects.
        current_epoch: u64,
        /// Epoch the ticket was produced for.
        ticket_epoch: u64,
    },

    /// A message was encrypted under an epoch the session no longer holds.
    ///
    /// Expected after membership changes; callers should surface "cannot
    /// decrypt" rather than treat it as corruption.
    #[error("message for stale epoch {message_epoch}, session at {current_epoch}")]
    StaleEpoch {
        /// Epoch the session currently reflects.
        current_epoch: u64,
        /// Epoch the message was encrypted under.
        message_epoch: u64,
    },

    /// Supplied key material could not be used.
    #[error("bad key material: {0}")]
    BadKeyMaterial(String),

    /// Cryptographic operation failed (AEAD, ordering, corrupt state).
    #[error("engine crypto error: {0}")]
    Crypto(String),

    /// Serialized engine state could not be restored.
    #[error("engine state deserialization failed: {0}")]
    Deserialization(String),
}

impl EngineError {
    /// Whether this error is fatal for the session that produced it.
    ///
    /// [`EngineError::StaleEpoch`] is the one recoverable kind: the message
    /// is lost but the session remains usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::StaleEpoch { .. })
    }
}

/// Mutable pairwise ratchet engine.
pub trait RatchetEngine: Send {
    /// Encrypt a plaintext, advancing the send chain.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, EngineError>;

    /// Decrypt a message, advancing the receive chain.
    fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, EngineError>;

    /// Serialize the full engine state for persistence.
    fn serialize(&self) -> Result<Vec<u8>, EngineError>;
}

/// Peer key material consumed by session initiation.
#[derive(Debug, Clone, Copy)]
pub struct InitiationKeys<'a> {
    /// Peer identity public key.
    pub identity_key: &'a [u8],
    /// Peer long-term pre-key (signature already verified by the caller).
    pub long_term_public: &'a [u8],
    /// Peer one-time pre-key, when the directory had one left.
    pub one_time_public: Option<&'a [u8]>,
}

/// Own private key material consumed when responding to an initiation.
#[derive(Debug, Clone, Copy)]
pub struct ResponderKeys<'a> {
    /// Private half of the long-term key the initiator referenced.
    pub long_term_private: &'a [u8],
    /// Private half of the one-time key the initiator referenced, if any.
    pub one_time_private: Option<&'a [u8]>,
}

/// Factory for pairwise engines and the key pairs they consume.
pub trait RatchetCrypto: Send + Sync {
    /// Generate a fresh pre-key pair.
    fn generate_key_pair(&self) -> Result<KeyPair, EngineError>;

    /// Start a session as the initiator against a peer's published keys.
    fn initiate(&self, peer: InitiationKeys<'_>) -> Result<Box<dyn RatchetEngine>, EngineError>;

    /// Start a session as the responder from a received initiation message.
    fn respond(
        &self,
        own: ResponderKeys<'_>,
        message: &PrekeyEnvelope,
    ) -> Result<Box<dyn RatchetEngine>, EngineError>;

    /// Restore an engine from its serialized state.
    fn deserialize(&self, state: &[u8]) -> Result<Box<dyn RatchetEngine>, EngineError>;
}

/// Mutable group ratchet engine.
pub trait GroupRatchet: Send {
    /// Session id this engine belongs to.
    fn session_id(&self) -> SessionId;

    /// Membership epoch the engine currently reflects.
    fn epoch(&self) -> u64;

    /// Number of participants at the current epoch.
    fn participant_count(&self) -> usize;

    /// Encrypt a plaintext into a `Regular` ticket.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Ticket, EngineError>;

    /// Decrypt a `Regular` ticket.
    fn decrypt(&mut self, ticket: &Ticket) -> Result<Vec<u8>, EngineError>;

    /// Build a `GroupInfo` ticket for the next epoch with the given
    /// membership changes. Does not advance this engine.
    fn create_group_info(
        &self,
        add: &[GroupMember],
        remove: &[Identity],
    ) -> Result<Ticket, EngineError>;

    /// Advance this engine to the epoch a `GroupInfo` ticket establishes.
    ///
    /// # Errors
    ///
    /// [`EngineError::NonConsequent`] unless the ticket is for exactly the
    /// next epoch.
    fn apply_group_info(&mut self, ticket: &Ticket) -> Result<(), EngineError>;

    /// Serialize the full engine state for persistence.
    fn serialize(&self) -> Result<Vec<u8>, EngineError>;
}

/// Factory for group engines.
pub trait GroupRatchetProvider: Send + Sync {
    /// Create a brand-new group containing only the local member.
    fn create(
        &self,
        local: &GroupMember,
        session_id: SessionId,
    ) -> Result<Box<dyn GroupRatchet>, EngineError>;

    /// Join a group from a `GroupInfo` ticket.
    fn join(
        &self,
        local: &GroupMember,
        members: &[GroupMember],
        session_id: SessionId,
        ticket: &Ticket,
    ) -> Result<Box<dyn GroupRatchet>, EngineError>;

    /// Restore an engine from its serialized state.
    fn deserialize(&self, state: &[u8]) -> Result<Box<dyn GroupRatchet>, EngineError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn stale_epoch_is_recoverable() {
        assert!(!EngineError::StaleEpoch { current_epoch: 2, message_epoch: 1 }.is_fatal());
    }

    #[test]
    fn non_consequent_is_fatal() {
        assert!(EngineError::NonConsequent { current_epoch: 2, ticket_epoch: 1 }.is_fatal());
        assert!(EngineError::Crypto("tag mismatch".to_string()).is_fatal());
    }
}
