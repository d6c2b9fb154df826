//! Group encrypted sessions and the membership-ticket protocol.
//!
//! Membership evolves through `GroupInfo` tickets, each advancing the
//! group's epoch by exactly one. This layer validates that a ticket actually
//! performs the membership change the caller asked for before handing it to
//! the engine; the engine itself enforces the consequent-chain rule.

mod store;

use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;

pub use store::GroupSessionStore;

use crate::{
    engine::{
        EngineError, GroupMember, GroupRatchet, GroupRatchetProvider, SessionId, Ticket,
        TicketKind,
    },
    identity::{Card, Identity, KeyAlgorithm, KeyId},
    storage::{BlobStore, StorageError},
};

/// Required length of a group session id.
pub const SESSION_ID_LEN: usize = 32;

/// Errors from group session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupSessionError {
    /// Session id is not exactly [`SESSION_ID_LEN`] bytes.
    #[error("invalid session id: expected {SESSION_ID_LEN} bytes, got {length}")]
    InvalidSessionId {
        /// Length of the rejected id.
        length: usize,
    },

    /// Ticket kind did not match the operation.
    #[error("wrong ticket kind: expected {expected:?}, got {got:?}")]
    WrongTicketKind {
        /// Kind the operation requires.
        expected: TicketKind,
        /// Kind the ticket carries.
        got: TicketKind,
    },

    /// Ticket belongs to a different group session.
    #[error("ticket session id does not match this group")]
    SessionIdMismatch,

    /// A membership change needs at least one added or removed member.
    #[error("membership change ticket with no additions or removals")]
    EmptyChangeSet,

    /// An added member's key algorithm is not usable for group membership.
    #[error("key type not supported for group membership: {algorithm}")]
    KeyTypeNotSupported {
        /// The rejected algorithm.
        algorithm: KeyAlgorithm,
    },

    /// Ticket's participant count does not match the requested change.
    #[error("membership count mismatch: expected {expected} participants, ticket has {got}")]
    ParticipantCountMismatch {
        /// Count implied by previous membership plus the change.
        expected: usize,
        /// Count the ticket actually carries.
        got: usize,
    },

    /// An added member's key id in the ticket does not match their current
    /// public key.
    #[error("added member {identity} carries a mismatched key id")]
    AddedKeyIdMismatch {
        /// Identity whose embedded key id mismatched.
        identity: Identity,
    },

    /// A supposedly removed member is still present in the ticket.
    #[error("removed member {identity} is still present in the ticket")]
    RemovedMemberPresent {
        /// Identity that should have been removed.
        identity: Identity,
    },

    /// `GroupInfo` ticket without a membership snapshot.
    #[error("group info ticket carries no roster")]
    MissingRoster,

    /// The opaque engine rejected the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Persisting the mutated engine state failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Validate and convert raw bytes into a [`SessionId`].
pub fn session_id_from_slice(bytes: &[u8]) -> Result<SessionId, GroupSessionError> {
    SessionId::try_from(bytes)
        .map_err(|_| GroupSessionError::InvalidSessionId { length: bytes.len() })
}

/// One group session for the local member.
pub struct GroupSession<B: BlobStore> {
    engine: Box<dyn GroupRatchet>,
    store: Arc<GroupSessionStore<B>>,
}

impl<B: BlobStore> GroupSession<B> {
    pub(crate) fn new(engine: Box<dyn GroupRatchet>, store: Arc<GroupSessionStore<B>>) -> Self {
        Self { engine, store }
    }

    pub(crate) fn join(
        provider: &dyn GroupRatchetProvider,
        local: &GroupMember,
        members: &[GroupMember],
        session_id: SessionId,
        ticket: &Ticket,
        store: Arc<GroupSessionStore<B>>,
    ) -> Result<Self, GroupSessionError> {
        require_kind(ticket, TicketKind::GroupInfo)?;
        if ticket.session_id != session_id {
            return Err(GroupSessionError::SessionIdMismatch);
        }
        let engine = provider.join(local, members, session_id, ticket)?;
        let session = Self::new(engine, store);
        session.persist()?;
        Ok(session)
    }

    /// Session id of this group.
    pub fn session_id(&self) -> SessionId {
        self.engine.session_id()
    }

    /// Membership epoch the session currently reflects.
    pub fn epoch(&self) -> u64 {
        self.engine.epoch()
    }

    /// Number of participants at the current epoch.
    pub fn participant_count(&self) -> usize {
        self.engine.participant_count()
    }

    /// Encrypt a plaintext into a `Regular` ticket and persist the advanced
    /// engine state.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Ticket, GroupSessionError> {
        let ticket = self.engine.encrypt(plaintext)?;
        self.persist()?;
        Ok(ticket)
    }

    /// Decrypt a `Regular` ticket and persist the advanced engine state.
    ///
    /// A ticket for an epoch the session has moved past fails with
    /// [`EngineError::StaleEpoch`]; the session itself stays usable.
    pub fn decrypt(&mut self, ticket: &Ticket) -> Result<Vec<u8>, GroupSessionError> {
        require_kind(ticket, TicketKind::Regular)?;
        let plaintext = self.engine.decrypt(ticket)?;
        self.persist()?;
        Ok(plaintext)
    }

    /// Build a `GroupInfo` ticket adding and/or removing members.
    ///
    /// Does not advance this session; apply the ticket with
    /// [`GroupSession::use_change_members_ticket`] once distributed.
    pub fn create_change_members_ticket(
        &self,
        add: &[Card],
        remove: &[Identity],
    ) -> Result<Ticket, GroupSessionError> {
        if add.is_empty() && remove.is_empty() {
            return Err(GroupSessionError::EmptyChangeSet);
        }
        let added = members_from_cards(add)?;
        Ok(self.engine.create_group_info(&added, remove)?)
    }

    /// Validate and apply a membership-change ticket, advancing the epoch.
    ///
    /// The ticket must perform exactly the change described by `add` and
    /// `remove`: its participant count must equal the previous count plus
    /// additions minus removals, every added member's embedded key id must
    /// match their current public key, and no removed member may remain.
    pub fn use_change_members_ticket(
        &mut self,
        ticket: &Ticket,
        add: &[Card],
        remove: &[Identity],
    ) -> Result<(), GroupSessionError> {
        require_kind(ticket, TicketKind::GroupInfo)?;
        if add.is_empty() && remove.is_empty() {
            return Err(GroupSessionError::EmptyChangeSet);
        }
        let roster = ticket.roster.as_ref().ok_or(GroupSessionError::MissingRoster)?;

        let Some(expected) =
            (self.engine.participant_count() + add.len()).checked_sub(remove.len())
        else {
            return Err(GroupSessionError::ParticipantCountMismatch {
                expected: 0,
                got: roster.len(),
            });
        };
        if roster.len() != expected {
            return Err(GroupSessionError::ParticipantCountMismatch {
                expected,
                got: roster.len(),
            });
        }

        verify_change(roster, add, remove)?;

        self.engine.apply_group_info(ticket)?;
        self.persist()?;
        Ok(())
    }

    /// Re-persist the current engine state.
    pub fn persist(&self) -> Result<(), GroupSessionError> {
        let state = self.engine.serialize()?;
        self.store.write_state(&self.engine.session_id(), &state)?;
        Ok(())
    }
}

fn require_kind(ticket: &Ticket, expected: TicketKind) -> Result<(), GroupSessionError> {
    if ticket.kind == expected {
        Ok(())
    } else {
        Err(GroupSessionError::WrongTicketKind { expected, got: ticket.kind })
    }
}

fn verify_change(
    roster: &BTreeMap<Identity, KeyId>,
    add: &[Card],
    remove: &[Identity],
) -> Result<(), GroupSessionError> {
    for card in add {
        let derived = KeyId::of(&card.public_key.bytes);
        match roster.get(&card.identity) {
            Some(embedded) if *embedded == derived => {},
            _ => {
                return Err(GroupSessionError::AddedKeyIdMismatch {
                    identity: card.identity.clone(),
                });
            },
        }
    }
    for identity in remove {
        if roster.contains_key(identity) {
            return Err(GroupSessionError::RemovedMemberPresent { identity: identity.clone() });
        }
    }
    Ok(())
}

pub(crate) fn members_from_cards(cards: &[Card]) -> Result<Vec<GroupMember>, GroupSessionError> {
    cards
        .iter()
        .map(|card| {
            if card.public_key.algorithm != KeyAlgorithm::Ed25519 {
                return Err(GroupSessionError::KeyTypeNotSupported {
                    algorithm: card.public_key.algorithm,
                });
            }
            Ok(GroupMember { identity: card.identity.clone(), public_key: card.public_key.clone() })
        })
        .collect()
}
