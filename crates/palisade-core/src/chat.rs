//! Session-layer orchestrator.
//!
//! [`Chat`] ties one identity's key stores, rotator, and remote directory
//! together. Surrounding code talks to this type only; the stores and the
//! rotator are implementation detail.

use std::sync::Arc;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::{
    clock::Clock,
    directory::{AccessTokenProvider, DirectoryError, KeyDirectory, PublicKeySet},
    engine::{
        EngineError, GroupMember, GroupRatchetProvider, InitiationKeys, RatchetCrypto,
        RatchetMessage, ResponderKeys, Ticket,
    },
    group::{GroupSession, GroupSessionError, GroupSessionStore, session_id_from_slice},
    identity::{Card, Identity, KeyAlgorithm, KeyId, RawPublicKey},
    keys::{KeyStoreError, LongTermKeyStore, OneTimeKeyStore},
    rotation::{KeysRotator, RotationConfig, RotationError, RotationLog},
    session::{DEFAULT_SESSION_NAME, Session, SessionError, SessionStore},
    storage::{BlobStore, BlobStoreProvider, EncryptedStore, StorageError, StoreCrypto, category},
};

const OP_START_SESSION: &str = "start-session";
const OP_START_SESSIONS: &str = "start-sessions";
const OP_ROTATE_KEYS: &str = "rotate-keys";
const OP_REPLENISH_ONE_TIME_KEY: &str = "replenish-one-time-key";
const OP_DELETE_KEYS_ENTITY: &str = "delete-keys-entity";

/// Errors from orchestrator operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// A session under this (participant, name) is already stored.
    #[error("session already exists for {identity} ({name})")]
    SessionAlreadyExists {
        /// Participant of the duplicate session.
        identity: Identity,
        /// Name of the duplicate session.
        name: String,
    },

    /// A group session under this id is already stored.
    #[error("group session already exists: {session_id}")]
    GroupSessionAlreadyExists {
        /// Hex-encoded session id.
        session_id: String,
    },

    /// An identity card carries a key of the wrong algorithm.
    #[error("identity key type not supported: {algorithm}")]
    WrongIdentityKeyType {
        /// The rejected algorithm.
        algorithm: KeyAlgorithm,
    },

    /// A directory bundle carries a pre-key of the wrong algorithm.
    #[error("pre-key type not supported: {algorithm}")]
    UnsupportedKeyType {
        /// The rejected algorithm.
        algorithm: KeyAlgorithm,
    },

    /// The bundle's long-term key signature did not verify against the
    /// peer's identity key.
    #[error("long-term key signature verification failed for {identity}")]
    InvalidLongTermKeySignature {
        /// Peer whose bundle failed verification.
        identity: Identity,
    },

    /// The bundle's identity key differs from the card's.
    #[error("directory identity key does not match card for {identity}")]
    IdentityKeyMismatch {
        /// Peer whose bundle mismatched.
        identity: Identity,
    },

    /// Batch bundle response does not match the request.
    #[error("public key set batch mismatch: requested {requested}, usable {usable}")]
    PublicKeySetsMismatch {
        /// Number of identities requested.
        requested: usize,
        /// Number of matching bundles received.
        usable: usize,
    },

    /// Message is not a session-initiation message.
    #[error("expected a prekey initiation message")]
    InvalidMessageType,

    /// Local key store failure.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Remote directory or token failure.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Opaque engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Pairwise session failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Group session failure.
    #[error(transparent)]
    Group(#[from] GroupSessionError),

    /// Key rotation failure.
    #[error(transparent)]
    Rotation(#[from] RotationError),
}

/// Collaborators and policy for one identity's [`Chat`].
pub struct ChatContext {
    /// Local identity card.
    pub card: Card,
    /// Local identity signing key; also keys the at-rest envelope.
    pub signing_key: ed25519_dalek::SigningKey,
    /// Opaque pairwise ratchet engine factory.
    pub crypto: Arc<dyn RatchetCrypto>,
    /// Opaque group ratchet engine factory.
    pub group_crypto: Arc<dyn GroupRatchetProvider>,
    /// Remote key directory client.
    pub directory: Arc<dyn KeyDirectory>,
    /// Access token provider.
    pub tokens: Arc<dyn AccessTokenProvider>,
    /// Wall clock for key-lifetime arithmetic.
    pub clock: Arc<dyn Clock>,
    /// Rotation policy.
    pub rotation: RotationConfig,
}

/// Per-identity session-layer orchestrator.
pub struct Chat<B: BlobStore> {
    card: Card,
    local_member: GroupMember,
    crypto: Arc<dyn RatchetCrypto>,
    group_crypto: Arc<dyn GroupRatchetProvider>,
    directory: Arc<dyn KeyDirectory>,
    tokens: Arc<dyn AccessTokenProvider>,
    long_term: Arc<LongTermKeyStore<B>>,
    one_time: Arc<OneTimeKeyStore<B>>,
    sessions: Arc<SessionStore<B>>,
    groups: Arc<GroupSessionStore<B>>,
    rotator: KeysRotator<B>,
}

impl<B: BlobStore> Chat<B> {
    /// Build the orchestrator, opening the identity's four storage
    /// categories through `storage`.
    pub fn new<P>(context: ChatContext, storage: &P) -> Result<Self, ChatError>
    where
        P: BlobStoreProvider<Store = B>,
    {
        if context.card.public_key.algorithm != KeyAlgorithm::Ed25519 {
            return Err(ChatError::WrongIdentityKeyType {
                algorithm: context.card.public_key.algorithm,
            });
        }

        let identity = &context.card.identity;
        let open = |cat: &str| -> Result<EncryptedStore<B>, ChatError> {
            let backend = storage.open(identity, cat)?;
            Ok(EncryptedStore::new(backend, StoreCrypto::derive(&context.signing_key, cat)))
        };

        let long_term = Arc::new(LongTermKeyStore::new(open(category::LONG_TERM_KEYS)?));
        let one_time = Arc::new(OneTimeKeyStore::new(open(category::ONE_TIME_KEYS)?));
        let sessions = Arc::new(SessionStore::new(open(category::SESSIONS)?));
        let groups = Arc::new(GroupSessionStore::new(
            open(category::GROUP_SESSIONS)?,
            identity.clone(),
        ));

        let rotator = KeysRotator::new(
            context.card.card_id.clone(),
            context.signing_key.clone(),
            Arc::clone(&long_term),
            Arc::clone(&one_time),
            Arc::clone(&context.crypto),
            Arc::clone(&context.directory),
            Arc::clone(&context.clock),
            context.rotation,
        );

        let local_member = GroupMember {
            identity: context.card.identity.clone(),
            public_key: context.card.public_key.clone(),
        };

        Ok(Self {
            card: context.card,
            local_member,
            crypto: context.crypto,
            group_crypto: context.group_crypto,
            directory: context.directory,
            tokens: context.tokens,
            long_term,
            one_time,
            sessions,
            groups,
            rotator,
        })
    }

    /// Local identity this orchestrator works for.
    pub fn identity(&self) -> &Identity {
        &self.card.identity
    }

    // ---- pairwise sessions ------------------------------------------------

    /// Start a session with a peer as the initiating side.
    ///
    /// Fetches the peer's bundle from the directory, validates it against
    /// the card, and stores the new session. A bundle without a one-time
    /// key still yields a session, with weaker forward secrecy; the
    /// condition is logged.
    pub fn start_new_session_as_sender(
        &self,
        peer: &Card,
        name: Option<&str>,
    ) -> Result<Session<B>, ChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        self.ensure_no_session(&peer.identity, name)?;
        require_ed25519(peer)?;

        let token = self.tokens.get_token(OP_START_SESSION)?;
        let set = self.directory.get_public_key_set(&peer.identity, &token)?;
        self.build_sender_session(peer, name, &set)
    }

    /// Start sessions with several peers in one directory round-trip.
    ///
    /// Fails with [`ChatError::PublicKeySetsMismatch`] unless the response
    /// contains exactly one bundle per requested identity.
    pub fn start_multiple_new_sessions_as_sender(
        &self,
        peers: &[Card],
        name: Option<&str>,
    ) -> Result<Vec<Session<B>>, ChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        for peer in peers {
            self.ensure_no_session(&peer.identity, name)?;
            require_ed25519(peer)?;
        }

        let identities: Vec<Identity> = peers.iter().map(|peer| peer.identity.clone()).collect();
        let token = self.tokens.get_token(OP_START_SESSIONS)?;
        let mut bundles = self.directory.get_multiple_public_key_sets(&identities, &token)?;

        if bundles.len() != peers.len() {
            return Err(ChatError::PublicKeySetsMismatch {
                requested: peers.len(),
                usable: bundles.len(),
            });
        }

        let mut sessions = Vec::with_capacity(peers.len());
        for peer in peers {
            let position = bundles
                .iter()
                .position(|bundle| bundle.identity == peer.identity)
                .ok_or(ChatError::PublicKeySetsMismatch {
                    requested: peers.len(),
                    usable: sessions.len(),
                })?;
            let bundle = bundles.swap_remove(position);
            sessions.push(self.build_sender_session(peer, name, &bundle.keys)?);
        }
        Ok(sessions)
    }

    /// Start a session from a received initiation message as the responder.
    ///
    /// Looks up the referenced long-term key and, if present, the one-time
    /// key; a consumed one-time key is deleted and replenished best-effort
    /// (replenishment failures are logged, never raised).
    pub fn start_new_session_as_receiver(
        &self,
        peer: &Card,
        name: Option<&str>,
        message: &RatchetMessage,
    ) -> Result<Session<B>, ChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        self.ensure_no_session(&peer.identity, name)?;
        require_ed25519(peer)?;

        let RatchetMessage::Prekey(envelope) = message else {
            return Err(ChatError::InvalidMessageType);
        };

        let long_term = self.long_term.retrieve(envelope.long_term_key_id)?;

        let engine = match envelope.one_time_key_id {
            None => self.crypto.respond(
                ResponderKeys { long_term_private: &long_term.private_key, one_time_private: None },
                envelope,
            )?,
            Some(one_time_id) => {
                let scope = self.one_time.begin_interaction()?;
                let one_time = self.one_time.retrieve(one_time_id)?;
                let engine = self.crypto.respond(
                    ResponderKeys {
                        long_term_private: &long_term.private_key,
                        one_time_private: Some(&one_time.private_key),
                    },
                    envelope,
                )?;
                // The key is single-use: drop it the moment it answered an
                // initiation.
                self.one_time.delete(one_time_id)?;
                scope.close()?;

                if let Err(err) = self.replenish_one_time_key() {
                    tracing::warn!(error = %err, "one-time key replenishment failed");
                }
                engine
            },
        };

        let session =
            Session::new(peer.identity.clone(), name.to_string(), engine, Arc::clone(&self.sessions));
        session.persist()?;
        Ok(session)
    }

    /// Re-persist a session explicitly.
    pub fn store_session(&self, session: &Session<B>) -> Result<(), ChatError> {
        session.persist()?;
        Ok(())
    }

    /// Load a stored session. `None` if nothing is stored under the key.
    pub fn existing_session(
        &self,
        participant: &Identity,
        name: Option<&str>,
    ) -> Result<Option<Session<B>>, ChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        let Some(state) = self.sessions.read_state(participant, name)? else {
            return Ok(None);
        };
        let engine = self.crypto.deserialize(&state)?;
        Ok(Some(Session::new(
            participant.clone(),
            name.to_string(),
            engine,
            Arc::clone(&self.sessions),
        )))
    }

    /// Delete a stored session. NotFound if absent.
    pub fn delete_session(&self, participant: &Identity, name: Option<&str>) -> Result<(), ChatError> {
        self.sessions.delete(participant, name.unwrap_or(DEFAULT_SESSION_NAME))?;
        Ok(())
    }

    /// Delete every stored pairwise session.
    pub fn delete_all_sessions(&self) -> Result<(), ChatError> {
        self.sessions.delete_all()?;
        Ok(())
    }

    // ---- group sessions ---------------------------------------------------

    /// Create a brand-new group session from a fresh 32-byte id.
    pub fn start_new_group_session(
        &self,
        session_id: &[u8],
    ) -> Result<GroupSession<B>, ChatError> {
        let id = session_id_from_slice(session_id)?;
        self.ensure_no_group_session(&id)?;

        let engine = self.group_crypto.create(&self.local_member, id)?;
        let session = GroupSession::new(engine, Arc::clone(&self.groups));
        session.persist()?;
        Ok(session)
    }

    /// Join a group session from a `GroupInfo` ticket.
    pub fn start_group_session(
        &self,
        members: &[Card],
        session_id: &[u8],
        ticket: &Ticket,
    ) -> Result<GroupSession<B>, ChatError> {
        let id = session_id_from_slice(session_id)?;
        self.ensure_no_group_session(&id)?;

        let member_list = crate::group::members_from_cards(members)?;
        let session = GroupSession::join(
            self.group_crypto.as_ref(),
            &self.local_member,
            &member_list,
            id,
            ticket,
            Arc::clone(&self.groups),
        )?;
        Ok(session)
    }

    /// Load a stored group session. `None` if nothing is stored.
    pub fn existing_group_session(
        &self,
        session_id: &[u8],
    ) -> Result<Option<GroupSession<B>>, ChatError> {
        let id = session_id_from_slice(session_id)?;
        let Some(state) = self.groups.read_state(&id)? else {
            return Ok(None);
        };
        let engine = self.group_crypto.deserialize(&state)?;
        Ok(Some(GroupSession::new(engine, Arc::clone(&self.groups))))
    }

    /// Delete a stored group session. NotFound if absent.
    pub fn delete_group_session(&self, session_id: &[u8]) -> Result<(), ChatError> {
        let id = session_id_from_slice(session_id)?;
        self.groups.delete(&id)?;
        Ok(())
    }

    // ---- keys -------------------------------------------------------------

    /// Run one key-rotation pass under a fresh access token.
    pub fn rotate_keys(&self) -> Result<RotationLog, ChatError> {
        let token = self.tokens.get_token(OP_ROTATE_KEYS)?;
        Ok(self.rotator.rotate_keys(&token)?)
    }

    /// Delete the identity's remote key record, then wipe local key and
    /// session storage.
    ///
    /// Not transactional: a failure after the remote delete leaves local
    /// and remote state inconsistent, and retrying is the only recovery.
    pub fn reset(&self) -> Result<(), ChatError> {
        let token = self.tokens.get_token(OP_DELETE_KEYS_ENTITY)?;
        self.directory.delete_keys_entity(&token)?;
        self.one_time.reset()?;
        self.long_term.reset()?;
        self.sessions.delete_all()?;
        Ok(())
    }

    // ---- internals --------------------------------------------------------

    fn ensure_no_session(&self, participant: &Identity, name: &str) -> Result<(), ChatError> {
        if self.sessions.exists(participant, name)? {
            return Err(ChatError::SessionAlreadyExists {
                identity: participant.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_no_group_session(&self, id: &crate::engine::SessionId) -> Result<(), ChatError> {
        if self.groups.exists(id)? {
            return Err(ChatError::GroupSessionAlreadyExists { session_id: hex::encode(id) });
        }
        Ok(())
    }

    fn build_sender_session(
        &self,
        peer: &Card,
        name: &str,
        set: &PublicKeySet,
    ) -> Result<Session<B>, ChatError> {
        validate_bundle(peer, set)?;

        if set.one_time_key.is_none() {
            tracing::warn!(
                peer = %peer.identity,
                "peer had no one-time key left; session has weaker forward secrecy"
            );
        }

        let engine = self.crypto.initiate(InitiationKeys {
            identity_key: &set.identity_key.bytes,
            long_term_public: &set.long_term_key.key.bytes,
            one_time_public: set.one_time_key.as_ref().map(|key| key.bytes.as_slice()),
        })?;

        let session =
            Session::new(peer.identity.clone(), name.to_string(), engine, Arc::clone(&self.sessions));
        session.persist()?;
        Ok(session)
    }

    fn replenish_one_time_key(&self) -> Result<(), ChatError> {
        let token = self.tokens.get_token(OP_REPLENISH_ONE_TIME_KEY)?;
        let pair = self.crypto.generate_key_pair()?;
        let id = KeyId::of(&pair.public_key);

        let scope = self.one_time.begin_interaction()?;
        self.one_time.store_key(&pair.private_key, id)?;
        scope.close()?;

        self.directory.upload_public_keys(
            None,
            None,
            &[RawPublicKey { algorithm: KeyAlgorithm::Curve25519, bytes: pair.public_key }],
            &token,
        )?;
        tracing::debug!(key_id = %id, "replenished one consumed one-time key");
        Ok(())
    }
}

fn require_ed25519(peer: &Card) -> Result<(), ChatError> {
    if peer.public_key.algorithm != KeyAlgorithm::Ed25519 {
        return Err(ChatError::WrongIdentityKeyType { algorithm: peer.public_key.algorithm });
    }
    Ok(())
}

fn validate_bundle(peer: &Card, set: &PublicKeySet) -> Result<(), ChatError> {
    if set.identity_key != peer.public_key {
        return Err(ChatError::IdentityKeyMismatch { identity: peer.identity.clone() });
    }
    if set.long_term_key.key.algorithm != KeyAlgorithm::Curve25519 {
        return Err(ChatError::UnsupportedKeyType { algorithm: set.long_term_key.key.algorithm });
    }

    let key_bytes: [u8; 32] = peer
        .public_key
        .bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChatError::WrongIdentityKeyType { algorithm: peer.public_key.algorithm })?;
    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| ChatError::WrongIdentityKeyType { algorithm: peer.public_key.algorithm })?;
    let signature = Signature::from_slice(&set.long_term_key.signature)
        .map_err(|_| ChatError::InvalidLongTermKeySignature { identity: peer.identity.clone() })?;
    verifying
        .verify(&set.long_term_key.key.bytes, &signature)
        .map_err(|_| ChatError::InvalidLongTermKeySignature { identity: peer.identity.clone() })?;
    Ok(())
}
