//! End-to-end pairwise session flows through the orchestrator.

#![allow(clippy::unwrap_used, reason = "test code")]

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use palisade_core::{
    Card, Chat, ChatContext, ChatError, DirectoryError, Identity, IdentityPublicKeySet,
    KeyAlgorithm, KeyDirectory, KeyId, MemoryBlobStore, MemoryStoreProvider, PublicKeySet,
    RatchetMessage, RawPublicKey, RotationConfig, SignedPublicKey, ValidationReport,
};
use palisade_harness::{
    ManualClock, MemoryKeyDirectory, SimGroupRatchetProvider, SimRatchetCrypto,
    StaticTokenProvider,
};
use rand::RngCore;

fn config(desired_one_time_keys: usize) -> RotationConfig {
    RotationConfig { desired_one_time_keys, ..RotationConfig::default() }
}

struct Fixture {
    directory: MemoryKeyDirectory,
    clock: ManualClock,
    provider: MemoryStoreProvider,
}

impl Fixture {
    fn new() -> Self {
        Self {
            directory: MemoryKeyDirectory::new(),
            clock: ManualClock::default(),
            provider: MemoryStoreProvider::new(),
        }
    }

    fn join(&self, name: &str, rotation: RotationConfig) -> (Chat<MemoryBlobStore>, Card) {
        self.join_with_directory(name, rotation, Arc::new(self.directory.clone()))
    }

    fn join_with_directory(
        &self,
        name: &str,
        rotation: RotationConfig,
        directory: Arc<dyn KeyDirectory>,
    ) -> (Chat<MemoryBlobStore>, Card) {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);

        let card = Card {
            identity: Identity::new(name),
            public_key: RawPublicKey {
                algorithm: KeyAlgorithm::Ed25519,
                bytes: signing_key.verifying_key().to_bytes().to_vec(),
            },
            card_id: format!("{name}-card"),
        };
        self.directory.register_card(&card);

        let context = ChatContext {
            card: card.clone(),
            signing_key,
            crypto: Arc::new(SimRatchetCrypto::new()),
            group_crypto: Arc::new(SimGroupRatchetProvider::new()),
            directory,
            tokens: Arc::new(StaticTokenProvider::for_identity(&card.identity)),
            clock: Arc::new(self.clock.clone()),
            rotation,
        };
        let chat = Chat::new(context, &self.provider).unwrap();
        (chat, card)
    }
}

#[test]
fn session_roundtrip_with_persistence() {
    let fixture = Fixture::new();
    let (alice, alice_card) = fixture.join("alice", config(4));
    let (bob, bob_card) = fixture.join("bob", config(4));
    alice.rotate_keys().unwrap();
    bob.rotate_keys().unwrap();

    let mut sending = alice.start_new_session_as_sender(&bob_card, None).unwrap();
    let first = sending.encrypt(b"hello bob").unwrap();
    assert!(matches!(first, RatchetMessage::Prekey(_)));

    let mut receiving = bob.start_new_session_as_receiver(&alice_card, None, &first).unwrap();
    assert_eq!(receiving.decrypt(&first).unwrap(), b"hello bob");

    // Drop both handles and keep talking through reloaded sessions; every
    // mutation must have landed in storage.
    drop(sending);
    drop(receiving);
    for round in 0..60u32 {
        let text = format!("message {round}");
        let mut sender = alice.existing_session(&bob_card.identity, None).unwrap().unwrap();
        let message = sender.encrypt(text.as_bytes()).unwrap();

        let mut receiver = bob.existing_session(&alice_card.identity, None).unwrap().unwrap();
        assert_eq!(receiver.decrypt(&message).unwrap(), text.as_bytes());

        let reply = receiver.encrypt(format!("ack {round}").as_bytes()).unwrap();
        let mut sender = alice.existing_session(&bob_card.identity, None).unwrap().unwrap();
        assert_eq!(sender.decrypt(&reply).unwrap(), format!("ack {round}").as_bytes());
    }
}

#[test]
fn receiving_consumes_and_replenishes_one_time_key() {
    let fixture = Fixture::new();
    let (alice, alice_card) = fixture.join("alice", config(4));
    let (bob, bob_card) = fixture.join("bob", config(4));
    alice.rotate_keys().unwrap();
    bob.rotate_keys().unwrap();
    assert_eq!(fixture.directory.one_time_pool_size(&bob_card.identity), 4);

    let mut sending = alice.start_new_session_as_sender(&bob_card, None).unwrap();
    let first = sending.encrypt(b"hi").unwrap();
    // The fetch consumed one of bob's keys server-side.
    assert_eq!(fixture.directory.one_time_pool_size(&bob_card.identity), 3);

    bob.start_new_session_as_receiver(&alice_card, None, &first).unwrap();
    // Receiving deleted the used private half and uploaded a replacement.
    assert_eq!(fixture.directory.one_time_pool_size(&bob_card.identity), 4);
}

#[test]
fn exhausted_pool_still_yields_a_session() {
    let fixture = Fixture::new();
    let (alice, alice_card) = fixture.join("alice", config(4));
    let (bob, bob_card) = fixture.join("bob", config(0));
    alice.rotate_keys().unwrap();
    bob.rotate_keys().unwrap();
    assert_eq!(fixture.directory.one_time_pool_size(&bob_card.identity), 0);

    let mut sending = alice.start_new_session_as_sender(&bob_card, None).unwrap();
    let first = sending.encrypt(b"no one-time key today").unwrap();
    let RatchetMessage::Prekey(envelope) = &first else {
        unreachable!("initiation always produces a prekey message first");
    };
    assert!(envelope.one_time_key_id.is_none());

    let mut receiving = bob.start_new_session_as_receiver(&alice_card, None, &first).unwrap();
    assert_eq!(receiving.decrypt(&first).unwrap(), b"no one-time key today");
}

#[test]
fn duplicate_sessions_are_rejected_but_named_sessions_coexist() {
    let fixture = Fixture::new();
    let (alice, alice_card) = fixture.join("alice", config(4));
    let (bob, bob_card) = fixture.join("bob", config(4));
    alice.rotate_keys().unwrap();
    bob.rotate_keys().unwrap();

    let mut sending = alice.start_new_session_as_sender(&bob_card, None).unwrap();
    let first = sending.encrypt(b"hello").unwrap();
    bob.start_new_session_as_receiver(&alice_card, None, &first).unwrap();

    assert!(matches!(
        alice.start_new_session_as_sender(&bob_card, None),
        Err(ChatError::SessionAlreadyExists { .. })
    ));
    assert!(matches!(
        bob.start_new_session_as_receiver(&alice_card, None, &first),
        Err(ChatError::SessionAlreadyExists { .. })
    ));

    // A differently named session with the same peer is a separate slot.
    let mut work = alice.start_new_session_as_sender(&bob_card, Some("work")).unwrap();
    let work_first = work.encrypt(b"status?").unwrap();
    let mut receiving =
        bob.start_new_session_as_receiver(&alice_card, Some("work"), &work_first).unwrap();
    assert_eq!(receiving.decrypt(&work_first).unwrap(), b"status?");
}

#[test]
fn batch_session_start() {
    let fixture = Fixture::new();
    let (alice, _) = fixture.join("alice", config(4));
    let (bob, bob_card) = fixture.join("bob", config(4));
    let (carol, carol_card) = fixture.join("carol", config(4));
    alice.rotate_keys().unwrap();
    bob.rotate_keys().unwrap();
    carol.rotate_keys().unwrap();

    let sessions = alice
        .start_multiple_new_sessions_as_sender(&[bob_card.clone(), carol_card.clone()], None)
        .unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(alice.existing_session(&bob_card.identity, None).unwrap().is_some());
    assert!(alice.existing_session(&carol_card.identity, None).unwrap().is_some());
}

/// Directory that drops the last bundle of every batch response.
struct TruncatingDirectory {
    inner: MemoryKeyDirectory,
}

impl KeyDirectory for TruncatingDirectory {
    fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[RawPublicKey],
        token: &str,
    ) -> Result<(), DirectoryError> {
        self.inner.upload_public_keys(identity_card_id, long_term_key, one_time_keys, token)
    }

    fn validate_public_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
        token: &str,
    ) -> Result<ValidationReport, DirectoryError> {
        self.inner.validate_public_keys(long_term_key_id, one_time_key_ids, token)
    }

    fn get_public_key_set(
        &self,
        identity: &Identity,
        token: &str,
    ) -> Result<PublicKeySet, DirectoryError> {
        self.inner.get_public_key_set(identity, token)
    }

    fn get_multiple_public_key_sets(
        &self,
        identities: &[Identity],
        token: &str,
    ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError> {
        let mut sets = self.inner.get_multiple_public_key_sets(identities, token)?;
        sets.pop();
        Ok(sets)
    }

    fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError> {
        self.inner.delete_keys_entity(token)
    }
}

#[test]
fn short_batch_response_is_rejected() {
    let fixture = Fixture::new();
    let truncating = Arc::new(TruncatingDirectory { inner: fixture.directory.clone() });
    let (alice, _) = fixture.join_with_directory("alice", config(4), truncating);
    let (bob, bob_card) = fixture.join("bob", config(4));
    let (carol, carol_card) = fixture.join("carol", config(4));
    bob.rotate_keys().unwrap();
    carol.rotate_keys().unwrap();

    let err = alice
        .start_multiple_new_sessions_as_sender(&[bob_card, carol_card], None)
        .unwrap_err();
    assert!(matches!(err, ChatError::PublicKeySetsMismatch { requested: 2, usable: 1 }));
}

#[test]
fn tampered_long_term_signature_is_rejected() {
    let fixture = Fixture::new();
    let (alice, _) = fixture.join("alice", config(4));
    let (bob, bob_card) = fixture.join("bob", config(4));
    alice.rotate_keys().unwrap();
    bob.rotate_keys().unwrap();

    // Overwrite bob's long-term key server-side with a badly signed one.
    let forged = SignedPublicKey {
        key: RawPublicKey { algorithm: KeyAlgorithm::Curve25519, bytes: vec![7u8; 32] },
        signature: vec![0u8; 64],
    };
    fixture
        .directory
        .upload_public_keys(None, Some(&forged), &[], bob_card.identity.as_str())
        .unwrap();

    let err = alice.start_new_session_as_sender(&bob_card, None).unwrap_err();
    assert!(matches!(err, ChatError::InvalidLongTermKeySignature { .. }));
}

#[test]
fn reset_wipes_local_and_remote_state() {
    let fixture = Fixture::new();
    let (alice, alice_card) = fixture.join("alice", config(4));
    let (bob, bob_card) = fixture.join("bob", config(4));
    alice.rotate_keys().unwrap();
    bob.rotate_keys().unwrap();

    let mut sending = alice.start_new_session_as_sender(&bob_card, None).unwrap();
    sending.encrypt(b"soon to be gone").unwrap();

    alice.reset().unwrap();
    assert!(!fixture.directory.has_keys_entity(&alice_card.identity));
    assert!(alice.existing_session(&bob_card.identity, None).unwrap().is_none());

    // A fresh rotation counts as a first upload again.
    fixture.clock.advance(Duration::from_secs(60));
    let log = alice.rotate_keys().unwrap();
    assert_eq!(log.long_term_keys_added, 1);
    assert_eq!(log.one_time_keys_added, 4);
    assert!(fixture.directory.has_keys_entity(&alice_card.identity));
}
