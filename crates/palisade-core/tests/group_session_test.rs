//! Group session membership and epoch flows through the orchestrator.

#![allow(clippy::unwrap_used, reason = "test code")]

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use palisade_core::{
    Card, Chat, ChatContext, ChatError, EngineError, GroupSessionError, Identity, KeyAlgorithm,
    KeyId, MemoryBlobStore, MemoryStoreProvider, RawPublicKey, RotationConfig,
};
use palisade_harness::{
    ManualClock, MemoryKeyDirectory, SimGroupRatchetProvider, SimRatchetCrypto,
    StaticTokenProvider,
};
use rand::RngCore;

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

    fn join(&self, name: &str) -> (Chat<MemoryBlobStore>, Card) {
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
            directory: Arc::new(self.directory.clone()),
            tokens: Arc::new(StaticTokenProvider::for_identity(&card.identity)),
            clock: Arc::new(self.clock.clone()),
            rotation: RotationConfig::default(),
        };
        let chat = Chat::new(context, &self.provider).unwrap();
        (chat, card)
    }
}

#[test]
fn create_add_member_and_exchange() {
    let fixture = Fixture::new();
    let (alice, alice_card) = fixture.join("alice");
    let (bob, bob_card) = fixture.join("bob");
    let id = [1u8; 32];

    let mut group = alice.start_new_group_session(&id).unwrap();
    assert_eq!(group.epoch(), 0);
    assert_eq!(group.participant_count(), 1);

    let invite = group.create_change_members_ticket(&[bob_card.clone()], &[]).unwrap();
    group.use_change_members_ticket(&invite, &[bob_card.clone()], &[]).unwrap();
    assert_eq!(group.epoch(), 1);
    assert_eq!(group.participant_count(), 2);

    let mut joined = bob.start_group_session(&[alice_card], &id, &invite).unwrap();
    assert_eq!(joined.epoch(), 1);
    assert_eq!(joined.participant_count(), 2);

    let ticket = group.encrypt(b"welcome").unwrap();
    assert_eq!(joined.decrypt(&ticket).unwrap(), b"welcome");
    let reply = joined.encrypt(b"glad to be here").unwrap();
    assert_eq!(group.decrypt(&reply).unwrap(), b"glad to be here");
}

#[test]
fn sessions_survive_reload_and_deletion() {
    let fixture = Fixture::new();
    let (alice, _) = fixture.join("alice");
    let id = [2u8; 32];

    let mut group = alice.start_new_group_session(&id).unwrap();
    group.encrypt(b"to myself").unwrap();
    drop(group);

    let reloaded = alice.existing_group_session(&id).unwrap().unwrap();
    assert_eq!(reloaded.session_id(), id);
    assert_eq!(reloaded.epoch(), 0);

    assert!(matches!(
        alice.start_new_group_session(&id),
        Err(ChatError::GroupSessionAlreadyExists { .. })
    ));

    alice.delete_group_session(&id).unwrap();
    assert!(alice.existing_group_session(&id).unwrap().is_none());
}

#[test]
fn change_ticket_must_match_the_requested_change() {
    let fixture = Fixture::new();
    let (alice, _) = fixture.join("alice");
    let (_, bob_card) = fixture.join("bob");
    let (_, carol_card) = fixture.join("carol");
    let id = [3u8; 32];

    let mut group = alice.start_new_group_session(&id).unwrap();
    let invite = group.create_change_members_ticket(&[bob_card.clone()], &[]).unwrap();

    // Claiming two additions against a one-addition ticket.
    let err = group
        .use_change_members_ticket(&invite, &[bob_card.clone(), carol_card], &[])
        .unwrap_err();
    assert!(matches!(
        err,
        GroupSessionError::ParticipantCountMismatch { expected: 3, got: 2 }
    ));

    // The added member's current key differs from the one in the ticket.
    let mut stale_bob = bob_card.clone();
    stale_bob.public_key.bytes = vec![9u8; 32];
    let err = group.use_change_members_ticket(&invite, &[stale_bob], &[]).unwrap_err();
    assert!(matches!(err, GroupSessionError::AddedKeyIdMismatch { .. }));

    // The untampered change still applies.
    group.use_change_members_ticket(&invite, &[bob_card], &[]).unwrap();
    assert_eq!(group.participant_count(), 2);
}

#[test]
fn removed_member_must_be_absent_from_the_ticket() {
    let fixture = Fixture::new();
    let (alice, _) = fixture.join("alice");
    let (_, bob_card) = fixture.join("bob");
    let id = [4u8; 32];

    let mut group = alice.start_new_group_session(&id).unwrap();
    let invite = group.create_change_members_ticket(&[bob_card.clone()], &[]).unwrap();
    group.use_change_members_ticket(&invite, &[bob_card.clone()], &[]).unwrap();

    let mut eviction = group.create_change_members_ticket(&[], &[bob_card.identity.clone()]).unwrap();
    // Tamper the snapshot so the supposedly removed member is still listed.
    let roster = eviction.roster.as_mut().unwrap();
    roster.clear();
    roster.insert(bob_card.identity.clone(), KeyId::of(&bob_card.public_key.bytes));

    let err = group
        .use_change_members_ticket(&eviction, &[], &[bob_card.identity])
        .unwrap_err();
    assert!(matches!(err, GroupSessionError::RemovedMemberPresent { .. }));
}

#[test]
fn skipped_epoch_fails_without_corrupting_the_session() {
    let fixture = Fixture::new();
    let (alice, _) = fixture.join("alice");
    let (_, bob_card) = fixture.join("bob");
    let id = [5u8; 32];

    let mut group = alice.start_new_group_session(&id).unwrap();
    let mut invite = group.create_change_members_ticket(&[bob_card.clone()], &[]).unwrap();
    invite.epoch += 1;

    let err = group.use_change_members_ticket(&invite, &[bob_card.clone()], &[]).unwrap_err();
    let GroupSessionError::Engine(engine_err) = err else {
        unreachable!("epoch gap surfaces as an engine error");
    };
    assert!(matches!(engine_err, EngineError::NonConsequent { current_epoch: 0, ticket_epoch: 2 }));
    assert!(engine_err.is_fatal());

    // The session is untouched and a well-formed ticket still applies.
    assert_eq!(group.epoch(), 0);
    let invite = group.create_change_members_ticket(&[bob_card.clone()], &[]).unwrap();
    group.use_change_members_ticket(&invite, &[bob_card], &[]).unwrap();
    assert_eq!(group.epoch(), 1);
}

#[test]
fn message_from_an_old_epoch_is_stale_not_fatal() {
    let fixture = Fixture::new();
    let (alice, alice_card) = fixture.join("alice");
    let (bob, bob_card) = fixture.join("bob");
    let (_, carol_card) = fixture.join("carol");
    let id = [6u8; 32];

    let mut group = alice.start_new_group_session(&id).unwrap();
    let invite = group.create_change_members_ticket(&[bob_card.clone()], &[]).unwrap();
    group.use_change_members_ticket(&invite, &[bob_card.clone()], &[]).unwrap();
    let mut joined = bob.start_group_session(&[alice_card], &id, &invite).unwrap();

    // A message sent at epoch 1, delivered after bob moved to epoch 2.
    let old = group.encrypt(b"late delivery").unwrap();
    let expansion = group.create_change_members_ticket(&[carol_card.clone()], &[]).unwrap();
    joined.use_change_members_ticket(&expansion, &[carol_card.clone()], &[]).unwrap();
    assert_eq!(joined.epoch(), 2);

    let err = joined.decrypt(&old).unwrap_err();
    let GroupSessionError::Engine(engine_err) = err else {
        unreachable!("stale epoch surfaces as an engine error");
    };
    assert!(matches!(
        engine_err,
        EngineError::StaleEpoch { current_epoch: 2, message_epoch: 1 }
    ));
    assert!(!engine_err.is_fatal());

    // Current-epoch traffic still flows once both sides applied the change.
    group.use_change_members_ticket(&expansion, &[carol_card], &[]).unwrap();
    let fresh = group.encrypt(b"fresh epoch").unwrap();
    assert_eq!(joined.decrypt(&fresh).unwrap(), b"fresh epoch");
}
