//! Deterministic group ratchet simulation.
//!
//! Models the epoch chain exactly: membership tickets advance the epoch by
//! one, regular tickets only decrypt at the epoch they were produced for,
//! and per-sender counters enforce in-order delivery. The group secret
//! travels inside `GroupInfo` payloads in the clear, so the simulation has
//! no real confidentiality; only the contract matters.

use std::collections::BTreeMap;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use palisade_core::{
    EngineError, GroupMember, GroupRatchet, GroupRatchetProvider, Identity, KeyId, SessionId,
    Ticket, TicketKind,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;

const NONCE_LEN: usize = 24;

fn fresh_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

fn sender_key(secret: &[u8; 32], epoch: u64, sender: &Identity, counter: u64) -> [u8; 32] {
    let hkdf = Hkdf::<Sha512>::new(None, secret);
    let mut info = Vec::new();
    info.extend_from_slice(b"palisade-sim-group");
    info.extend_from_slice(&epoch.to_be_bytes());
    info.extend_from_slice(sender.as_str().as_bytes());
    info.extend_from_slice(&counter.to_be_bytes());
    let mut key = [0u8; 32];
    let _ = hkdf.expand(&info, &mut key);
    key
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupInfoBody {
    secret: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegularBody {
    sender: Identity,
    counter: u64,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupState {
    session_id: SessionId,
    epoch: u64,
    secret: [u8; 32],
    roster: BTreeMap<Identity, KeyId>,
    local: Identity,
    send_count: u64,
    recv_counts: BTreeMap<Identity, u64>,
}

/// Simulated group engine.
pub struct SimGroupRatchet {
    state: GroupState,
}

impl GroupRatchet for SimGroupRatchet {
    fn session_id(&self) -> SessionId {
        self.state.session_id
    }

    fn epoch(&self) -> u64 {
        self.state.epoch
    }

    fn participant_count(&self) -> usize {
        self.state.roster.len()
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Ticket, EngineError> {
        let key = sender_key(&self.state.secret, self.state.epoch, &self.state.local, self.state.send_count);
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;

        let body = RegularBody {
            sender: self.state.local.clone(),
            counter: self.state.send_count,
            nonce,
            ciphertext,
        };
        let mut payload = Vec::new();
        ciborium::into_writer(&body, &mut payload)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        self.state.send_count += 1;

        Ok(Ticket {
            kind: TicketKind::Regular,
            session_id: self.state.session_id,
            epoch: self.state.epoch,
            roster: None,
            payload,
        })
    }

    fn decrypt(&mut self, ticket: &Ticket) -> Result<Vec<u8>, EngineError> {
        if ticket.session_id != self.state.session_id {
            return Err(EngineError::Crypto("ticket for a different session".to_string()));
        }
        if ticket.epoch != self.state.epoch {
            return Err(EngineError::StaleEpoch {
                current_epoch: self.state.epoch,
                message_epoch: ticket.epoch,
            });
        }
        let body: RegularBody = ciborium::from_reader(ticket.payload.as_slice())
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        if !self.state.roster.contains_key(&body.sender) {
            return Err(EngineError::BadKeyMaterial(format!(
                "sender {} is not a group member",
                body.sender
            )));
        }
        let expected = self.state.recv_counts.get(&body.sender).copied().unwrap_or(0);
        if body.counter != expected {
            return Err(EngineError::Crypto(format!(
                "out-of-order ticket from {}: expected {expected}, got {}",
                body.sender, body.counter
            )));
        }

        let key = sender_key(&self.state.secret, self.state.epoch, &body.sender, body.counter);
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        let plaintext = cipher
            .decrypt(XNonce::from_slice(&body.nonce), body.ciphertext.as_slice())
            .map_err(|_| EngineError::Crypto("authentication failed".to_string()))?;

        self.state.recv_counts.insert(body.sender, expected + 1);
        Ok(plaintext)
    }

    fn create_group_info(
        &self,
        add: &[GroupMember],
        remove: &[Identity],
    ) -> Result<Ticket, EngineError> {
        let mut roster = self.state.roster.clone();
        for identity in remove {
            if roster.remove(identity).is_none() {
                return Err(EngineError::BadKeyMaterial(format!(
                    "cannot remove {identity}: not a member"
                )));
            }
        }
        for member in add {
            let id = KeyId::of(&member.public_key.bytes);
            if roster.insert(member.identity.clone(), id).is_some() {
                return Err(EngineError::BadKeyMaterial(format!(
                    "cannot add {}: already a member",
                    member.identity
                )));
            }
        }

        // Removals rotate the secret so departed members cannot read on.
        let secret = if remove.is_empty() { self.state.secret } else { fresh_secret() };
        let mut payload = Vec::new();
        ciborium::into_writer(&GroupInfoBody { secret }, &mut payload)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;

        Ok(Ticket {
            kind: TicketKind::GroupInfo,
            session_id: self.state.session_id,
            epoch: self.state.epoch + 1,
            roster: Some(roster),
            payload,
        })
    }

    fn apply_group_info(&mut self, ticket: &Ticket) -> Result<(), EngineError> {
        if ticket.epoch != self.state.epoch + 1 {
            return Err(EngineError::NonConsequent {
                current_epoch: self.state.epoch,
                ticket_epoch: ticket.epoch,
            });
        }
        let Some(roster) = &ticket.roster else {
            return Err(EngineError::BadKeyMaterial(
                "membership ticket without a roster".to_string(),
            ));
        };
        let body: GroupInfoBody = ciborium::from_reader(ticket.payload.as_slice())
            .map_err(|e| EngineError::Crypto(e.to_string()))?;

        self.state.epoch = ticket.epoch;
        self.state.secret = body.secret;
        self.state.roster = roster.clone();
        self.state.send_count = 0;
        self.state.recv_counts.clear();
        Ok(())
    }

    fn serialize(&self) -> Result<Vec<u8>, EngineError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&self.state, &mut bytes)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        Ok(bytes)
    }
}

/// Factory for simulated group engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimGroupRatchetProvider;

impl SimGroupRatchetProvider {
    /// Create the factory.
    pub fn new() -> Self {
        Self
    }
}

impl GroupRatchetProvider for SimGroupRatchetProvider {
    fn create(
        &self,
        local: &GroupMember,
        session_id: SessionId,
    ) -> Result<Box<dyn GroupRatchet>, EngineError> {
        let mut roster = BTreeMap::new();
        roster.insert(local.identity.clone(), KeyId::of(&local.public_key.bytes));
        Ok(Box::new(SimGroupRatchet {
            state: GroupState {
                session_id,
                epoch: 0,
                secret: fresh_secret(),
                roster,
                local: local.identity.clone(),
                send_count: 0,
                recv_counts: BTreeMap::new(),
            },
        }))
    }

    fn join(
        &self,
        local: &GroupMember,
        members: &[GroupMember],
        session_id: SessionId,
        ticket: &Ticket,
    ) -> Result<Box<dyn GroupRatchet>, EngineError> {
        let Some(roster) = &ticket.roster else {
            return Err(EngineError::BadKeyMaterial(
                "membership ticket without a roster".to_string(),
            ));
        };
        let local_id = KeyId::of(&local.public_key.bytes);
        if roster.get(&local.identity) != Some(&local_id) {
            return Err(EngineError::BadKeyMaterial(format!(
                "{} is not part of this membership snapshot",
                local.identity
            )));
        }
        for member in members {
            if let Some(listed) = roster.get(&member.identity) {
                if *listed != KeyId::of(&member.public_key.bytes) {
                    return Err(EngineError::BadKeyMaterial(format!(
                        "key for {} does not match the snapshot",
                        member.identity
                    )));
                }
            }
        }
        let body: GroupInfoBody = ciborium::from_reader(ticket.payload.as_slice())
            .map_err(|e| EngineError::Crypto(e.to_string()))?;

        Ok(Box::new(SimGroupRatchet {
            state: GroupState {
                session_id,
                epoch: ticket.epoch,
                secret: body.secret,
                roster: roster.clone(),
                local: local.identity.clone(),
                send_count: 0,
                recv_counts: BTreeMap::new(),
            },
        }))
    }

    fn deserialize(&self, state: &[u8]) -> Result<Box<dyn GroupRatchet>, EngineError> {
        let state: GroupState = ciborium::from_reader(state)
            .map_err(|e| EngineError::Deserialization(e.to_string()))?;
        Ok(Box::new(SimGroupRatchet { state }))
    }
}
