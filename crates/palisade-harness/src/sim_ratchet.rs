//! Deterministic pairwise ratchet simulation.
//!
//! Stands in for the real Double Ratchet engine in tests. The initiation
//! seed travels inside the prekey envelope in the clear, so both sides can
//! derive the same per-direction message chains without real key agreement.
//! Not secure; only the mutation contract matches the production engine.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use palisade_core::{
    EngineError, InitiationKeys, KeyId, KeyPair, PrekeyEnvelope, RatchetCrypto, RatchetEngine,
    RatchetMessage, ResponderKeys,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

const NONCE_LEN: usize = 24;

/// Derive the simulated public half of a private key.
pub fn public_from_private(private_key: &[u8]) -> Vec<u8> {
    Sha512::digest(private_key)[..32].to_vec()
}

fn derive_shared(seed: &[u8; 32], long_term_public: &[u8], one_time_public: Option<&[u8]>) -> [u8; 32] {
    let hkdf = Hkdf::<Sha512>::new(None, seed);
    let mut info = Vec::new();
    info.extend_from_slice(b"palisade-sim-pairwise");
    info.extend_from_slice(long_term_public);
    if let Some(one_time) = one_time_public {
        info.extend_from_slice(one_time);
    }
    let mut shared = [0u8; 32];
    let _ = hkdf.expand(&info, &mut shared);
    shared
}

fn message_key(shared: &[u8; 32], from_initiator: bool, counter: u64) -> [u8; 32] {
    let hkdf = Hkdf::<Sha512>::new(None, shared);
    let mut info = Vec::new();
    info.extend_from_slice(if from_initiator { b"i->r" } else { b"r->i" });
    info.extend_from_slice(&counter.to_be_bytes());
    let mut key = [0u8; 32];
    let _ = hkdf.expand(&info, &mut key);
    key
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), EngineError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|e| EngineError::Crypto(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| EngineError::Crypto(e.to_string()))?;
    Ok((nonce, ciphertext))
}

fn open(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, EngineError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|e| EngineError::Crypto(e.to_string()))?;
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| EngineError::Crypto("authentication failed".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Handshake {
    seed: [u8; 32],
    long_term_key_id: KeyId,
    one_time_key_id: Option<KeyId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Body {
    counter: u64,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrekeyBody {
    seed: [u8; 32],
    body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimState {
    shared: [u8; 32],
    role: Role,
    send_count: u64,
    recv_count: u64,
    handshake: Option<Handshake>,
}

/// Simulated pairwise engine.
pub struct SimRatchetEngine {
    state: SimState,
}

impl SimRatchetEngine {
    fn sends_as_initiator(&self) -> bool {
        self.state.role == Role::Initiator
    }

    fn open_body(&mut self, body: &Body) -> Result<Vec<u8>, EngineError> {
        if body.counter != self.state.recv_count {
            return Err(EngineError::Crypto(format!(
                "out-of-order message: expected {}, got {}",
                self.state.recv_count, body.counter
            )));
        }
        let key = message_key(&self.state.shared, !self.sends_as_initiator(), body.counter);
        let plaintext = open(&key, &body.nonce, &body.ciphertext)?;
        self.state.recv_count += 1;
        Ok(plaintext)
    }
}

impl RatchetEngine for SimRatchetEngine {
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, EngineError> {
        let key = message_key(&self.state.shared, self.sends_as_initiator(), self.state.send_count);
        let (nonce, ciphertext) = seal(&key, plaintext)?;
        let body = Body { counter: self.state.send_count, nonce, ciphertext };
        self.state.send_count += 1;

        match self.state.handshake.take() {
            Some(handshake) => {
                let prekey = PrekeyBody { seed: handshake.seed, body };
                let mut payload = Vec::new();
                ciborium::into_writer(&prekey, &mut payload)
                    .map_err(|e| EngineError::Crypto(e.to_string()))?;
                Ok(RatchetMessage::Prekey(PrekeyEnvelope {
                    long_term_key_id: handshake.long_term_key_id,
                    one_time_key_id: handshake.one_time_key_id,
                    payload,
                }))
            },
            None => {
                let mut payload = Vec::new();
                ciborium::into_writer(&body, &mut payload)
                    .map_err(|e| EngineError::Crypto(e.to_string()))?;
                Ok(RatchetMessage::Regular(payload))
            },
        }
    }

    fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, EngineError> {
        let body = match message {
            RatchetMessage::Prekey(envelope) => {
                let prekey: PrekeyBody = ciborium::from_reader(envelope.payload.as_slice())
                    .map_err(|e| EngineError::Crypto(e.to_string()))?;
                prekey.body
            },
            RatchetMessage::Regular(payload) => ciborium::from_reader(payload.as_slice())
                .map_err(|e| EngineError::Crypto(e.to_string()))?,
        };
        self.open_body(&body)
    }

    fn serialize(&self) -> Result<Vec<u8>, EngineError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&self.state, &mut bytes)
            .map_err(|e| EngineError::Crypto(e.to_string()))?;
        Ok(bytes)
    }
}

/// Factory for simulated pairwise engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimRatchetCrypto;

impl SimRatchetCrypto {
    /// Create the factory.
    pub fn new() -> Self {
        Self
    }
}

impl RatchetCrypto for SimRatchetCrypto {
    fn generate_key_pair(&self) -> Result<KeyPair, EngineError> {
        let mut private_key = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut private_key);
        let public_key = public_from_private(&private_key);
        Ok(KeyPair { public_key, private_key })
    }

    fn initiate(&self, peer: InitiationKeys<'_>) -> Result<Box<dyn RatchetEngine>, EngineError> {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);

        let shared = derive_shared(&seed, peer.long_term_public, peer.one_time_public);
        let handshake = Handshake {
            seed,
            long_term_key_id: KeyId::of(peer.long_term_public),
            one_time_key_id: peer.one_time_public.map(KeyId::of),
        };

        Ok(Box::new(SimRatchetEngine {
            state: SimState {
                shared,
                role: Role::Initiator,
                send_count: 0,
                recv_count: 0,
                handshake: Some(handshake),
            },
        }))
    }

    fn respond(
        &self,
        own: ResponderKeys<'_>,
        message: &PrekeyEnvelope,
    ) -> Result<Box<dyn RatchetEngine>, EngineError> {
        let prekey: PrekeyBody = ciborium::from_reader(message.payload.as_slice())
            .map_err(|e| EngineError::Crypto(e.to_string()))?;

        let long_term_public = public_from_private(own.long_term_private);
        let one_time_public = own.one_time_private.map(public_from_private);
        let shared =
            derive_shared(&prekey.seed, &long_term_public, one_time_public.as_deref());

        Ok(Box::new(SimRatchetEngine {
            state: SimState {
                shared,
                role: Role::Responder,
                send_count: 0,
                recv_count: 0,
                handshake: None,
            },
        }))
    }

    fn deserialize(&self, state: &[u8]) -> Result<Box<dyn RatchetEngine>, EngineError> {
        let state: SimState = ciborium::from_reader(state)
            .map_err(|e| EngineError::Deserialization(e.to_string()))?;
        Ok(Box::new(SimRatchetEngine { state }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn establish() -> (Box<dyn RatchetEngine>, Box<dyn RatchetEngine>, RatchetMessage) {
        let crypto = SimRatchetCrypto::new();
        let identity = crypto.generate_key_pair().unwrap();
        let long_term = crypto.generate_key_pair().unwrap();
        let one_time = crypto.generate_key_pair().unwrap();

        let mut initiator = crypto
            .initiate(InitiationKeys {
                identity_key: &identity.public_key,
                long_term_public: &long_term.public_key,
                one_time_public: Some(&one_time.public_key),
            })
            .unwrap();

        let first = initiator.encrypt(b"hello").unwrap();
        let RatchetMessage::Prekey(envelope) = &first else {
            unreachable!("initiation always produces a prekey message first");
        };
        let responder = crypto
            .respond(
                ResponderKeys {
                    long_term_private: &long_term.private_key,
                    one_time_private: Some(&one_time.private_key),
                },
                envelope,
            )
            .unwrap();
        (initiator, responder, first)
    }

    #[test]
    fn first_message_roundtrip() {
        let (_, mut responder, first) = establish();
        assert_eq!(responder.decrypt(&first).unwrap(), b"hello");
    }

    #[test]
    fn bidirectional_conversation() {
        let (mut initiator, mut responder, first) = establish();
        responder.decrypt(&first).unwrap();

        let reply = responder.encrypt(b"hi back").unwrap();
        assert_eq!(initiator.decrypt(&reply).unwrap(), b"hi back");

        let followup = initiator.encrypt(b"how are you").unwrap();
        assert!(matches!(followup, RatchetMessage::Regular(_)));
        assert_eq!(responder.decrypt(&followup).unwrap(), b"how are you");
    }

    #[test]
    fn out_of_order_within_direction_fails() {
        let (mut initiator, mut responder, first) = establish();
        responder.decrypt(&first).unwrap();

        let second = initiator.encrypt(b"two").unwrap();
        let third = initiator.encrypt(b"three").unwrap();

        assert!(responder.decrypt(&third).is_err());
        assert_eq!(responder.decrypt(&second).unwrap(), b"two");
    }

    #[test]
    fn serialize_roundtrip_preserves_chains() {
        let crypto = SimRatchetCrypto::new();
        let (mut initiator, mut responder, first) = establish();
        responder.decrypt(&first).unwrap();

        let snapshot = responder.serialize().unwrap();
        let mut restored = crypto.deserialize(&snapshot).unwrap();

        let msg = initiator.encrypt(b"after restore").unwrap();
        assert_eq!(restored.decrypt(&msg).unwrap(), b"after restore");
    }
}
