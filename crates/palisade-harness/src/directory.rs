//! In-memory key directory.
//!
//! Mimics the remote service closely enough for integration tests: one-time
//! keys are consumed at most once, `validate_public_keys` reports stale local
//! views, and the first upload must carry the identity card id. Tokens are
//! the caller's identity string, matching [`StaticTokenProvider`].

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use palisade_core::{
    AccessTokenProvider, Card, DirectoryError, Identity, IdentityPublicKeySet, KeyDirectory, KeyId,
    PublicKeySet, RawPublicKey, SignedPublicKey, ValidationReport,
};

#[derive(Debug, Clone)]
struct Entry {
    card: Card,
    registered_card_id: Option<String>,
    long_term: Option<(KeyId, SignedPublicKey)>,
    one_time: BTreeMap<KeyId, RawPublicKey>,
    consumed: BTreeSet<KeyId>,
}

/// Shared in-memory directory; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyDirectory {
    entries: Arc<Mutex<HashMap<Identity, Entry>>>,
}

impl MemoryKeyDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an identity known to the directory without any key material,
    /// the way the PKI service would after card issuance.
    pub fn register_card(&self, card: &Card) {
        self.entries.lock().expect("directory mutex poisoned").insert(
            card.identity.clone(),
            Entry {
                card: card.clone(),
                registered_card_id: None,
                long_term: None,
                one_time: BTreeMap::new(),
                consumed: BTreeSet::new(),
            },
        );
    }

    /// Number of unconsumed one-time keys the directory holds for an identity.
    pub fn one_time_pool_size(&self, identity: &Identity) -> usize {
        self.entries
            .lock()
            .expect("directory mutex poisoned")
            .get(identity)
            .map_or(0, |entry| entry.one_time.len())
    }

    /// Id of the long-term key currently on record, if any.
    pub fn current_long_term_id(&self, identity: &Identity) -> Option<KeyId> {
        self.entries
            .lock()
            .expect("directory mutex poisoned")
            .get(identity)
            .and_then(|entry| entry.long_term.as_ref().map(|(id, _)| *id))
    }

    /// Whether the identity has completed its first upload.
    pub fn has_keys_entity(&self, identity: &Identity) -> bool {
        self.entries
            .lock()
            .expect("directory mutex poisoned")
            .get(identity)
            .is_some_and(|entry| entry.registered_card_id.is_some())
    }

    /// Drop one unconsumed one-time key server-side without telling the
    /// owner, simulating consumption by a third party.
    pub fn consume_one_time_key(&self, identity: &Identity) -> Option<KeyId> {
        let mut entries = self.entries.lock().expect("directory mutex poisoned");
        let entry = entries.get_mut(identity)?;
        let (id, _) = entry.one_time.pop_first()?;
        entry.consumed.insert(id);
        Some(id)
    }

    fn caller(token: &str) -> Identity {
        Identity::new(token)
    }
}

fn unknown(identity: &Identity) -> DirectoryError {
    DirectoryError::Remote { status: 404, message: format!("unknown identity {identity}") }
}

impl KeyDirectory for MemoryKeyDirectory {
    fn upload_public_keys(
        &self,
        identity_card_id: Option<&str>,
        long_term_key: Option<&SignedPublicKey>,
        one_time_keys: &[RawPublicKey],
        token: &str,
    ) -> Result<(), DirectoryError> {
        let caller = Self::caller(token);
        let mut entries = self.entries.lock().expect("directory mutex poisoned");
        let entry = entries.get_mut(&caller).ok_or_else(|| unknown(&caller))?;

        match identity_card_id {
            Some(card_id) => entry.registered_card_id = Some(card_id.to_string()),
            None if entry.registered_card_id.is_none() => {
                return Err(DirectoryError::Remote {
                    status: 400,
                    message: format!("keys entity for {caller} not initialized"),
                });
            },
            None => {},
        }

        if let Some(signed) = long_term_key {
            entry.long_term = Some((KeyId::of(&signed.key.bytes), signed.clone()));
        }
        for key in one_time_keys {
            entry.one_time.insert(KeyId::of(&key.bytes), key.clone());
        }
        Ok(())
    }

    fn validate_public_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
        token: &str,
    ) -> Result<ValidationReport, DirectoryError> {
        let caller = Self::caller(token);
        let entries = self.entries.lock().expect("directory mutex poisoned");
        let entry = entries.get(&caller).ok_or_else(|| unknown(&caller))?;

        let current = entry.long_term.as_ref().map(|(id, _)| *id);
        let used_long_term_key_id = long_term_key_id.filter(|id| current != Some(*id));
        let used_one_time_key_ids = one_time_key_ids
            .iter()
            .filter(|id| !entry.one_time.contains_key(id))
            .copied()
            .collect();
        Ok(ValidationReport { used_long_term_key_id, used_one_time_key_ids })
    }

    fn get_public_key_set(
        &self,
        identity: &Identity,
        _token: &str,
    ) -> Result<PublicKeySet, DirectoryError> {
        let mut entries = self.entries.lock().expect("directory mutex poisoned");
        let entry = entries.get_mut(identity).ok_or_else(|| unknown(identity))?;
        let Some((_, long_term_key)) = entry.long_term.clone() else {
            return Err(DirectoryError::Remote {
                status: 404,
                message: format!("no long-term key on record for {identity}"),
            });
        };
        let one_time_key = entry.one_time.pop_first().map(|(id, key)| {
            entry.consumed.insert(id);
            key
        });
        Ok(PublicKeySet {
            identity_key: entry.card.public_key.clone(),
            long_term_key,
            one_time_key,
        })
    }

    fn get_multiple_public_key_sets(
        &self,
        identities: &[Identity],
        token: &str,
    ) -> Result<Vec<IdentityPublicKeySet>, DirectoryError> {
        identities
            .iter()
            .map(|identity| {
                Ok(IdentityPublicKeySet {
                    identity: identity.clone(),
                    keys: self.get_public_key_set(identity, token)?,
                })
            })
            .collect()
    }

    fn delete_keys_entity(&self, token: &str) -> Result<(), DirectoryError> {
        let caller = Self::caller(token);
        let mut entries = self.entries.lock().expect("directory mutex poisoned");
        let entry = entries.get_mut(&caller).ok_or_else(|| unknown(&caller))?;
        entry.registered_card_id = None;
        entry.long_term = None;
        entry.one_time.clear();
        entry.consumed.clear();
        Ok(())
    }
}

/// Token provider returning a fixed token for every operation.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Token provider whose token is the given identity's string form,
    /// matching the [`MemoryKeyDirectory`] caller convention.
    pub fn for_identity(identity: &Identity) -> Self {
        Self { token: identity.as_str().to_string() }
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn get_token(&self, operation: &str) -> Result<String, DirectoryError> {
        tracing::debug!(operation, "issuing access token");
        Ok(self.token.clone())
    }
}
