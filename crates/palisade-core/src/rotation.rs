//! Pre-key rotation and cloud/local reconciliation.
//!
//! [`KeysRotator::rotate_keys`] is the single entry point. It runs under the
//! one-time-key interaction scope for its whole duration and is mutually
//! exclusive per rotator instance: the operation interleaves local mutation
//! with a remote read-modify-write and is retryable, not transactional.
//! Partial local mutations (keys already marked) are never rolled back; a
//! repeated call converges to the same state.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use ed25519_dalek::{Signer, SigningKey};
use thiserror::Error;

use crate::{
    clock::Clock,
    directory::{DirectoryError, KeyDirectory, SignedPublicKey},
    engine::{EngineError, RatchetCrypto},
    identity::{KeyAlgorithm, KeyId, RawPublicKey},
    keys::{KeyStoreError, LongTermKeyRecord, LongTermKeyStore, OneTimeKeyStore},
    storage::BlobStore,
};

/// Rotation policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationConfig {
    /// How long an orphaned one-time key is kept before deletion.
    pub orphaned_one_time_key_ttl: Duration,
    /// Active lifetime of a long-term key before it is marked outdated.
    pub long_term_key_ttl: Duration,
    /// How long an outdated long-term key is kept before deletion.
    pub outdated_long_term_key_ttl: Duration,
    /// Target one-time key pool size on the directory.
    pub desired_one_time_keys: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            orphaned_one_time_key_ttl: Duration::from_secs(24 * 60 * 60),
            long_term_key_ttl: Duration::from_secs(5 * 24 * 60 * 60),
            outdated_long_term_key_ttl: Duration::from_secs(24 * 60 * 60),
            desired_one_time_keys: 100,
        }
    }
}

/// Immutable report of one rotation pass. Observability only, never
/// persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationLog {
    /// One-time keys usable after this pass (survivors plus generated).
    pub one_time_keys_relevant: usize,
    /// One-time keys generated and uploaded by this pass.
    pub one_time_keys_added: usize,
    /// Orphaned one-time keys whose TTL expired and were deleted.
    pub one_time_keys_deleted: usize,
    /// One-time keys newly marked orphaned from the server report.
    pub one_time_keys_marked_orphaned: usize,
    /// One-time keys orphaned after this pass (old marks plus new ones).
    pub one_time_keys_orphaned: usize,
    /// Long-term keys still current after this pass.
    pub long_term_keys_relevant: usize,
    /// Long-term keys generated and uploaded by this pass (0 or 1).
    pub long_term_keys_added: usize,
    /// Outdated long-term keys whose TTL expired and were deleted.
    pub long_term_keys_deleted: usize,
    /// Long-term keys newly marked outdated by this pass.
    pub long_term_keys_marked_outdated: usize,
    /// Long-term keys outdated after this pass (old marks plus new ones).
    pub long_term_keys_outdated: usize,
}

/// Errors aborting a rotation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// Local key store failure.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Remote directory failure.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Key pair generation failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Reconciles local pre-key stores against the remote key directory.
pub struct KeysRotator<B: BlobStore> {
    identity_card_id: String,
    signing: SigningKey,
    long_term: Arc<LongTermKeyStore<B>>,
    one_time: Arc<OneTimeKeyStore<B>>,
    crypto: Arc<dyn RatchetCrypto>,
    directory: Arc<dyn KeyDirectory>,
    clock: Arc<dyn Clock>,
    config: RotationConfig,
    // Rotation interleaves local mutation with a remote read-modify-write;
    // overlapping passes for one identity would double-generate keys.
    exclusive: Mutex<()>,
}

impl<B: BlobStore> KeysRotator<B> {
    /// Create a rotator for one identity.
    #[allow(clippy::too_many_arguments, reason = "constructed once, by the orchestrator")]
    pub fn new(
        identity_card_id: String,
        signing: SigningKey,
        long_term: Arc<LongTermKeyStore<B>>,
        one_time: Arc<OneTimeKeyStore<B>>,
        crypto: Arc<dyn RatchetCrypto>,
        directory: Arc<dyn KeyDirectory>,
        clock: Arc<dyn Clock>,
        config: RotationConfig,
    ) -> Self {
        Self {
            identity_card_id,
            signing,
            long_term,
            one_time,
            crypto,
            directory,
            clock,
            config,
            exclusive: Mutex::new(()),
        }
    }

    /// Run one rotation pass against the directory.
    ///
    /// Only one pass runs at a time per rotator; concurrent callers block.
    /// Any storage or network error aborts the remaining steps and
    /// propagates; already-committed local marks stay in place.
    pub fn rotate_keys(&self, token: &str) -> Result<RotationLog, RotationError> {
        let _exclusive = self.exclusive.lock().expect("rotation mutex poisoned");

        let scope = self.one_time.begin_interaction()?;
        let result = self.rotate_locked(token);
        match result {
            Ok(log) => {
                scope.close()?;
                tracing::info!(
                    one_time_relevant = log.one_time_keys_relevant,
                    one_time_added = log.one_time_keys_added,
                    long_term_relevant = log.long_term_keys_relevant,
                    long_term_added = log.long_term_keys_added,
                    "key rotation completed"
                );
                Ok(log)
            },
            Err(err) => {
                // Still flush whatever local mutations happened; retry is
                // the recovery strategy.
                scope.close()?;
                Err(err)
            },
        }
    }

    fn rotate_locked(&self, token: &str) -> Result<RotationLog, RotationError> {
        let now = self.clock.now();
        let mut log = RotationLog::default();

        // Step 1: partition the one-time set.
        let one_time_records = self.one_time.retrieve_all()?;
        let mut active_one_time_ids = Vec::new();
        for record in &one_time_records {
            match record.orphaned_from {
                Some(marked_at) if expired(now, marked_at, self.config.orphaned_one_time_key_ttl) => {
                    self.one_time.delete(record.id)?;
                    log.one_time_keys_deleted += 1;
                },
                Some(_) => log.one_time_keys_orphaned += 1,
                None => active_one_time_ids.push(record.id),
            }
        }

        // Step 2: age the long-term keys, remembering the newest relevant
        // one as current.
        let long_term_records = self.long_term.retrieve_all()?;
        let mut current = None;
        for record in &long_term_records {
            if let Some(marked_at) = record.outdated_from {
                if expired(now, marked_at, self.config.outdated_long_term_key_ttl) {
                    self.long_term.delete(record.id)?;
                    log.long_term_keys_deleted += 1;
                } else {
                    log.long_term_keys_outdated += 1;
                }
            } else if expired(now, record.created_at, self.config.long_term_key_ttl) {
                self.long_term.mark_outdated(now, record.id)?;
                log.long_term_keys_marked_outdated += 1;
                log.long_term_keys_outdated += 1;
            } else {
                log.long_term_keys_relevant += 1;
                current = match current {
                    Some(best) if keep_newer(&best, record) => Some(best),
                    _ => Some(record.clone()),
                };
            }
        }

        let first_upload = long_term_records.is_empty() && one_time_records.is_empty();

        // Step 3: ask the server which of our keys it considers used.
        let report = self.directory.validate_public_keys(
            current.as_ref().map(|record| record.id),
            &active_one_time_ids,
            token,
        )?;

        // Step 4: mark server-consumed one-time keys orphaned locally.
        for id in &report.used_one_time_key_ids {
            self.one_time.mark_orphaned(now, *id)?;
            log.one_time_keys_marked_orphaned += 1;
            log.one_time_keys_orphaned += 1;
        }

        // Step 5: rotate the long-term key if the current one is gone,
        // flagged used, or aged out since step 2.
        let rotate_long_term = match &current {
            None => true,
            Some(record) => {
                report.used_long_term_key_id == Some(record.id)
                    || expired(now, record.created_at, self.config.long_term_key_ttl)
            },
        };
        let staged_long_term = if rotate_long_term {
            let pair = self.crypto.generate_key_pair()?;
            let id = KeyId::of(&pair.public_key);
            self.long_term.store_key(&pair.private_key, id, now)?;
            let signature = self.signing.sign(&pair.public_key).to_bytes().to_vec();
            log.long_term_keys_added = 1;
            log.long_term_keys_relevant += 1;
            Some(SignedPublicKey {
                key: RawPublicKey { algorithm: KeyAlgorithm::Curve25519, bytes: pair.public_key },
                signature,
            })
        } else {
            None
        };

        // Step 6: replenish the one-time pool to the desired size.
        let relevant_one_time =
            active_one_time_ids.len().saturating_sub(report.used_one_time_key_ids.len());
        let to_generate = self.config.desired_one_time_keys.saturating_sub(relevant_one_time);
        let mut new_one_time_publics = Vec::with_capacity(to_generate);
        for _ in 0..to_generate {
            let pair = self.crypto.generate_key_pair()?;
            let id = KeyId::of(&pair.public_key);
            self.one_time.store_key(&pair.private_key, id)?;
            new_one_time_publics.push(RawPublicKey {
                algorithm: KeyAlgorithm::Curve25519,
                bytes: pair.public_key,
            });
        }
        log.one_time_keys_added = to_generate;
        log.one_time_keys_relevant = relevant_one_time + to_generate;

        // Step 7: single upload call.
        self.directory.upload_public_keys(
            first_upload.then_some(self.identity_card_id.as_str()),
            staged_long_term.as_ref(),
            &new_one_time_publics,
            token,
        )?;

        Ok(log)
    }
}

fn expired(now: SystemTime, since: SystemTime, ttl: Duration) -> bool {
    now.duration_since(since).unwrap_or(Duration::ZERO) > ttl
}

fn keep_newer(best: &LongTermKeyRecord, candidate: &LongTermKeyRecord) -> bool {
    best.created_at >= candidate.created_at
}
