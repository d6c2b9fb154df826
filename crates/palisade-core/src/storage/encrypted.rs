//! Sign-then-encrypt envelope over a [`BlobStore`].
//!
//! Every non-empty blob is signed with the owning identity's Ed25519 key,
//! then sealed with XChaCha20-Poly1305 under a per-category key derived from
//! that identity key. Reads reverse the transform: decrypt, then verify.
//!
//! Empty payloads bypass the envelope and are stored verbatim; callers must
//! not rely on confidentiality of zero-length writes.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha512;
use zeroize::Zeroizing;

use super::{BlobStore, StorageError};

const NONCE_LEN: usize = 24;
const SIGNATURE_LEN: usize = 64;

/// Envelope credentials for one storage category.
///
/// The cipher key is derived from the identity signing key with the category
/// name as HKDF info, so distinct categories never share a symmetric key.
#[derive(Clone)]
pub struct StoreCrypto {
    signing: SigningKey,
    cipher_key: Zeroizing<[u8; 32]>,
}

impl StoreCrypto {
    /// Derive credentials for `category` from the identity signing key.
    pub fn derive(signing: &SigningKey, category: &str) -> Self {
        let hkdf = Hkdf::<Sha512>::new(None, signing.as_bytes());
        let mut cipher_key = Zeroizing::new([0u8; 32]);
        // 32-byte output from SHA-512 HKDF cannot fail.
        let _ = hkdf.expand(category.as_bytes(), cipher_key.as_mut());
        Self { signing: signing.clone(), cipher_key }
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, StorageError> {
        XChaCha20Poly1305::new_from_slice(self.cipher_key.as_ref())
            .map_err(|e| StorageError::Crypto(e.to_string()))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let signature = self.signing.sign(plaintext);

        let mut signed = Vec::with_capacity(SIGNATURE_LEN + plaintext.len());
        signed.extend_from_slice(&signature.to_bytes());
        signed.extend_from_slice(plaintext);

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(XNonce::from_slice(&nonce), signed.as_slice())
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open(&self, name: &str, blob: &[u8]) -> Result<Vec<u8>, StorageError> {
        if blob.len() < NONCE_LEN {
            return Err(StorageError::Crypto(format!("blob {name} too short for envelope")));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let signed = self
            .cipher()?
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Verification { name: name.to_string() })?;

        if signed.len() < SIGNATURE_LEN {
            return Err(StorageError::Crypto(format!("blob {name} too short for signature")));
        }
        let (sig_bytes, plaintext) = signed.split_at(SIGNATURE_LEN);
        let signature = Signature::from_slice(sig_bytes)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        self.signing
            .verifying_key()
            .verify(plaintext, &signature)
            .map_err(|_| StorageError::Verification { name: name.to_string() })?;

        Ok(plaintext.to_vec())
    }
}

/// Blob store applying the sign-then-encrypt envelope on every access.
#[derive(Clone)]
pub struct EncryptedStore<B: BlobStore> {
    backend: B,
    crypto: StoreCrypto,
}

impl<B: BlobStore> EncryptedStore<B> {
    /// Wrap a backend with envelope credentials.
    pub fn new(backend: B, crypto: StoreCrypto) -> Self {
        Self { backend, crypto }
    }

    /// Write a blob through the envelope.
    ///
    /// Empty data is stored verbatim.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        if data.is_empty() {
            return self.backend.write(name, data);
        }
        let sealed = self.crypto.seal(data)?;
        self.backend.write(name, &sealed)
    }

    /// Read and open a blob. Returns `None` if it does not exist.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.backend.read(name)? {
            None => Ok(None),
            Some(blob) if blob.is_empty() => Ok(Some(blob)),
            Some(blob) => Ok(Some(self.crypto.open(name, &blob)?)),
        }
    }

    /// List stored blob names.
    pub fn list(&self) -> Result<Vec<String>, StorageError> {
        self.backend.list()
    }

    /// Whether a blob exists, without decrypting it.
    pub fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.backend.read(name)?.is_some())
    }

    /// Delete a blob. [`StorageError::NotFound`] if absent.
    pub fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.backend.delete(name)
    }

    /// Delete every blob.
    pub fn delete_all(&self) -> Result<(), StorageError> {
        self.backend.delete_all()
    }
}
