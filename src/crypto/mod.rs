//! `CryptoKit`: symmetric encryption, RSA signing/verification, bearer
//! token issuance, and content-hashing for the coordinator.
//!
//! All key material is generated once at startup (or loaded if already
//! present) and held read-only for the life of the process; see
//! [`keys::Keys`].
pub mod error;
pub mod keys;

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::{
    pss::{Signature, SigningKey, VerifyingKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{error::CryptoError, keys::Keys};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Claims embedded in a bearer token: subject, role, issue time and expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub subject: String,
    pub role: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl TokenClaims {
    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// The cryptographic toolkit used across the coordinator.
///
/// Holds no mutable state beyond the key material loaded at construction;
/// safe to share behind an `Arc` across the worker pool.
pub struct CryptoKit {
    keys: Option<Keys>,
}

impl CryptoKit {
    /// Builds a `CryptoKit` with no key material loaded. All operations
    /// fail with [`CryptoError::NotInitialized`] until [`Self::generate_keys`]
    /// is called.
    pub fn uninitialized() -> Self {
        Self { keys: None }
    }

    /// Idempotently generates (or loads) the four keys under `keys_dir`.
    pub fn generate_keys(keys_dir: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let keys = Keys::generate_or_load(keys_dir)?;
        Ok(Self { keys: Some(keys) })
    }

    fn keys(&self) -> Result<&Keys, CryptoError> {
        self.keys.as_ref().ok_or(CryptoError::NotInitialized)
    }

    /// Issues an HMAC-signed bearer token carrying `(subject, role, expiry)`.
    pub fn issue_token(
        &self,
        subject: &str,
        role: &str,
        ttl_seconds: u64,
    ) -> Result<String, CryptoError> {
        let keys = self.keys()?;
        let now = now_unix();
        let claims = TokenClaims {
            subject: subject.to_string(),
            role: role.to_string(),
            issued_at: now,
            expires_at: now + ttl_seconds,
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.jwt_secret)
            .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
        mac.update(payload_b64.as_bytes());
        let tag = mac.finalize().into_bytes();
        let tag_b64 = URL_SAFE_NO_PAD.encode(tag);

        Ok(format!("{payload_b64}.{tag_b64}"))
    }

    /// Verifies a bearer token, rejecting tampered or expired tokens.
    pub fn verify_token(&self, token: &str) -> Result<TokenClaims, CryptoError> {
        let keys = self.keys()?;
        let (payload_b64, tag_b64) = token
            .split_once('.')
            .ok_or_else(|| CryptoError::MalformedToken("missing signature segment".into()))?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&keys.jwt_secret)
            .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
        mac.update(payload_b64.as_bytes());
        let expected_tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| CryptoError::TokenTampered)?;
        mac.verify_slice(&expected_tag)
            .map_err(|_| CryptoError::TokenTampered)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&payload)
            .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;

        if claims.is_expired(now_unix()) {
            return Err(CryptoError::TokenExpired);
        }
        Ok(claims)
    }

    /// Encrypts `bytes` with AES-256-GCM under a random nonce. The returned
    /// ciphertext is self-contained: `nonce || ciphertext || tag`.
    pub fn encrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        self.encrypt_with_nonce(bytes, nonce_bytes)
    }

    /// Encrypts `bytes` with AES-256-GCM under a nonce derived from the
    /// plaintext's own content hash, rather than a random one: identical
    /// plaintext always yields identical ciphertext (and therefore the same
    /// content-addressed ref), so blobs encrypted this way keep the
    /// dedup/content-addressing property `put_blob` relies on. See
    /// DESIGN.md for the tradeoff this convergent-encryption scheme makes.
    pub fn encrypt_deterministic(&self, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(bytes);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&digest[..NONCE_LEN]);
        self.encrypt_with_nonce(bytes, nonce_bytes)
    }

    fn encrypt_with_nonce(&self, bytes: &[u8], nonce_bytes: [u8; NONCE_LEN]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys()?;
        let cipher = Aes256Gcm::new_from_slice(&keys.data_key)
            .map_err(|e| CryptoError::KeyIo(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, bytes)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a ciphertext produced by [`Self::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys()?;
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::MalformedCiphertext);
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&keys.data_key)
            .map_err(|e| CryptoError::KeyIo(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Signs `bytes` with RSA-PSS over SHA-256 using the server's private key.
    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys()?;
        let signing_key = SigningKey::<Sha256>::new(keys.rsa_private.clone());
        let signature = signing_key.sign_with_rng(&mut rand::rngs::OsRng, bytes);
        Ok(signature.to_vec())
    }

    /// Verifies an RSA-PSS/SHA-256 signature against the server's own
    /// public key.
    pub fn verify(&self, bytes: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let keys = self.keys()?;
        Self::verify_with_key(&keys.rsa_public, bytes, signature)
    }

    /// Verifies a signature against an arbitrary public key, used to check
    /// client-signed uploads when clients register their own keypair.
    pub fn verify_with_key(
        public_key: &rsa::RsaPublicKey,
        bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
        let signature = Signature::try_from(signature)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(verifying_key.verify(bytes, &signature).is_ok())
    }

    /// The server's RSA public key, exposed so clients can be told which
    /// key to trust when `verify` is used against uploads.
    pub fn public_key(&self) -> Result<rsa::RsaPublicKey, CryptoError> {
        Ok(self.keys()?.rsa_public.clone())
    }

    /// SHA-256 content hash, hex-encoded; used for content addressing.
    pub fn hash(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}
