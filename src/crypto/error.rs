//! Error handling for the [`super::CryptoKit`].
use displaydoc::Display;
use thiserror::Error;

/// Errors raised by cryptographic operations.
#[derive(Debug, Display, Error)]
pub enum CryptoError {
    /// Security keys have not been generated or loaded yet.
    NotInitialized,
    /// Failed to generate key material: {0}.
    KeyGeneration(String),
    /// Failed to read key material from disk: {0}.
    KeyIo(String),
    /// Failed to sign data: {0}.
    Signing(String),
    /// Ciphertext is malformed or too short to contain a nonce.
    MalformedCiphertext,
    /// Failed to decrypt data: authentication tag mismatch or corrupt ciphertext.
    DecryptionFailed,
    /// Bearer token is malformed: {0}.
    MalformedToken(String),
    /// Bearer token has expired.
    TokenExpired,
    /// Bearer token signature does not verify.
    TokenTampered,
}
