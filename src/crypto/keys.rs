//! Key material management: generation, loading and on-disk permissions.
//!
//! Mirrors the original security manager's `keys/` directory layout: an RSA
//! keypair for signing, an HMAC secret for bearer tokens, a symmetric data
//! key for authenticated encryption, and an auxiliary salt. Generation is
//! idempotent — existing files are never overwritten.
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use rand::{rngs::OsRng, RngCore};
use rsa::{
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use tracing::info;

use crate::crypto::error::CryptoError;

const JWT_SECRET_LEN: usize = 32;
const DATA_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const RSA_KEY_BITS: usize = 2048;

/// Paths to the five files that make up a [`super::CryptoKit`]'s key material.
#[derive(Debug, Clone)]
pub struct KeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub jwt_secret: PathBuf,
    pub encryption_key: PathBuf,
    pub salt: PathBuf,
}

impl KeyPaths {
    /// Lays out the standard `keys/` directory under `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            private_key: root.join("private_key.pem"),
            public_key: root.join("public_key.pem"),
            jwt_secret: root.join("jwt_secret.key"),
            encryption_key: root.join("encryption.key"),
            salt: root.join("salt"),
        }
    }

    fn all_exist(&self) -> bool {
        self.private_key.exists()
            && self.public_key.exists()
            && self.jwt_secret.exists()
            && self.encryption_key.exists()
            && self.salt.exists()
    }
}

/// Loaded key material, held read-only for the lifetime of the process.
pub struct Keys {
    pub rsa_private: RsaPrivateKey,
    pub rsa_public: RsaPublicKey,
    pub jwt_secret: Vec<u8>,
    pub data_key: [u8; DATA_KEY_LEN],
    #[allow(dead_code)]
    pub salt: Vec<u8>,
}

impl Keys {
    /// Idempotently ensures all key material exists under `dir`, then loads it.
    ///
    /// Never overwrites a file that is already present; only the missing
    /// pieces are (re-)generated.
    pub fn generate_or_load(dir: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| CryptoError::KeyIo(e.to_string()))?;
        set_dir_permissions(dir).map_err(|e| CryptoError::KeyIo(e.to_string()))?;

        let paths = KeyPaths::under(dir);
        if !paths.all_exist() {
            generate_missing(&paths)?;
        }
        Self::load(&paths)
    }

    /// Loads key material that is already known to exist on disk.
    pub fn load(paths: &KeyPaths) -> Result<Self, CryptoError> {
        let private_pem =
            fs::read_to_string(&paths.private_key).map_err(|e| CryptoError::KeyIo(e.to_string()))?;
        let rsa_private = RsaPrivateKey::from_pkcs8_pem(&private_pem)
            .map_err(|e| CryptoError::KeyIo(e.to_string()))?;

        let public_pem =
            fs::read_to_string(&paths.public_key).map_err(|e| CryptoError::KeyIo(e.to_string()))?;
        let rsa_public = RsaPublicKey::from_public_key_pem(&public_pem)
            .map_err(|e| CryptoError::KeyIo(e.to_string()))?;

        let jwt_secret =
            fs::read(&paths.jwt_secret).map_err(|e| CryptoError::KeyIo(e.to_string()))?;

        let data_key_bytes =
            fs::read(&paths.encryption_key).map_err(|e| CryptoError::KeyIo(e.to_string()))?;
        if data_key_bytes.len() != DATA_KEY_LEN {
            return Err(CryptoError::KeyIo(format!(
                "encryption key has unexpected length {}",
                data_key_bytes.len()
            )));
        }
        let mut data_key = [0u8; DATA_KEY_LEN];
        data_key.copy_from_slice(&data_key_bytes);

        let salt = fs::read(&paths.salt).map_err(|e| CryptoError::KeyIo(e.to_string()))?;

        Ok(Self {
            rsa_private,
            rsa_public,
            jwt_secret,
            data_key,
            salt,
        })
    }
}

fn generate_missing(paths: &KeyPaths) -> Result<(), CryptoError> {
    if !paths.private_key.exists() || !paths.public_key.exists() {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        write_secret(&paths.private_key, private_pem.as_bytes())?;

        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        write_secret(&paths.public_key, public_pem.as_bytes())?;
        info!("generated RSA keypair for CryptoKit");
    }

    if !paths.jwt_secret.exists() {
        write_secret(&paths.jwt_secret, &random_bytes(JWT_SECRET_LEN))?;
        info!("generated JWT signing secret");
    }

    if !paths.encryption_key.exists() {
        write_secret(&paths.encryption_key, &random_bytes(DATA_KEY_LEN))?;
        info!("generated symmetric data key");
    }

    if !paths.salt.exists() {
        write_secret(&paths.salt, &random_bytes(SALT_LEN))?;
        info!("generated salt");
    }

    Ok(())
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(unix)]
fn write_secret(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, data).map_err(|e| CryptoError::KeyIo(e.to_string()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| CryptoError::KeyIo(e.to_string()))
}

#[cfg(not(unix))]
fn write_secret(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    fs::write(path, data).map_err(|e| CryptoError::KeyIo(e.to_string()))
}

#[cfg(unix)]
fn set_dir_permissions(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_dir_permissions(_dir: &Path) -> io::Result<()> {
    Ok(())
}
