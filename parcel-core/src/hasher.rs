//! Salted password digests
//!
//! Passwords are stored as `hex(SHA-256(salt || password))`. The salt is a
//! process-wide constant supplied through configuration, so the same
//! password always produces the same digest and login can compare digests.

use sha2::{Digest, Sha256};

/// Salt used when the configuration does not provide one
pub const DEFAULT_SALT: &str = "parcel-track/credentials/v1";

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("digest has unexpected length {0}, expected {}", DIGEST_HEX_LEN)]
    Length(usize),

    #[error("digest is not valid hex")]
    Encoding,
}

/// Deterministic salted hasher
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    salt: String,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(DEFAULT_SALT)
    }
}

impl PasswordHasher {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Hash a password into a 64-character lowercase hex digest.
    pub fn hash(&self, password: &str) -> Result<String, HashError> {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(password.as_bytes());
        let digest = hex::encode(hasher.finalize());

        if digest.len() != DIGEST_HEX_LEN {
            return Err(HashError::Length(digest.len()));
        }
        if !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashError::Encoding);
        }
        Ok(digest)
    }

    /// Compare the digest of `password` with a stored digest.
    pub fn verify(&self, password: &str, stored: &str) -> Result<bool, HashError> {
        Ok(self.hash(password)? == stored)
    }
}
