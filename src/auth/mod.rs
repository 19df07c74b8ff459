//! Credential verification module
//!
//! Accounts store a credential record of `{hash, salt, iterations}`. Hashes are
//! Argon2id PHC strings, which carry their own cost parameters, so verification needs
//! nothing but the record. Hashing is CPU-bound and runs on the blocking pool.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;

/// Stored password credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRecord {
    /// PHC-format Argon2 hash
    pub hash: String,
    /// Salt embedded in `hash`, kept alongside for inspection
    pub salt: String,
    /// Argon2 time cost used to produce `hash`
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

fn default_iterations() -> u32 {
    3
}

/// Verifies plaintext passwords against stored records
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// `Ok(false)` on mismatch; `Err` only when the record itself is unusable
    async fn verify(&self, plaintext: &str, record: &PasswordRecord) -> Result<bool, AuthError>;
}

/// Argon2id credential service
#[derive(Debug, Clone)]
pub struct Argon2Credentials {
    memory_kib: u32,
}

impl Default for Argon2Credentials {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
        }
    }
}

impl Argon2Credentials {
    /// Use `memory_kib` KiB of memory when hashing new passwords
    pub fn new(memory_kib: u32) -> Self {
        Self { memory_kib }
    }

    /// Hash a password into a new record with a random salt
    pub fn hash(&self, plaintext: &str, iterations: u32) -> Result<PasswordRecord, AuthError> {
        let params = Params::new(self.memory_kib, iterations, Params::DEFAULT_P_COST, None)
            .map_err(|e| AuthError::Hashing(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::generate(&mut OsRng);

        let hash = argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| AuthError::Hashing(e.to_string()))?
            .to_string();

        Ok(PasswordRecord {
            hash,
            salt: salt.as_str().to_string(),
            iterations,
        })
    }

    fn verify_blocking(plaintext: &str, record: &PasswordRecord) -> Result<bool, AuthError> {
        if record.hash.is_empty() {
            return Err(AuthError::MalformedRecord("missing hash".to_string()));
        }

        let parsed = PasswordHash::new(&record.hash)
            .map_err(|e| AuthError::MalformedRecord(e.to_string()))?;

        let embedded_salt = parsed.salt.map(|s| s.as_str().to_string());
        if embedded_salt.as_deref() != Some(record.salt.as_str()) {
            return Err(AuthError::MalformedRecord(
                "salt does not match hash".to_string(),
            ));
        }

        Ok(Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok())
    }
}

#[async_trait]
impl CredentialService for Argon2Credentials {
    async fn verify(&self, plaintext: &str, record: &PasswordRecord) -> Result<bool, AuthError> {
        let plaintext = plaintext.to_string();
        let record = record.clone();

        let matched = tokio::task::spawn_blocking(move || Self::verify_blocking(&plaintext, &record))
            .await
            .map_err(|e| AuthError::Hashing(e.to_string()))??;

        debug!(matched = matched, "Password verification finished");
        Ok(matched)
    }
}
