//! Password hashing with Argon2id.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

const SALT_LENGTH: usize = 16;
const DUMMY_PASSWORD: &str = "sessionguard-dummy-password";

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("argon2 error: {0}")]
    Argon2(String),
    #[error("hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Hashes and verifies passwords. Hashing runs on the blocking pool.
#[derive(Clone)]
pub struct PasswordManager {
    params: Params,
    /// Hash checked against when the user does not exist, so unknown and known
    /// usernames cost the same.
    dummy_hash: String,
}

impl PasswordManager {
    /// Create a manager with explicit Argon2 cost parameters.
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, PasswordError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| PasswordError::Argon2(e.to_string()))?;
        let dummy_hash = hash_with(&params, DUMMY_PASSWORD)?;
        Ok(Self { params, dummy_hash })
    }

    /// Create a manager with the Argon2 default cost.
    pub fn with_default_params() -> Result<Self, PasswordError> {
        Self::new(
            Params::DEFAULT_M_COST,
            Params::DEFAULT_T_COST,
            Params::DEFAULT_P_COST,
        )
    }

    /// Hash a password into a PHC string.
    pub async fn hash(&self, password: String) -> Result<String, PasswordError> {
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || hash_with(&params, &password)).await?
    }

    /// Verify a password. With `hash = None` a dummy hash is checked and the
    /// result is always false.
    pub async fn verify(&self, password: String, hash: Option<String>) -> bool {
        let known = hash.is_some();
        let hash = hash.unwrap_or_else(|| self.dummy_hash.clone());
        let result = tokio::task::spawn_blocking(move || verify_with(&password, &hash)).await;
        match result {
            Ok(ok) => ok && known,
            Err(e) => {
                tracing::error!(error = %e, "Password verification task failed");
                false
            }
        }
    }
}

fn hash_with(params: &Params, password: &str) -> Result<String, PasswordError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone());
    let salt_bytes: [u8; SALT_LENGTH] = rand::random();
    let salt =
        SaltString::encode_b64(&salt_bytes).map_err(|e| PasswordError::Argon2(e.to_string()))?;
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::Argon2(e.to_string()))?;
    Ok(hash.to_string())
}

fn verify_with(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "Stored password hash is malformed");
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
