//! Login and registration.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::rotator::ttl_secs;
use super::{AccessMinter, IssuedSession, generate_secret, hash_secret};
use crate::config::SecurityConfig;
use crate::db::{self, Database, NewRefreshCredential, User};
use crate::device::DeviceContext;
use crate::jwt::JwtError;
use crate::password::{PasswordError, PasswordManager};

const MAX_USERNAME_LENGTH: usize = 32;
const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 128;
const MAX_FULL_NAME_LENGTH: usize = 100;

#[derive(Debug, Error)]
pub enum LoginFailure {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked for another {retry_after}s")]
    AccountLocked { retry_after: u64 },
    #[error("account disabled")]
    Disabled,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("token signing failed: {0}")]
    Signing(#[from] JwtError),
}

#[derive(Debug, Error)]
pub enum RegistrationFailure {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("username already taken")]
    UsernameTaken,
    #[error("password hashing failed: {0}")]
    Hashing(#[from] PasswordError),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Credential checks and session creation.
#[derive(Clone)]
pub struct SessionIssuer {
    db: Database,
    minter: AccessMinter,
    passwords: PasswordManager,
    refresh_ttl: Duration,
    max_devices: usize,
    max_login_attempts: u32,
    lock_duration: Duration,
}

impl SessionIssuer {
    pub fn new(
        db: Database,
        minter: AccessMinter,
        passwords: PasswordManager,
        config: &SecurityConfig,
    ) -> Self {
        Self {
            db,
            minter,
            passwords,
            refresh_ttl: config.refresh_token_ttl,
            max_devices: config.max_devices_per_user,
            max_login_attempts: config.max_login_attempts,
            lock_duration: config.lock_duration,
        }
    }

    /// Create a user. Returns the new user's UUID.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        full_name: &str,
    ) -> Result<String, RegistrationFailure> {
        let username = validate_username(username)?;
        validate_password(password)?;
        let full_name = validate_full_name(full_name)?;

        let users = self.db.users();
        if !users.is_username_available(username).await? {
            return Err(RegistrationFailure::UsernameTaken);
        }

        let password_hash = self.passwords.hash(password.to_string()).await?;
        let uuid = uuid::Uuid::new_v4().to_string();
        match users.create(&uuid, username, &password_hash, full_name).await {
            Ok(id) => {
                info!(user_id = id, username = %username, "User registered");
                Ok(uuid)
            }
            // Lost a race against a concurrent registration
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RegistrationFailure::UsernameTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check credentials and open a session on `device`.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        device: &DeviceContext,
    ) -> Result<IssuedSession, LoginFailure> {
        let users = self.db.users();

        let Some(mut user) = users.get_by_username(username.trim()).await? else {
            self.passwords.verify(password.to_string(), None).await;
            return Err(LoginFailure::InvalidCredentials);
        };

        let now = db::now();
        if user.account_locked {
            if let Some(retry_after) = user.lock_remaining(now) {
                warn!(
                    security_event = "locked_account_login",
                    user_id = user.id,
                    ip = %device.ip_address,
                    "Login attempt on locked account"
                );
                return Err(LoginFailure::AccountLocked { retry_after });
            }
            users.unlock(user.id).await?;
            info!(user_id = user.id, "Account lock expired");
        }

        let verified = self
            .passwords
            .verify(password.to_string(), Some(user.password_hash.clone()))
            .await;
        if !verified {
            let lock_until = now + ttl_secs(self.lock_duration);
            let state = users
                .record_failed_login(user.id, self.max_login_attempts, lock_until)
                .await?;
            if let Some(state) = state.filter(|s| s.locked) {
                warn!(
                    security_event = "account_locked",
                    user_id = user.id,
                    attempts = state.attempts,
                    ip = %device.ip_address,
                    "Account locked after repeated failures"
                );
            }
            return Err(LoginFailure::InvalidCredentials);
        }

        if !user.enabled {
            warn!(user_id = user.id, "Login attempt on disabled account");
            return Err(LoginFailure::Disabled);
        }

        users.record_login(user.id, now).await?;
        user.last_login_at = Some(now);
        user.failed_login_attempts = 0;
        user.account_locked = false;
        user.lock_expires_at = None;

        self.enforce_device_limit(&user, device, now).await?;

        let refresh_token = generate_secret();
        let family = uuid::Uuid::new_v4().to_string();
        self.db
            .refresh_tokens()
            .create(&NewRefreshCredential {
                token_hash: &hash_secret(&refresh_token),
                family: &family,
                user_id: user.id,
                device,
                issued_at: now,
                expires_at: now + ttl_secs(self.refresh_ttl),
                user_token_version: user.token_version,
            })
            .await?;

        let access = self.minter.mint(&user, device).await?;

        info!(
            user_id = user.id,
            device = %device.device_name,
            ip = %device.ip_address,
            "User logged in"
        );
        Ok(IssuedSession {
            user,
            access,
            refresh_token,
            refresh_expires_in: self.refresh_ttl.as_secs(),
            device: device.clone(),
        })
    }

    /// Revoke the least recently used other devices so that, with the device
    /// logging in now, the user stays within the device limit.
    async fn enforce_device_limit(
        &self,
        user: &User,
        device: &DeviceContext,
        now: i64,
    ) -> Result<(), sqlx::Error> {
        let store = self.db.refresh_tokens();
        let others: Vec<_> = store
            .active_devices(user.id, now)
            .await?
            .into_iter()
            .filter(|d| d.fingerprint != device.fingerprint)
            .collect();

        for stale in others.iter().skip(self.max_devices.saturating_sub(1)) {
            let revoked = store.revoke_device(user.id, &stale.fingerprint).await?;
            self.minter
                .ledger()
                .blacklist_device(user.id, &stale.fingerprint)
                .await;
            info!(
                user_id = user.id,
                device = %stale.device_name,
                revoked,
                "Device limit reached, evicted least recently used device"
            );
        }
        Ok(())
    }
}

fn validate_username(username: &str) -> Result<&str, RegistrationFailure> {
    let username = username.trim();
    if username.is_empty() {
        return Err(RegistrationFailure::InvalidInput("Username cannot be empty"));
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(RegistrationFailure::InvalidInput(
            "Username must be at most 32 characters",
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(RegistrationFailure::InvalidInput(
            "Username can only contain letters, numbers, and underscores",
        ));
    }
    Ok(username)
}

fn validate_password(password: &str) -> Result<(), RegistrationFailure> {
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(RegistrationFailure::InvalidInput(
            "Password must be at least 8 characters",
        ));
    }
    if length > MAX_PASSWORD_LENGTH {
        return Err(RegistrationFailure::InvalidInput(
            "Password must be at most 128 characters",
        ));
    }
    Ok(())
}

fn validate_full_name(full_name: &str) -> Result<&str, RegistrationFailure> {
    let full_name = full_name.trim();
    if full_name.is_empty() {
        return Err(RegistrationFailure::InvalidInput("Full name cannot be empty"));
    }
    if full_name.chars().count() > MAX_FULL_NAME_LENGTH {
        return Err(RegistrationFailure::InvalidInput(
            "Full name must be at most 100 characters",
        ));
    }
    Ok(full_name)
}
