//! Single-use refresh credential rotation.
//!
//! A credential moves from active to exactly one of consumed, revoked or
//! expired. Presenting a consumed credential again means two parties hold the
//! same secret, so every credential of the user is invalidated.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{AccessMinter, IssuedSession, generate_secret, hash_secret};
use crate::db::{self, Database, NewRefreshCredential, RefreshCredential, User};
use crate::device::DeviceContext;
use crate::jwt::JwtError;

/// Why a refresh credential could not be exchanged.
///
/// Callers must not reveal the variant to clients.
#[derive(Debug, Error)]
pub enum RotationFailure {
    #[error("refresh token not found")]
    NotFound,
    #[error("refresh token reuse detected")]
    ReuseDetected,
    #[error("refresh token invalid: {0}")]
    Invalid(&'static str),
    #[error("refresh token presented from a different device")]
    DeviceMismatch,
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("token signing failed: {0}")]
    Signing(#[from] JwtError),
}

/// Result of a successful rotation.
#[derive(Debug, Clone)]
pub struct Rotated {
    pub refresh_token: String,
    pub user: User,
    pub family: String,
}

#[derive(Clone)]
pub struct SessionRotator {
    db: Database,
    minter: AccessMinter,
    refresh_ttl: Duration,
}

impl SessionRotator {
    pub fn new(db: Database, minter: AccessMinter, refresh_ttl: Duration) -> Self {
        Self {
            db,
            minter,
            refresh_ttl,
        }
    }

    /// Exchange a refresh secret for a successor in the same family.
    pub async fn rotate(
        &self,
        refresh_token: &str,
        device: &DeviceContext,
    ) -> Result<Rotated, RotationFailure> {
        let store = self.db.refresh_tokens();
        let token_hash = hash_secret(refresh_token);

        let Some(credential) = store.get_by_hash(&token_hash).await? else {
            debug!("Refresh token not found");
            return Err(RotationFailure::NotFound);
        };
        let Some(user) = self.db.users().get_by_id(credential.user_id).await? else {
            return Err(RotationFailure::Invalid("unknown user"));
        };

        if credential.consumed {
            self.reuse_detected(&user, &credential, device).await?;
            return Err(RotationFailure::ReuseDetected);
        }

        let now = db::now();
        credential
            .check_usable(now, user.token_version)
            .map_err(RotationFailure::Invalid)?;

        let same_device = device.matches_stored(
            &credential.user_agent_hash,
            &credential.ip_prefix,
            credential.device_id.as_deref(),
        ) && device.fingerprint == credential.device_fingerprint;
        if !same_device {
            let revoked = store.revoke_all_for_user(user.id).await?;
            warn!(
                security_event = "refresh_device_mismatch",
                user_id = user.id,
                family = %credential.family,
                stored_device = %credential.device_name,
                stored_ip = %credential.ip_address,
                current_device = %device.device_name,
                current_ip = %device.ip_address,
                revoked,
                "Refresh token presented from a different device"
            );
            return Err(RotationFailure::DeviceMismatch);
        }

        if !store.mark_consumed(credential.id, now).await? {
            return match store.get_by_id(credential.id).await? {
                Some(current) if current.consumed => {
                    self.reuse_detected(&user, &current, device).await?;
                    Err(RotationFailure::ReuseDetected)
                }
                _ => Err(RotationFailure::Invalid("revoked")),
            };
        }

        let refresh_token = generate_secret();
        store
            .create(&NewRefreshCredential {
                token_hash: &hash_secret(&refresh_token),
                family: &credential.family,
                user_id: user.id,
                device,
                issued_at: now,
                expires_at: now + ttl_secs(self.refresh_ttl),
                user_token_version: credential.user_token_version,
            })
            .await?;

        debug!(user_id = user.id, family = %credential.family, "Rotated refresh token");
        Ok(Rotated {
            refresh_token,
            user,
            family: credential.family,
        })
    }

    /// Rotate, then mint and register a new access token.
    pub async fn rotate_session(
        &self,
        refresh_token: &str,
        device: &DeviceContext,
    ) -> Result<IssuedSession, RotationFailure> {
        let rotated = self.rotate(refresh_token, device).await?;
        let access = self.minter.mint(&rotated.user, device).await?;
        Ok(IssuedSession {
            user: rotated.user,
            access,
            refresh_token: rotated.refresh_token,
            refresh_expires_in: self.refresh_ttl.as_secs(),
            device: device.clone(),
        })
    }

    async fn reuse_detected(
        &self,
        user: &User,
        credential: &RefreshCredential,
        device: &DeviceContext,
    ) -> Result<(), sqlx::Error> {
        error!(
            security_event = "refresh_token_reuse",
            user_id = user.id,
            family = %credential.family,
            device = %device.device_name,
            ip = %device.ip_address,
            "Consumed refresh token presented again, invalidating all sessions"
        );
        self.invalidate_user(user.id).await?;
        Ok(())
    }

    /// Revoke a single refresh credential. Returns false if it was unknown or
    /// already revoked.
    pub async fn revoke(&self, refresh_token: &str) -> Result<bool, sqlx::Error> {
        self.db
            .refresh_tokens()
            .revoke_by_hash(&hash_secret(refresh_token))
            .await
    }

    /// Revoke every refresh credential of a user.
    pub async fn revoke_all(&self, user_id: i64) -> Result<u64, sqlx::Error> {
        self.db.refresh_tokens().revoke_all_for_user(user_id).await
    }

    /// Revoke a user's credentials on one device and blacklist its tracked
    /// access tokens.
    pub async fn revoke_device(&self, user_id: i64, fingerprint: &str) -> Result<u64, sqlx::Error> {
        let revoked = self
            .db
            .refresh_tokens()
            .revoke_device(user_id, fingerprint)
            .await?;
        let blacklisted = self.minter.ledger().blacklist_device(user_id, fingerprint).await;
        info!(user_id, revoked, blacklisted, "Revoked device");
        Ok(revoked)
    }

    /// Invalidate everything a user holds: bump the token version, revoke all
    /// refresh credentials and blacklist all tracked access tokens.
    ///
    /// Returns the new token version, or `None` if the user does not exist.
    pub async fn invalidate_user(&self, user_id: i64) -> Result<Option<i64>, sqlx::Error> {
        let version = self.db.users().bump_token_version(user_id).await?;
        let revoked = self.revoke_all(user_id).await?;
        let blacklisted = self.minter.ledger().blacklist_all_for_user(user_id).await;
        info!(user_id, ?version, revoked, blacklisted, "Invalidated all sessions");
        Ok(version)
    }

    /// Delete refresh credentials whose expiry has passed.
    pub async fn sweep_expired(&self) -> Result<u64, sqlx::Error> {
        self.db.refresh_tokens().delete_expired(db::now()).await
    }
}

pub(super) fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{Harness, device_at};

    #[tokio::test]
    async fn test_rotate_issues_successor_in_family() {
        let h = Harness::new().await;
        let login = h.login("alice").await;
        let device = login.device.clone();

        let rotated = h.rotator.rotate(&login.refresh_token, &device).await.unwrap();
        assert_ne!(rotated.refresh_token, login.refresh_token);
        assert_eq!(rotated.user.id, login.user.id);

        let store = h.db.refresh_tokens();
        let old = store
            .get_by_hash(&hash_secret(&login.refresh_token))
            .await
            .unwrap()
            .unwrap();
        let new = store
            .get_by_hash(&hash_secret(&rotated.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert!(old.consumed);
        assert!(!new.consumed && !new.revoked);
        assert_eq!(old.family, new.family);
        assert_eq!(rotated.family, new.family);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let h = Harness::new().await;
        let result = h.rotator.rotate("not-a-real-token", &device_at("10.0.0.1")).await;
        assert!(matches!(result, Err(RotationFailure::NotFound)));
    }

    #[tokio::test]
    async fn test_reuse_invalidates_everything() {
        let h = Harness::new().await;
        let login = h.login("alice").await;
        let other = h.login("alice").await;
        let device = login.device.clone();

        let rotated = h.rotator.rotate(&login.refresh_token, &device).await.unwrap();
        let replay = h.rotator.rotate(&login.refresh_token, &device).await;
        assert!(matches!(replay, Err(RotationFailure::ReuseDetected)));

        let user = h.db.users().get_by_id(login.user.id).await.unwrap().unwrap();
        assert_eq!(user.token_version, login.user.token_version + 1);

        let creds = h.db.refresh_tokens().list_by_user(user.id).await.unwrap();
        assert!(creds.iter().all(|c| c.revoked));

        // Successor and the unrelated session both died with it
        for token in [&rotated.refresh_token, &other.refresh_token] {
            assert!(h.rotator.rotate(token, &device).await.is_err());
        }

        // Tracked access tokens are blacklisted
        let ip = "10.0.0.1".parse().unwrap();
        assert!(!h.ledger.validate(&login.access.jti, ip).await.is_valid());
        assert!(!h.ledger.validate(&other.access.jti, ip).await.is_valid());
    }

    #[tokio::test]
    async fn test_concurrent_rotations_single_winner() {
        let h = Harness::new().await;
        let login = h.login("alice").await;
        let device = login.device.clone();

        let attempts = (0..8).map(|_| h.rotator.rotate(&login.refresh_token, &device));
        let results = futures::future::join_all(attempts).await;

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        // Losers either hit the consumed flag or read the user after another
        // loser already bumped the version
        let errors: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert!(
            errors
                .iter()
                .all(|e| matches!(e, RotationFailure::ReuseDetected | RotationFailure::Invalid(_)))
        );
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, RotationFailure::ReuseDetected))
        );

        let creds = h.db.refresh_tokens().list_by_user(login.user.id).await.unwrap();
        assert!(creds.iter().all(|c| c.revoked));
    }

    #[tokio::test]
    async fn test_user_agent_change_revokes_all() {
        let h = Harness::new().await;
        let login = h.login("alice").await;
        let other = h.login("alice").await;

        let stolen_on = DeviceContext::new(Some("curl/8.0"), "10.0.0.1".parse().unwrap(), None);
        let result = h.rotator.rotate(&login.refresh_token, &stolen_on).await;
        assert!(matches!(result, Err(RotationFailure::DeviceMismatch)));

        let creds = h.db.refresh_tokens().list_by_user(login.user.id).await.unwrap();
        assert!(creds.iter().all(|c| c.revoked));
        assert!(!creds.iter().any(|c| c.consumed));

        let result = h.rotator.rotate(&other.refresh_token, &other.device).await;
        assert!(matches!(result, Err(RotationFailure::Invalid("revoked"))));
    }

    #[tokio::test]
    async fn test_network_change_is_mismatch() {
        let h = Harness::new().await;
        let login = h.login("alice").await;

        let result = h.rotator.rotate(&login.refresh_token, &device_at("192.168.7.1")).await;
        assert!(matches!(result, Err(RotationFailure::DeviceMismatch)));
    }

    #[tokio::test]
    async fn test_same_subnet_rotates() {
        let h = Harness::new().await;
        let login = h.login("alice").await;

        assert!(h.rotator.rotate(&login.refresh_token, &device_at("10.0.0.200")).await.is_ok());
    }

    #[tokio::test]
    async fn test_stored_device_id_must_match() {
        let h = Harness::new().await;
        let with_id = DeviceContext::new(Some(Harness::UA), "10.0.0.1".parse().unwrap(), Some("phone-1"));
        let login = h.login_on("alice", &with_id).await;

        let without_id = device_at("10.0.0.1");
        let result = h.rotator.rotate(&login.refresh_token, &without_id).await;
        assert!(matches!(result, Err(RotationFailure::DeviceMismatch)));
    }

    #[tokio::test]
    async fn test_new_device_id_on_refresh_is_mismatch() {
        let h = Harness::new().await;
        let login = h.login("alice").await;
        assert!(login.device.device_id.is_none());

        let with_id = DeviceContext::new(Some(Harness::UA), "10.0.0.1".parse().unwrap(), Some("new-dev"));
        let result = h.rotator.rotate(&login.refresh_token, &with_id).await;
        assert!(matches!(result, Err(RotationFailure::DeviceMismatch)));

        let creds = h.db.refresh_tokens().list_by_user(login.user.id).await.unwrap();
        assert!(creds.iter().all(|c| c.revoked && !c.consumed));
    }

    #[tokio::test]
    async fn test_expired_and_stale_version() {
        let h = Harness::new().await;
        let login = h.login("alice").await;
        sqlx::query("UPDATE refresh_tokens SET expires_at = 1")
            .execute(h.db.pool())
            .await
            .unwrap();
        let result = h.rotator.rotate(&login.refresh_token, &login.device).await;
        assert!(matches!(result, Err(RotationFailure::Invalid("expired"))));

        let login = h.login("bob").await;
        sqlx::query("UPDATE users SET token_version = token_version + 1 WHERE id = ?")
            .bind(login.user.id)
            .execute(h.db.pool())
            .await
            .unwrap();
        let result = h.rotator.rotate(&login.refresh_token, &login.device).await;
        assert!(matches!(result, Err(RotationFailure::Invalid("stale token version"))));
    }

    #[tokio::test]
    async fn test_revoke_and_sweep() {
        let h = Harness::new().await;
        let login = h.login("alice").await;

        assert!(h.rotator.revoke(&login.refresh_token).await.unwrap());
        assert!(!h.rotator.revoke(&login.refresh_token).await.unwrap());
        let result = h.rotator.rotate(&login.refresh_token, &login.device).await;
        assert!(matches!(result, Err(RotationFailure::Invalid("revoked"))));

        sqlx::query("UPDATE refresh_tokens SET expires_at = 1")
            .execute(h.db.pool())
            .await
            .unwrap();
        assert_eq!(h.rotator.sweep_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_revoke_device() {
        let h = Harness::new().await;
        let laptop = h.login("alice").await;
        let phone_ctx = DeviceContext::new(
            Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) Safari/604.1"),
            "10.0.0.1".parse().unwrap(),
            None,
        );
        let phone = h.login_on("alice", &phone_ctx).await;

        let revoked = h
            .rotator
            .revoke_device(phone.user.id, &phone_ctx.fingerprint)
            .await
            .unwrap();
        assert_eq!(revoked, 1);

        let ip = "10.0.0.1".parse().unwrap();
        assert!(!h.ledger.validate(&phone.access.jti, ip).await.is_valid());
        assert!(h.ledger.validate(&laptop.access.jti, ip).await.is_valid());
        assert!(h.rotator.rotate(&laptop.refresh_token, &laptop.device).await.is_ok());
    }

    #[tokio::test]
    async fn test_rotate_session_mints_access_token() {
        let h = Harness::new().await;
        let login = h.login("alice").await;

        let session = h
            .rotator
            .rotate_session(&login.refresh_token, &login.device)
            .await
            .unwrap();
        assert_ne!(session.access.jti, login.access.jti);
        assert_eq!(session.refresh_expires_in, 7 * 24 * 60 * 60);

        let device_window = h
            .ledger
            .device_jtis(login.user.id, &login.device.fingerprint)
            .await;
        assert_eq!(device_window, vec![login.access.jti.clone(), session.access.jti.clone()]);
    }
}
