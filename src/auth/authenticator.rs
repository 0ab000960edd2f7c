//! Per-request authentication pipeline.

use std::net::IpAddr;

use axum::http::{HeaderMap, header};
use tracing::{debug, error, warn};

use super::cookie::{ACCESS_COOKIE_NAME, REFRESH_COOKIE_NAME, get_cookie};
use super::errors::AuthErrorKind;
use super::types::AuthenticatedUser;
use crate::db::{self, Database, User};
use crate::device::DeviceContext;
use crate::jwt::TokenCodec;
use crate::ledger::{JtiValidation, ReplayLedger};
use crate::session::{IssuedSession, RotationFailure, SessionRotator};

/// Outcome of a successful authentication.
#[derive(Debug)]
pub struct Authenticated {
    pub user: AuthenticatedUser,
    /// Set when the access token was missing or stale and a new session was
    /// minted from the refresh cookie.
    pub refreshed: Option<IssuedSession>,
}

/// The access token presented by a request. A bearer header beats the cookie.
pub fn presented_access_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| get_cookie(headers, ACCESS_COOKIE_NAME))
}

/// Decides whether a request carries a usable session.
#[derive(Clone)]
pub struct RequestAuthenticator {
    db: Database,
    codec: TokenCodec,
    ledger: ReplayLedger,
    rotator: SessionRotator,
    require_device_binding: bool,
}

impl RequestAuthenticator {
    pub fn new(
        db: Database,
        codec: TokenCodec,
        ledger: ReplayLedger,
        rotator: SessionRotator,
        require_device_binding: bool,
    ) -> Self {
        Self {
            db,
            codec,
            ledger,
            rotator,
            require_device_binding,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn ledger(&self) -> &ReplayLedger {
        &self.ledger
    }

    pub fn rotator(&self) -> &SessionRotator {
        &self.rotator
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
    ) -> Result<Authenticated, AuthErrorKind> {
        let device = DeviceContext::from_headers(headers, client_ip, None);

        let claims = presented_access_token(headers).and_then(|t| self.codec.verify(t).ok());
        let Some(claims) = claims else {
            return self.refresh_from_cookie(headers, &device).await;
        };

        match self.ledger.validate(&claims.jti, client_ip).await {
            JtiValidation::Valid => {}
            JtiValidation::Suspicious(reason) => {
                debug!(jti = %claims.jti, reason, "Accepting suspicious token");
            }
            JtiValidation::Invalid(reason) => {
                debug!(jti = %claims.jti, reason, "Rejected access token");
                return Err(AuthErrorKind::TokenRevoked);
            }
        }

        if self.require_device_binding && claims.dfp != device.fingerprint {
            warn!(
                security_event = "access_token_device_mismatch",
                user = %claims.sub,
                jti = %claims.jti,
                device = %device.device_name,
                ip = %device.ip_address,
                "Access token presented from another device"
            );
            self.ledger
                .blacklist(&claims.jti, TokenCodec::remaining_ttl(&claims))
                .await;
            return Err(AuthErrorKind::DeviceMismatch);
        }

        let user = self
            .db
            .users()
            .get_by_uuid(&claims.sub)
            .await
            .map_err(|e| {
                error!("Failed to get user: {}", e);
                AuthErrorKind::DatabaseError
            })?
            .ok_or(AuthErrorKind::UserNotFound)?;

        if claims.ver != user.token_version {
            debug!(user_id = user.id, "Access token from an older token version");
            return Err(AuthErrorKind::TokenRevoked);
        }
        check_account(&user)?;

        Ok(Authenticated {
            user: AuthenticatedUser { user, claims },
            refreshed: None,
        })
    }

    /// Rotate `refresh_token` for `device` and mint a new access token.
    /// The account must still be enabled and unlocked.
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
        device: &DeviceContext,
    ) -> Result<IssuedSession, AuthErrorKind> {
        let session = self
            .rotator
            .rotate_session(refresh_token, device)
            .await
            .map_err(|e| match e {
                RotationFailure::Storage(e) => {
                    error!("Failed to rotate refresh token: {}", e);
                    AuthErrorKind::DatabaseError
                }
                RotationFailure::Signing(e) => {
                    error!("Failed to sign access token: {}", e);
                    AuthErrorKind::DatabaseError
                }
                other => {
                    debug!(reason = %other, "Refresh rejected");
                    AuthErrorKind::InvalidToken
                }
            })?;
        check_account(&session.user)?;
        Ok(session)
    }

    async fn refresh_from_cookie(
        &self,
        headers: &HeaderMap,
        device: &DeviceContext,
    ) -> Result<Authenticated, AuthErrorKind> {
        let refresh_token =
            get_cookie(headers, REFRESH_COOKIE_NAME).ok_or(AuthErrorKind::NotAuthenticated)?;
        let session = self.refresh_session(refresh_token, device).await?;

        let claims = self
            .codec
            .verify(&session.access.token)
            .map_err(|_| AuthErrorKind::InvalidToken)?;

        Ok(Authenticated {
            user: AuthenticatedUser {
                user: session.user.clone(),
                claims,
            },
            refreshed: Some(session),
        })
    }
}

fn check_account(user: &User) -> Result<(), AuthErrorKind> {
    if !user.enabled {
        return Err(AuthErrorKind::AccountDisabled);
    }
    if user.lock_remaining(db::now()).is_some() {
        return Err(AuthErrorKind::AccountLocked);
    }
    Ok(())
}
