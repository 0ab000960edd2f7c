//! Access token signing and verification.
//!
//! Access tokens are HS256 JWTs. They are never stored; whether one is still
//! usable is decided at request time from the replay ledger and the user's
//! token version.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JWT claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user UUID)
    pub sub: String,
    /// JWT ID, unique per issuance
    pub jti: String,
    /// Token version of the user at issuance
    pub ver: i64,
    /// Device fingerprint the token is bound to
    pub dfp: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// A freshly minted access token.
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub jti: String,
    pub issued_at: u64,
    pub expires_at: u64,
    /// Token duration in seconds
    pub duration: u64,
}

/// Errors that can occur while signing a token.
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("failed to encode token: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
    #[error("system time error")]
    TimeError,
}

/// Any reason a token failed verification. Callers never learn which one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid token")]
pub struct TokenInvalid;

/// Signs and verifies access tokens. Holds no mutable state.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
}

impl TokenCodec {
    /// Create a codec for the given secret and access token lifetime.
    pub fn new(secret: &[u8], access_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Sign the given claims.
    pub fn issue(&self, claims: &AccessClaims) -> Result<String, JwtError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding_key,
        )?)
    }

    /// Build claims for a user on a device and sign them with a fresh JTI.
    pub fn mint(
        &self,
        user_uuid: &str,
        token_version: i64,
        fingerprint: &str,
    ) -> Result<IssuedAccessToken, JwtError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| JwtError::TimeError)?
            .as_secs();
        let duration = self.access_ttl.as_secs();

        let claims = AccessClaims {
            sub: user_uuid.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            ver: token_version,
            dfp: fingerprint.to_string(),
            iat: now,
            exp: now + duration,
        };
        let token = self.issue(&claims)?;

        Ok(IssuedAccessToken {
            token,
            jti: claims.jti,
            issued_at: now,
            expires_at: claims.exp,
            duration,
        })
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenInvalid> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        self.decode(token, &validation)
    }

    /// Verify the signature but accept an expired token.
    ///
    /// Used on logout, where the token id of an expired token still has to be
    /// blacklisted.
    pub fn verify_ignoring_expiry(&self, token: &str) -> Result<AccessClaims, TokenInvalid> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        self.decode(token, &validation)
    }

    fn decode(&self, token: &str, validation: &Validation) -> Result<AccessClaims, TokenInvalid> {
        jsonwebtoken::decode::<AccessClaims>(token, &self.decoding_key, validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                TokenInvalid
            })
    }

    /// Time left before the token expires, zero if already expired.
    pub fn remaining_ttl(claims: &AccessClaims) -> Duration {
        Duration::from_secs(claims.exp.saturating_sub(unix_now()))
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
