//! Session issuance and refresh credential rotation.

mod issuer;
mod rotator;
mod secret;

#[cfg(test)]
pub(crate) mod testing;

use crate::db::User;
use crate::device::DeviceContext;
use crate::jwt::{IssuedAccessToken, JwtError, TokenCodec};
use crate::ledger::ReplayLedger;

pub use issuer::{LoginFailure, RegistrationFailure, SessionIssuer};
pub use rotator::{Rotated, RotationFailure, SessionRotator};
pub use secret::{generate_secret, hash_secret};

/// An access token plus refresh secret handed to a client.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub user: User,
    pub access: IssuedAccessToken,
    /// Plaintext refresh secret. Only its hash is stored.
    pub refresh_token: String,
    pub refresh_expires_in: u64,
    pub device: DeviceContext,
}

/// Mints access tokens and registers their ids in the replay ledger.
#[derive(Clone)]
pub struct AccessMinter {
    codec: TokenCodec,
    ledger: ReplayLedger,
}

impl AccessMinter {
    pub fn new(codec: TokenCodec, ledger: ReplayLedger) -> Self {
        Self { codec, ledger }
    }

    pub fn ledger(&self) -> &ReplayLedger {
        &self.ledger
    }

    /// Mint an access token for `user` bound to `device` and track its id.
    pub async fn mint(
        &self,
        user: &User,
        device: &DeviceContext,
    ) -> Result<IssuedAccessToken, JwtError> {
        let issued = self
            .codec
            .mint(&user.uuid, user.token_version, &device.fingerprint)?;
        self.ledger
            .register(
                &issued.jti,
                user.id,
                &device.fingerprint,
                &device.ip_address,
                self.codec.access_ttl(),
            )
            .await;
        Ok(issued)
    }
}
