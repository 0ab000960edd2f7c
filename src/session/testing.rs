//! Shared fixtures for session tests.

use std::sync::Arc;

use super::{AccessMinter, IssuedSession, SessionIssuer, SessionRotator};
use crate::config::SecurityConfig;
use crate::db::Database;
use crate::device::DeviceContext;
use crate::jwt::TokenCodec;
use crate::ledger::{InMemoryLedgerBackend, ReplayLedger};
use crate::password::PasswordManager;

pub const PASSWORD: &str = "correct horse battery";

pub struct Harness {
    pub db: Database,
    pub codec: TokenCodec,
    pub ledger: ReplayLedger,
    pub issuer: SessionIssuer,
    pub rotator: SessionRotator,
}

impl Harness {
    pub const UA: &'static str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

    pub async fn new() -> Self {
        Self::with_config(SecurityConfig::default()).await
    }

    pub async fn with_config(config: SecurityConfig) -> Self {
        let db = Database::open(":memory:").await.unwrap();
        let codec = TokenCodec::new(b"test-secret-key-for-testing", config.access_token_ttl);
        let ledger = ReplayLedger::new(Arc::new(InMemoryLedgerBackend::new()), &config);
        let minter = AccessMinter::new(codec.clone(), ledger.clone());
        // Cheap Argon2 parameters keep the suite fast
        let passwords = PasswordManager::new(1024, 1, 1).unwrap();
        let issuer = SessionIssuer::new(db.clone(), minter.clone(), passwords, &config);
        let rotator = SessionRotator::new(db.clone(), minter, config.refresh_token_ttl);

        Self {
            db,
            codec,
            ledger,
            issuer,
            rotator,
        }
    }

    /// Register `username` with [`PASSWORD`] unless it already exists.
    pub async fn register(&self, username: &str) {
        if self.db.users().is_username_available(username).await.unwrap() {
            self.issuer
                .register(username, PASSWORD, "Test User")
                .await
                .unwrap();
        }
    }

    pub async fn login(&self, username: &str) -> IssuedSession {
        self.login_on(username, &device_at("10.0.0.1")).await
    }

    pub async fn login_on(&self, username: &str, device: &DeviceContext) -> IssuedSession {
        self.register(username).await;
        self.issuer.login(username, PASSWORD, device).await.unwrap()
    }
}

/// The default test browser at `ip`.
pub fn device_at(ip: &str) -> DeviceContext {
    DeviceContext::new(Some(Harness::UA), ip.parse().unwrap(), None)
}
