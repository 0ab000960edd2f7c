//! Replay ledger for access token ids (JTIs).
//!
//! Tracks which token ids were issued, from which address they were last
//! used, and which ones are blacklisted. Every entry expires on its own; the
//! ledger only speeds up revocation and never replaces the user's token
//! version or the refresh credential table.
//!
//! Key layout:
//! - `jti:{id}` last seen client IP
//! - `user:jtis:{user_id}` sorted set of ids by issue time (ms)
//! - `device:jtis:{user_id}:{fingerprint}` sorted set trimmed to the newest N ids
//! - `jti:blacklist:{id}` present while revoked

mod memory;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SecurityConfig;
use crate::device::ip_prefix;

pub use memory::InMemoryLedgerBackend;

/// Errors surfaced by a ledger backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger backend unavailable: {0}")]
    Unavailable(String),
    #[error("ledger backend timed out")]
    Timeout,
}

/// Key/value and sorted-set operations the ledger needs from its store.
///
/// Shaped after Redis so a networked store can be dropped in.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LedgerError>;
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError>;
    async fn exists(&self, key: &str) -> Result<bool, LedgerError>;
    async fn delete(&self, key: &str) -> Result<bool, LedgerError>;
    /// Add or re-score a member and reset the key's expiry.
    async fn zadd(&self, key: &str, member: &str, score: i64, ttl: Duration)
    -> Result<(), LedgerError>;
    /// Members in ascending score order.
    async fn zrange(&self, key: &str) -> Result<Vec<String>, LedgerError>;
    /// Remove members scored below `min_score`.
    async fn zrem_below(&self, key: &str, min_score: i64) -> Result<usize, LedgerError>;
    /// Keep only the `keep` highest-scored members, returning the removed ones.
    async fn ztrim_newest(&self, key: &str, keep: usize) -> Result<Vec<String>, LedgerError>;
    async fn purge_expired(&self) -> Result<usize, LedgerError>;
}

/// Outcome of checking a token id against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JtiValidation {
    Valid,
    /// Accepted but worth flagging.
    Suspicious(&'static str),
    Invalid(&'static str),
}

impl JtiValidation {
    pub fn is_valid(&self) -> bool {
        !matches!(self, JtiValidation::Invalid(_))
    }
}

/// Token id tracking on top of a [`LedgerBackend`].
#[derive(Clone)]
pub struct ReplayLedger {
    backend: Arc<dyn LedgerBackend>,
    enabled: bool,
    reject_suspicious: bool,
    fail_closed: bool,
    timeout: Duration,
    access_ttl: Duration,
    skew: Duration,
    max_jtis_per_device: usize,
}

impl ReplayLedger {
    pub fn new(backend: Arc<dyn LedgerBackend>, config: &SecurityConfig) -> Self {
        Self {
            backend,
            enabled: config.tracking_enabled,
            reject_suspicious: config.reject_suspicious,
            fail_closed: config.fail_closed,
            timeout: config.ledger_timeout,
            access_ttl: config.access_token_ttl,
            skew: config.clock_skew,
            max_jtis_per_device: config.max_jtis_per_device,
        }
    }

    async fn call<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| LedgerError::Timeout)?
    }

    /// Record a newly issued token id. Failures are logged, never returned.
    pub async fn register(
        &self,
        jti: &str,
        user_id: i64,
        fingerprint: &str,
        client_ip: &str,
        ttl: Duration,
    ) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self
            .try_register(jti, user_id, fingerprint, client_ip, ttl + self.skew)
            .await
        {
            error!(jti = %jti, user_id, error = %e, "Failed to register JTI");
        }
    }

    async fn try_register(
        &self,
        jti: &str,
        user_id: i64,
        fingerprint: &str,
        client_ip: &str,
        ttl: Duration,
    ) -> Result<(), LedgerError> {
        let now = now_millis();
        let window = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        self.call(self.backend.set(&jti_key(jti), client_ip, ttl))
            .await?;

        let user_key = user_key(user_id);
        self.call(self.backend.zadd(&user_key, jti, now, ttl)).await?;
        self.call(self.backend.zrem_below(&user_key, now.saturating_sub(window)))
            .await?;

        let device_key = device_key(user_id, fingerprint);
        self.call(self.backend.zadd(&device_key, jti, now, ttl))
            .await?;
        let evicted = self
            .call(self.backend.ztrim_newest(&device_key, self.max_jtis_per_device))
            .await?;

        debug!(
            jti = %jti,
            user_id,
            evicted = evicted.len(),
            "Registered JTI"
        );
        Ok(())
    }

    /// Check a token id presented from `client_ip`.
    ///
    /// Unknown ids are valid: the signature and the user's token version
    /// already vouch for them, and the ledger may have lost its entries.
    pub async fn validate(&self, jti: &str, client_ip: IpAddr) -> JtiValidation {
        if !self.enabled {
            return JtiValidation::Valid;
        }
        match self.try_validate(jti, client_ip).await {
            Ok(result) => result,
            Err(e) if self.fail_closed => {
                error!(jti = %jti, error = %e, "Ledger unavailable, rejecting token");
                JtiValidation::Invalid("security backend unavailable")
            }
            Err(e) => {
                error!(jti = %jti, error = %e, "Ledger unavailable, accepting token");
                JtiValidation::Valid
            }
        }
    }

    async fn try_validate(
        &self,
        jti: &str,
        client_ip: IpAddr,
    ) -> Result<JtiValidation, LedgerError> {
        if self.call(self.backend.exists(&blacklist_key(jti))).await? {
            warn!(security_event = "blacklisted_jti", jti = %jti, "Blacklisted JTI used");
            return Ok(JtiValidation::Invalid("revoked"));
        }

        let Some(stored_ip) = self.call(self.backend.get(&jti_key(jti))).await? else {
            debug!(jti = %jti, "JTI not tracked");
            return Ok(JtiValidation::Valid);
        };

        let same_network = stored_ip
            .parse::<IpAddr>()
            .map(|stored| ip_prefix(stored) == ip_prefix(client_ip))
            .unwrap_or(false);
        if same_network {
            return Ok(JtiValidation::Valid);
        }

        warn!(
            security_event = "jti_ip_changed",
            jti = %jti,
            original_ip = %stored_ip,
            current_ip = %client_ip,
            "JTI used from a different network"
        );
        if self.reject_suspicious {
            self.blacklist(jti, self.access_ttl).await;
            return Ok(JtiValidation::Invalid("suspicious token usage"));
        }
        Ok(JtiValidation::Suspicious("ip changed"))
    }

    /// Revoke a token id for the rest of its lifetime.
    pub async fn blacklist(&self, jti: &str, remaining: Duration) {
        if !self.enabled {
            return;
        }
        let ttl = (remaining + self.skew).max(self.skew);
        match self
            .call(self.backend.set(&blacklist_key(jti), "1", ttl))
            .await
        {
            Ok(()) => info!(jti = %jti, "Blacklisted JTI"),
            Err(e) => error!(jti = %jti, error = %e, "Failed to blacklist JTI"),
        }
    }

    /// Blacklist every tracked token id of a user. Returns how many were hit.
    pub async fn blacklist_all_for_user(&self, user_id: i64) -> usize {
        if !self.enabled {
            return 0;
        }
        self.blacklist_set(&user_key(user_id)).await
    }

    /// Blacklist every token id in a user's window for one device.
    pub async fn blacklist_device(&self, user_id: i64, fingerprint: &str) -> usize {
        if !self.enabled {
            return 0;
        }
        self.blacklist_set(&device_key(user_id, fingerprint)).await
    }

    async fn blacklist_set(&self, key: &str) -> usize {
        let jtis = match self.call(self.backend.zrange(key)).await {
            Ok(jtis) => jtis,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to read tracked JTIs");
                return 0;
            }
        };
        for jti in &jtis {
            self.blacklist(jti, self.access_ttl).await;
        }
        if let Err(e) = self.call(self.backend.delete(key)).await {
            error!(key = %key, error = %e, "Failed to clear tracked JTIs");
        }
        if !jtis.is_empty() {
            info!(key = %key, count = jtis.len(), "Blacklisted tracked JTIs");
        }
        jtis.len()
    }

    /// Token ids currently in a user's window for one device, oldest first.
    pub async fn device_jtis(&self, user_id: i64, fingerprint: &str) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        self.call(self.backend.zrange(&device_key(user_id, fingerprint)))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to read device JTIs");
                Vec::new()
            })
    }

    /// Drop expired entries from the backend.
    pub async fn purge_expired(&self) -> Result<usize, LedgerError> {
        self.call(self.backend.purge_expired()).await
    }
}

fn jti_key(jti: &str) -> String {
    format!("jti:{}", jti)
}

fn blacklist_key(jti: &str) -> String {
    format!("jti:blacklist:{}", jti)
}

fn user_key(user_id: i64) -> String {
    format!("user:jtis:{}", user_id)
}

fn device_key(user_id: i64, fingerprint: &str) -> String {
    format!("device:jtis:{}:{}", user_id, fingerprint)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
