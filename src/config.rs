//! Security settings shared by the session subsystem.
//!
//! Everything that changes how strictly credentials are checked lives here and is
//! validated once at startup, so the core never has to second-guess its inputs.

use std::time::Duration;

use thiserror::Error;

/// Longest lifetime accepted for tokens, lockouts and clock skew.
pub const MAX_LIFETIME: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Errors reported by [`SecurityConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("access token lifetime must be at least one second")]
    ZeroAccessLifetime,
    #[error("refresh token lifetime ({refresh}s) must exceed the access token lifetime ({access}s)")]
    RefreshNotLongerThanAccess { access: u64, refresh: u64 },
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
    #[error("ledger timeout must be greater than zero")]
    ZeroLedgerTimeout,
    #[error("{0} must not exceed {max}s", max = MAX_LIFETIME.as_secs())]
    LifetimeTooLong(&'static str),
}

/// Per-endpoint request budgets (requests per minute).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub login_per_minute: u32,
    pub refresh_per_minute: u32,
    pub logout_per_minute: u32,
    pub me_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            login_per_minute: 5,
            refresh_per_minute: 10,
            logout_per_minute: 5,
            me_per_minute: 60,
        }
    }
}

/// Settings for token lifetimes, device limits, lockout and replay tracking.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Lifetime of an access token.
    pub access_token_ttl: Duration,
    /// Lifetime of a refresh credential.
    pub refresh_token_ttl: Duration,
    /// Added to ledger TTLs so entries outlive the tokens they describe.
    pub clock_skew: Duration,
    /// Distinct devices allowed per user before the least recently used one is evicted.
    pub max_devices_per_user: usize,
    /// Token ids kept in each device's sliding window.
    pub max_jtis_per_device: usize,
    /// Failed password attempts before the account locks.
    pub max_login_attempts: u32,
    pub lock_duration: Duration,
    /// When false every ledger operation is a no-op and validation returns valid.
    pub tracking_enabled: bool,
    /// Treat an IP prefix change on a known token id as a hard failure.
    pub reject_suspicious: bool,
    /// Reject requests when the ledger backend is unreachable.
    pub fail_closed: bool,
    /// Upper bound for a single ledger backend call.
    pub ledger_timeout: Duration,
    /// Compare the access token's fingerprint claim against the request.
    pub require_device_binding: bool,
    /// Append `Secure` to every cookie.
    pub secure_cookies: bool,
    pub rate_limits: RateLimitSettings,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::from_secs(3 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            clock_skew: Duration::from_secs(60),
            max_devices_per_user: 5,
            max_jtis_per_device: 2,
            max_login_attempts: 5,
            lock_duration: Duration::from_secs(15 * 60),
            tracking_enabled: true,
            reject_suspicious: false,
            fail_closed: false,
            ledger_timeout: Duration::from_millis(250),
            require_device_binding: true,
            secure_cookies: true,
            rate_limits: RateLimitSettings::default(),
        }
    }
}

impl SecurityConfig {
    /// Check that the settings are internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let access = self.access_token_ttl.as_secs();
        let refresh = self.refresh_token_ttl.as_secs();

        if access == 0 {
            return Err(ConfigError::ZeroAccessLifetime);
        }
        for (name, value) in [
            ("access token lifetime", self.access_token_ttl),
            ("refresh token lifetime", self.refresh_token_ttl),
            ("clock skew", self.clock_skew),
            ("lock duration", self.lock_duration),
            ("ledger timeout", self.ledger_timeout),
        ] {
            if value > MAX_LIFETIME {
                return Err(ConfigError::LifetimeTooLong(name));
            }
        }
        if refresh <= access {
            return Err(ConfigError::RefreshNotLongerThanAccess { access, refresh });
        }
        if self.max_devices_per_user == 0 {
            return Err(ConfigError::ZeroLimit("max devices per user"));
        }
        if self.max_jtis_per_device == 0 {
            return Err(ConfigError::ZeroLimit("max token ids per device"));
        }
        if self.max_login_attempts == 0 {
            return Err(ConfigError::ZeroLimit("max login attempts"));
        }
        if self.ledger_timeout.is_zero() {
            return Err(ConfigError::ZeroLedgerTimeout);
        }

        let limits = &self.rate_limits;
        for (name, value) in [
            ("login rate limit", limits.login_per_minute),
            ("refresh rate limit", limits.refresh_per_minute),
            ("logout rate limit", limits.logout_per_minute),
            ("me rate limit", limits.me_per_minute),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroLimit(name));
            }
        }

        Ok(())
    }
}
