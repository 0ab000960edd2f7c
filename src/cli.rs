//! CLI argument parsing, validation, and startup helpers.

use std::sync::Arc;
use std::time::Duration;

use crate::ServerConfig;
use crate::auth::ClientIpSource;
use crate::config::{ConfigError, RateLimitSettings, SecurityConfig};
use crate::db::Database;
use crate::ledger::InMemoryLedgerBackend;
use crate::password::PasswordManager;
use clap::Parser;
use tracing::{error, info};

const MIN_JWT_SECRET_LENGTH: usize = 32;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sessionguard",
    about = "Session authentication with rotating refresh tokens"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "SESSIONGUARD_PORT", default_value = "7291")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, env = "SESSIONGUARD_DATABASE", default_value = "sessionguard.db")]
    pub database: String,

    /// Path to file containing JWT secret. Prefer using JWT_SECRET env var instead
    #[arg(long)]
    pub jwt_secret_file: Option<String>,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Access token lifetime in seconds
    #[arg(long, env = "SESSIONGUARD_ACCESS_TTL", default_value = "180")]
    pub access_token_ttl: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "SESSIONGUARD_REFRESH_TTL", default_value = "604800")]
    pub refresh_token_ttl: u64,

    /// Extra seconds ledger entries outlive their tokens
    #[arg(long, default_value = "60")]
    pub clock_skew: u64,

    /// Devices per user before the least recently used one is signed out
    #[arg(long, default_value = "5")]
    pub max_devices: usize,

    /// Access tokens tracked per device
    #[arg(long, default_value = "2")]
    pub max_tokens_per_device: usize,

    /// Failed logins before the account locks
    #[arg(long, default_value = "5")]
    pub max_login_attempts: u32,

    /// Account lock duration in seconds
    #[arg(long, default_value = "900")]
    pub lock_duration: u64,

    /// Timeout for a single replay ledger call in milliseconds
    #[arg(long, default_value = "250")]
    pub ledger_timeout_ms: u64,

    /// Read client addresses from X-Forwarded-For / X-Real-IP (only behind a trusted proxy)
    #[arg(long)]
    pub trust_proxy: bool,

    /// Omit the Secure attribute on cookies (local development over plain HTTP)
    #[arg(long)]
    pub insecure_cookies: bool,

    /// Reject requests while the replay ledger is unavailable
    #[arg(long)]
    pub ledger_fail_closed: bool,

    /// Reject access tokens whose network changed since issuance
    #[arg(long)]
    pub reject_suspicious_jti: bool,

    /// Do not compare the access token's device fingerprint with the request
    #[arg(long)]
    pub no_device_binding: bool,

    /// Turn off access token id tracking and blacklisting
    #[arg(long)]
    pub disable_jti_tracking: bool,

    /// Argon2 memory cost in KiB
    #[arg(long, default_value = "19456")]
    pub argon2_memory_kib: u32,

    /// Argon2 iterations
    #[arg(long, default_value = "2")]
    pub argon2_iterations: u32,

    /// Argon2 lanes
    #[arg(long, default_value = "1")]
    pub argon2_parallelism: u32,

    /// Login requests per minute per IP
    #[arg(long, default_value = "5")]
    pub login_rate: u32,

    /// Refresh requests per minute per IP
    #[arg(long, default_value = "10")]
    pub refresh_rate: u32,

    /// Logout requests per minute per IP
    #[arg(long, default_value = "5")]
    pub logout_rate: u32,

    /// /auth/me requests per minute per user
    #[arg(long, default_value = "60")]
    pub me_rate: u32,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load JWT secret from environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_jwt_secret(jwt_secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var("JWT_SECRET") {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var("JWT_SECRET") };
        secret
    } else if let Some(path) = jwt_secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read JWT secret file");
                return None;
            }
        }
    } else {
        error!(
            "JWT secret is required. Set JWT_SECRET environment variable (recommended) or use --jwt-secret-file"
        );
        return None;
    };

    if secret.len() < MIN_JWT_SECRET_LENGTH {
        error!(
            "JWT secret is shorter than {} characters. Use a longer secret",
            MIN_JWT_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Build and validate the security settings.
pub fn security_config(args: &Args) -> Result<SecurityConfig, ConfigError> {
    let config = SecurityConfig {
        access_token_ttl: Duration::from_secs(args.access_token_ttl),
        refresh_token_ttl: Duration::from_secs(args.refresh_token_ttl),
        clock_skew: Duration::from_secs(args.clock_skew),
        max_devices_per_user: args.max_devices,
        max_jtis_per_device: args.max_tokens_per_device,
        max_login_attempts: args.max_login_attempts,
        lock_duration: Duration::from_secs(args.lock_duration),
        tracking_enabled: !args.disable_jti_tracking,
        reject_suspicious: args.reject_suspicious_jti,
        fail_closed: args.ledger_fail_closed,
        ledger_timeout: Duration::from_millis(args.ledger_timeout_ms),
        require_device_binding: !args.no_device_binding,
        secure_cookies: !args.insecure_cookies,
        rate_limits: RateLimitSettings {
            login_per_minute: args.login_rate,
            refresh_per_minute: args.refresh_rate,
            logout_per_minute: args.logout_rate,
            me_per_minute: args.me_rate,
        },
    };
    config.validate()?;
    Ok(config)
}

/// Build ServerConfig from validated arguments.
/// Returns None and logs an error if a setting is rejected.
pub fn build_config(args: &Args, db: Database, jwt_secret: String) -> Option<ServerConfig> {
    let security = match security_config(args) {
        Ok(security) => security,
        Err(e) => {
            error!(error = %e, "Invalid security configuration");
            return None;
        }
    };

    let passwords = match PasswordManager::new(
        args.argon2_memory_kib,
        args.argon2_iterations,
        args.argon2_parallelism,
    ) {
        Ok(passwords) => passwords,
        Err(e) => {
            error!(error = %e, "Invalid Argon2 parameters");
            return None;
        }
    };

    let ip_source = if args.trust_proxy {
        ClientIpSource::TrustedProxy
    } else {
        ClientIpSource::Peer
    };

    Some(ServerConfig {
        db,
        jwt_secret: jwt_secret.into_bytes(),
        security,
        ip_source,
        ledger_backend: Arc::new(InMemoryLedgerBackend::new()),
        passwords,
    })
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_security_config() {
        let args = Args::try_parse_from(["sessionguard"]).unwrap();
        let config = security_config(&args).unwrap();
        let defaults = SecurityConfig::default();

        assert_eq!(config.access_token_ttl, defaults.access_token_ttl);
        assert_eq!(config.refresh_token_ttl, defaults.refresh_token_ttl);
        assert_eq!(config.max_devices_per_user, defaults.max_devices_per_user);
        assert_eq!(config.max_jtis_per_device, defaults.max_jtis_per_device);
        assert_eq!(config.lock_duration, defaults.lock_duration);
        assert_eq!(config.ledger_timeout, defaults.ledger_timeout);
        assert!(config.secure_cookies);
        assert!(config.require_device_binding);
        assert!(config.tracking_enabled);
        assert!(!config.fail_closed);
    }

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from([
            "sessionguard",
            "--insecure-cookies",
            "--no-device-binding",
            "--ledger-fail-closed",
            "--disable-jti-tracking",
        ])
        .unwrap();
        let config = security_config(&args).unwrap();

        assert!(!config.secure_cookies);
        assert!(!config.require_device_binding);
        assert!(config.fail_closed);
        assert!(!config.tracking_enabled);
    }

    #[test]
    fn test_rejects_refresh_shorter_than_access() {
        let args = Args::try_parse_from([
            "sessionguard",
            "--access-token-ttl",
            "600",
            "--refresh-token-ttl",
            "300",
        ])
        .unwrap();
        assert!(matches!(
            security_config(&args),
            Err(ConfigError::RefreshNotLongerThanAccess { .. })
        ));
    }

    #[test]
    fn test_rejects_huge_refresh_lifetime() {
        let args = Args::try_parse_from([
            "sessionguard",
            "--refresh-token-ttl",
            "18446744073709551615",
        ])
        .unwrap();
        assert_eq!(
            security_config(&args).unwrap_err(),
            ConfigError::LifetimeTooLong("refresh token lifetime")
        );
    }
}
