pub mod api;
pub mod auth;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod db;
pub mod device;
pub mod jwt;
pub mod ledger;
pub mod password;
pub mod rate_limit;
pub mod session;

use api::{AuthApiState, create_api_router};
use auth::{ClientIpSource, RequestAuthenticator, add_session_cookies};
use axum::{Router, middleware};
use cleanup::CleanupTargets;
use config::SecurityConfig;
use db::Database;
use jwt::TokenCodec;
use ledger::{LedgerBackend, ReplayLedger};
use password::PasswordManager;
use rate_limit::RateLimitConfig;
use session::{AccessMinter, SessionIssuer, SessionRotator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// JWT secret for signing access tokens
    pub jwt_secret: Vec<u8>,
    /// Lifetimes, limits and enforcement switches
    pub security: SecurityConfig,
    /// Where client addresses are read from
    pub ip_source: ClientIpSource,
    /// Storage for the replay ledger
    pub ledger_backend: Arc<dyn LedgerBackend>,
    pub passwords: PasswordManager,
}

/// The wired-up session services behind the HTTP layer.
#[derive(Clone)]
pub struct AppServices {
    pub issuer: SessionIssuer,
    pub rotator: SessionRotator,
    pub ledger: ReplayLedger,
    pub authenticator: RequestAuthenticator,
    pub rate_limits: Arc<RateLimitConfig>,
    ip_source: ClientIpSource,
    secure_cookies: bool,
}

impl AppServices {
    pub fn new(config: &ServerConfig) -> Self {
        let security = &config.security;
        let codec = TokenCodec::new(&config.jwt_secret, security.access_token_ttl);
        let ledger = ReplayLedger::new(config.ledger_backend.clone(), security);
        let minter = AccessMinter::new(codec.clone(), ledger.clone());
        let rotator = SessionRotator::new(
            config.db.clone(),
            minter.clone(),
            security.refresh_token_ttl,
        );
        let issuer = SessionIssuer::new(
            config.db.clone(),
            minter,
            config.passwords.clone(),
            security,
        );
        let authenticator = RequestAuthenticator::new(
            config.db.clone(),
            codec,
            ledger.clone(),
            rotator.clone(),
            security.require_device_binding,
        );
        let rate_limits = Arc::new(RateLimitConfig::new(
            &security.rate_limits,
            config.ip_source,
        ));

        Self {
            issuer,
            rotator,
            ledger,
            authenticator,
            rate_limits,
            ip_source: config.ip_source,
            secure_cookies: security.secure_cookies,
        }
    }

    /// Build the HTTP router.
    pub fn router(&self) -> Router {
        let auth_state = AuthApiState {
            issuer: self.issuer.clone(),
            authenticator: self.authenticator.clone(),
            ip_source: self.ip_source,
            secure_cookies: self.secure_cookies,
            rate_limit_config: self.rate_limits.clone(),
        };

        create_api_router(auth_state).layer(middleware::from_fn(add_session_cookies))
    }

    pub fn cleanup_targets(&self) -> CleanupTargets {
        CleanupTargets {
            rotator: self.rotator.clone(),
            ledger: self.ledger.clone(),
            rate_limits: self.rate_limits.clone(),
        }
    }
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Router {
    AppServices::new(config).router()
}

/// Run cleanup tasks and spawn background scheduler.
/// Call this before starting the server.
pub async fn init_cleanup(services: &AppServices) -> tokio::task::JoinHandle<()> {
    let targets = services.cleanup_targets();
    cleanup::run_cleanup(&targets).await;
    cleanup::spawn_cleanup_scheduler(targets)
}

/// Run the server on the given listener. This function blocks until the server exits.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let services = AppServices::new(&config);
    init_cleanup(&services).await;
    let make_service = services
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}
