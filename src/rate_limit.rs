//! Rate limiting for authentication endpoints.
//!
//! Token buckets keyed per client IP (login, refresh, logout) or per user
//! (`/auth/me`). A rejected request gets 429 with `Retry-After`.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};
use std::{hash::Hash, net::IpAddr, num::NonZeroU32, sync::Arc};

use crate::api::ApiError;
use crate::auth::{ClientIpSource, extract_client_ip};
use crate::config::RateLimitSettings;

/// Per-key rate limiter.
pub type KeyedLimiter<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

/// Rate limiters for the authentication endpoints.
#[derive(Clone)]
pub struct RateLimitConfig {
    pub login: Arc<KeyedLimiter<IpAddr>>,
    pub refresh: Arc<KeyedLimiter<IpAddr>>,
    pub logout: Arc<KeyedLimiter<IpAddr>>,
    pub me: Arc<KeyedLimiter<i64>>,
    ip_source: ClientIpSource,
}

fn per_minute<K: Hash + Eq + Clone>(limit: u32) -> Arc<KeyedLimiter<K>> {
    let limit = NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::keyed(Quota::per_minute(limit)))
}

impl RateLimitConfig {
    pub fn new(settings: &RateLimitSettings, ip_source: ClientIpSource) -> Self {
        Self {
            login: per_minute(settings.login_per_minute),
            refresh: per_minute(settings.refresh_per_minute),
            logout: per_minute(settings.logout_per_minute),
            me: per_minute(settings.me_per_minute),
            ip_source,
        }
    }

    /// Count a `/auth/me` request against `user_id`.
    pub fn check_user(&self, user_id: i64) -> Result<(), ApiError> {
        check(&self.me, &user_id)
    }

    /// Drop state for keys whose buckets have refilled.
    pub fn retain_recent(&self) {
        self.login.retain_recent();
        self.refresh.retain_recent();
        self.logout.retain_recent();
        self.me.retain_recent();
    }
}

fn check<K: Hash + Eq + Clone>(limiter: &KeyedLimiter<K>, key: &K) -> Result<(), ApiError> {
    limiter.check_key(key).map_err(|not_until| {
        let wait = not_until.wait_time_from(DefaultClock::default().now());
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        ApiError::TooManyRequests {
            retry_after: secs.max(1),
        }
    })
}

async fn limit_by_ip(
    config: &RateLimitConfig,
    limiter: &KeyedLimiter<IpAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match extract_client_ip(&request, config.ip_source) {
        Ok(ip) => ip,
        Err(_) => {
            return (StatusCode::FORBIDDEN, "Unable to determine client IP.").into_response();
        }
    };

    match check(limiter, &ip) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::warn!(%ip, path = %request.uri().path(), "Rate limit exceeded");
            e.into_response()
        }
    }
}

/// Middleware for rate limiting login.
pub async fn rate_limit_login(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    limit_by_ip(&config, &config.login, request, next).await
}

/// Middleware for rate limiting refresh.
pub async fn rate_limit_refresh(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    limit_by_ip(&config, &config.refresh, request, next).await
}

/// Middleware for rate limiting logout.
pub async fn rate_limit_logout(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    limit_by_ip(&config, &config.logout, request, next).await
}
