//! Authentication API endpoints.
//!
//! - POST `/register` - Create an account
//! - POST `/login` - Check credentials and set session cookies
//! - POST `/refresh` - Rotate the refresh cookie and re-set session cookies
//! - POST `/logout` - Revoke the refresh token, blacklist the access token
//! - POST `/logout-all` - Invalidate every session of the current user
//! - GET `/me` - Current user
//! - GET `/sessions` - Active devices of the current user
//! - DELETE `/sessions/{fingerprint}` - Sign out one device

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{ApiError, ResultExt};
use crate::auth::{
    Auth, AuthErrorKind, ClientIp, ClientIpSource, REFRESH_COOKIE_NAME, RequestAuthenticator,
    cleared_cookies, discard_session_cookies, get_cookie, presented_access_token,
    session_cookies,
};
use crate::db::{self, ActiveDevice};
use crate::device::DeviceContext;
use crate::impl_has_auth_backend;
use crate::jwt::TokenCodec;
use crate::rate_limit::{RateLimitConfig, rate_limit_login, rate_limit_logout, rate_limit_refresh};
use crate::session::{IssuedSession, SessionIssuer};

#[derive(Clone)]
pub struct AuthApiState {
    pub issuer: SessionIssuer,
    pub authenticator: RequestAuthenticator,
    pub ip_source: ClientIpSource,
    pub secure_cookies: bool,
    pub rate_limit_config: Arc<RateLimitConfig>,
}

impl_has_auth_backend!(AuthApiState);

pub fn router(state: AuthApiState) -> Router {
    let limits = state.rate_limit_config.clone();

    let login_router = Router::new()
        .route("/login", post(login))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(limits.clone(), rate_limit_login));

    let refresh_router = Router::new()
        .route("/refresh", post(refresh))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(limits.clone(), rate_limit_refresh));

    let logout_router = Router::new()
        .route("/logout", post(logout))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(limits, rate_limit_logout));

    Router::new()
        .route("/register", post(register))
        .route("/logout-all", post(logout_all))
        .route("/me", get(me))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{fingerprint}", delete(revoke_session))
        .with_state(state)
        .merge(login_router)
        .merge(refresh_router)
        .merge(logout_router)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    username: String,
    password: String,
    full_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    id: String,
    username: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    username: String,
    password: String,
    device_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token_expires_in: u64,
    refresh_token_expires_in: u64,
    token_type: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    id: String,
    username: String,
    full_name: String,
    last_login_at: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionsResponse {
    sessions: Vec<ActiveDevice>,
    current_device: String,
}

#[derive(Serialize)]
struct RevokeResponse {
    revoked: u64,
}

fn with_cookies(mut response: Response, cookies: impl IntoIterator<Item = String>) -> Response {
    let headers = response.headers_mut();
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(SET_COOKIE, value);
        }
    }
    response
}

fn session_response(session: &IssuedSession, secure: bool) -> Response {
    let body = TokenResponse {
        access_token_expires_in: session.access.duration,
        refresh_token_expires_in: session.refresh_expires_in,
        token_type: "Bearer",
    };
    with_cookies(
        (StatusCode::OK, Json(body)).into_response(),
        session_cookies(session, secure),
    )
}

fn signed_out_response(secure: bool) -> Response {
    discard_session_cookies();
    with_cookies(
        (StatusCode::OK, Json(serde_json::json!({ "success": true }))).into_response(),
        cleared_cookies(secure),
    )
}

/// Create an account.
async fn register(
    State(state): State<AuthApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let uuid = state
        .issuer
        .register(&request.username, &request.password, &request.full_name)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: uuid,
            username: request.username.trim().to_string(),
        }),
    ))
}

/// Check credentials and open a session for the requesting device.
async fn login(
    State(state): State<AuthApiState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let device = DeviceContext::from_headers(&headers, ip, request.device_id.as_deref());
    let session = state
        .issuer
        .login(&request.username, &request.password, &device)
        .await?;

    Ok(session_response(&session, state.secure_cookies))
}

/// Exchange the refresh cookie for a new token pair.
/// On failure the client's cookies are cleared.
async fn refresh(
    State(state): State<AuthApiState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let failed = || {
        with_cookies(
            ApiError::unauthorized("Invalid or expired refresh token").into_response(),
            cleared_cookies(state.secure_cookies),
        )
    };

    let Some(refresh_token) = get_cookie(&headers, REFRESH_COOKIE_NAME) else {
        return Ok(failed());
    };
    let device = DeviceContext::from_headers(&headers, ip, None);

    match state
        .authenticator
        .refresh_session(refresh_token, &device)
        .await
    {
        Ok(session) => Ok(session_response(&session, state.secure_cookies)),
        Err(AuthErrorKind::DatabaseError) => Err(ApiError::internal("Database error")),
        Err(_) => Ok(failed()),
    }
}

/// Revoke the refresh token, blacklist the presented access token and clear
/// cookies. Succeeds even when nothing valid was presented.
async fn logout(State(state): State<AuthApiState>, headers: HeaderMap) -> Response {
    if let Some(refresh_token) = get_cookie(&headers, REFRESH_COOKIE_NAME) {
        if let Err(e) = state.authenticator.rotator().revoke(refresh_token).await {
            warn!("Failed to revoke refresh token on logout: {}", e);
        }
    }

    if let Some(access_token) = presented_access_token(&headers) {
        if let Ok(claims) = state
            .authenticator
            .codec()
            .verify_ignoring_expiry(access_token)
        {
            state
                .authenticator
                .ledger()
                .blacklist(&claims.jti, TokenCodec::remaining_ttl(&claims))
                .await;
        }
    }

    signed_out_response(state.secure_cookies)
}

/// Invalidate every session the current user holds.
async fn logout_all(
    State(state): State<AuthApiState>,
    Auth(auth): Auth,
) -> Result<Response, ApiError> {
    state
        .authenticator
        .rotator()
        .invalidate_user(auth.id())
        .await
        .db_err("Failed to invalidate sessions")?;

    info!(user_id = auth.id(), "User logged out everywhere");
    Ok(signed_out_response(state.secure_cookies))
}

/// Current user.
async fn me(
    State(state): State<AuthApiState>,
    Auth(auth): Auth,
) -> Result<impl IntoResponse, ApiError> {
    state.rate_limit_config.check_user(auth.id())?;

    let user = auth.user;
    Ok(Json(MeResponse {
        id: user.uuid,
        username: user.username,
        full_name: user.full_name,
        last_login_at: user.last_login_at,
    }))
}

/// Devices holding a usable refresh token, most recently used first.
async fn list_sessions(
    State(state): State<AuthApiState>,
    Auth(auth): Auth,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state
        .authenticator
        .db()
        .refresh_tokens()
        .active_devices(auth.id(), db::now())
        .await
        .db_err("Failed to list sessions")?;

    Ok(Json(SessionsResponse {
        sessions,
        current_device: auth.claims.dfp,
    }))
}

/// Sign out one device of the current user.
async fn revoke_session(
    State(state): State<AuthApiState>,
    Auth(auth): Auth,
    Path(fingerprint): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let revoked = state
        .authenticator
        .rotator()
        .revoke_device(auth.id(), &fingerprint)
        .await
        .db_err("Failed to revoke session")?;

    if revoked == 0 {
        return Err(ApiError::not_found("Session not found"));
    }
    Ok(Json(RevokeResponse { revoked }))
}
