//! Axum extractors for authentication.

use std::cell::RefCell;

use std::net::IpAddr;

use axum::{
    extract::{FromRequestParts, Request},
    http::{HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::Response,
};

use super::cookie::session_cookies;
use super::errors::{ApiAuthError, AuthErrorKind};
use super::ip::extract_client_ip;
use super::state::HasAuthBackend;
use super::types::AuthenticatedUser;

tokio::task_local! {
    /// Task-local storage for cookies set during authentication.
    /// Used to pass cookies from the auth extractor to the response middleware.
    pub static NEW_SESSION_COOKIES: RefCell<Vec<String>>;
}

/// Core authentication logic shared by the extractors.
async fn authenticate_request<S>(
    parts: &Parts,
    state: &S,
) -> Result<AuthenticatedUser, AuthErrorKind>
where
    S: HasAuthBackend + Send + Sync,
{
    let client_ip = extract_client_ip(parts, state.ip_source())
        .map_err(|_| AuthErrorKind::NotAuthenticated)?;

    let authenticated = state
        .authenticator()
        .authenticate(&parts.headers, client_ip)
        .await?;

    if let Some(session) = &authenticated.refreshed {
        let cookies = session_cookies(session, state.secure_cookies());
        let _ = NEW_SESSION_COOKIES.try_with(|cell| {
            cell.borrow_mut().extend(cookies);
        });
    }

    Ok(authenticated.user)
}

/// Extractor for endpoints that require authentication.
/// Validates the access token; if it is missing or stale, attempts a
/// transparent refresh using the refresh cookie.
/// Returns JSON errors and clears cookies on failure.
pub struct Auth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for Auth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = ApiAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        authenticate_request(parts, state)
            .await
            .map(Auth)
            .map_err(|kind| ApiAuthError::new(kind, state.secure_cookies()))
    }
}

/// Extractor for the client address, honouring the configured IP source.
pub struct ClientIp(pub IpAddr);

impl<S> FromRequestParts<S> for ClientIp
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        extract_client_ip(parts, state.ip_source())
            .map(ClientIp)
            .map_err(|_| (StatusCode::FORBIDDEN, "Unable to determine client IP."))
    }
}

/// Drop cookies queued by a transparent refresh in this request.
/// Used by handlers that end the session they authenticated with.
pub fn discard_session_cookies() {
    let _ = NEW_SESSION_COOKIES.try_with(|cell| cell.borrow_mut().clear());
}

/// Middleware that appends cookies queued by the extractors to the response.
pub async fn add_session_cookies(request: Request, next: Next) -> Response {
    NEW_SESSION_COOKIES
        .scope(RefCell::new(Vec::new()), async move {
            let mut response = next.run(request).await;
            let cookies = NEW_SESSION_COOKIES.with(|cell| cell.take());
            let headers = response.headers_mut();
            for cookie in cookies {
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    headers.append(header::SET_COOKIE, value);
                }
            }
            response
        })
        .await
}
