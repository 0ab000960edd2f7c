//! Cookie parsing and construction for authentication.

use axum::http::{HeaderMap, header};

use crate::session::IssuedSession;

/// Cookie name for the access token.
pub const ACCESS_COOKIE_NAME: &str = "access_token";

/// Cookie name for the refresh token.
pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// Cookie name for the client device id. Readable by scripts.
pub const DEVICE_COOKIE_NAME: &str = "device_id";

/// Extract a cookie value from the Cookie header.
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == name {
                return Some(value.trim());
            }
        }
    }
    None
}

fn build_cookie(name: &str, value: &str, max_age: u64, http_only: bool, secure: bool) -> String {
    format!(
        "{}={};{} SameSite=Strict; Path=/; Max-Age={}{}",
        name,
        value,
        if http_only { " HttpOnly;" } else { "" },
        max_age,
        if secure { "; Secure" } else { "" }
    )
}

/// Set-Cookie values for a freshly issued session.
pub fn session_cookies(session: &IssuedSession, secure: bool) -> Vec<String> {
    let mut cookies = vec![
        build_cookie(
            ACCESS_COOKIE_NAME,
            &session.access.token,
            session.access.duration,
            true,
            secure,
        ),
        build_cookie(
            REFRESH_COOKIE_NAME,
            &session.refresh_token,
            session.refresh_expires_in,
            true,
            secure,
        ),
    ];
    if let Some(device_id) = &session.device.device_id {
        cookies.push(build_cookie(
            DEVICE_COOKIE_NAME,
            device_id,
            session.refresh_expires_in,
            false,
            secure,
        ));
    }
    cookies
}

/// Set-Cookie values that expire every authentication cookie.
pub fn cleared_cookies(secure: bool) -> [String; 3] {
    [
        build_cookie(ACCESS_COOKIE_NAME, "", 0, true, secure),
        build_cookie(REFRESH_COOKIE_NAME, "", 0, true, secure),
        build_cookie(DEVICE_COOKIE_NAME, "", 0, false, secure),
    ]
}
