//! Device fingerprinting.
//!
//! A fingerprint binds credentials to a browser (user agent hash), a network
//! (IPv4 /24 or IPv6 /64 prefix) and, when the client supplies one, a stable
//! device id.

use std::net::IpAddr;

use axum::http::{HeaderMap, header};
use sha2::{Digest, Sha256};
use woothee::parser::Parser;

use crate::auth::{DEVICE_COOKIE_NAME, get_cookie};

/// Substituted when a request carries no user agent.
pub const UNKNOWN_USER_AGENT: &str = "Unknown";

/// Header a client may use to announce its device id.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

const MAX_DEVICE_ID_LEN: usize = 64;

const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Everything known about the device a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceContext {
    pub fingerprint: String,
    pub device_name: String,
    pub ip_address: String,
    pub ip_prefix: String,
    pub user_agent_hash: String,
    pub device_id: Option<String>,
}

impl DeviceContext {
    /// Derive the context from raw request metadata.
    pub fn new(user_agent: Option<&str>, client_ip: IpAddr, device_id: Option<&str>) -> Self {
        let user_agent = user_agent
            .map(str::trim)
            .filter(|ua| !ua.is_empty());
        let user_agent_hash = sha256_hex(user_agent.unwrap_or(UNKNOWN_USER_AGENT));
        let ip_prefix = ip_prefix(client_ip);
        let device_id = device_id.and_then(sanitize_device_id).map(str::to_string);
        let fingerprint = combine(&user_agent_hash, &ip_prefix, device_id.as_deref());

        Self {
            fingerprint,
            device_name: device_name(user_agent),
            ip_address: client_ip.to_canonical().to_string(),
            ip_prefix,
            user_agent_hash,
            device_id,
        }
    }

    /// Derive the context from request headers.
    ///
    /// The device id comes from `explicit_device_id` when valid, then the
    /// `X-Device-ID` header, then the `device_id` cookie.
    pub fn from_headers(
        headers: &HeaderMap,
        client_ip: IpAddr,
        explicit_device_id: Option<&str>,
    ) -> Self {
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());
        let device_id = explicit_device_id
            .and_then(sanitize_device_id)
            .or_else(|| {
                headers
                    .get(DEVICE_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(sanitize_device_id)
            })
            .or_else(|| get_cookie(headers, DEVICE_COOKIE_NAME).and_then(sanitize_device_id));

        Self::new(user_agent, client_ip, device_id)
    }

    /// Whether this request plausibly comes from the device a credential was
    /// issued to. See [`matches`].
    pub fn matches_stored(
        &self,
        stored_user_agent_hash: &str,
        stored_ip_prefix: &str,
        stored_device_id: Option<&str>,
    ) -> bool {
        matches(
            &self.user_agent_hash,
            &self.ip_prefix,
            self.device_id.as_deref(),
            stored_user_agent_hash,
            stored_ip_prefix,
            stored_device_id,
        )
    }
}

/// Fingerprint for a user agent, client address and optional device id.
pub fn fingerprint(user_agent: Option<&str>, client_ip: IpAddr, device_id: Option<&str>) -> String {
    DeviceContext::new(user_agent, client_ip, device_id).fingerprint
}

fn combine(user_agent_hash: &str, ip_prefix: &str, device_id: Option<&str>) -> String {
    match device_id {
        Some(id) => sha256_hex(&format!("{}|{}|{}", user_agent_hash, ip_prefix, id)),
        None => sha256_hex(&format!("{}|{}", user_agent_hash, ip_prefix)),
    }
}

/// Compare a candidate device against stored binding data.
///
/// User agent hash and IP prefix must be equal. A stored device id only fails
/// the match when it is non-empty and the candidate's differs or is missing, so
/// credentials issued before the client had a device id still match.
pub fn matches(
    candidate_user_agent_hash: &str,
    candidate_ip_prefix: &str,
    candidate_device_id: Option<&str>,
    stored_user_agent_hash: &str,
    stored_ip_prefix: &str,
    stored_device_id: Option<&str>,
) -> bool {
    if candidate_user_agent_hash != stored_user_agent_hash {
        return false;
    }
    if candidate_ip_prefix != stored_ip_prefix {
        return false;
    }
    match stored_device_id.filter(|id| !id.is_empty()) {
        Some(stored) => candidate_device_id == Some(stored),
        None => true,
    }
}

/// Network prefix used for binding: first three octets for IPv4, first four
/// groups for IPv6. IPv4-mapped IPv6 addresses are treated as IPv4.
pub fn ip_prefix(ip: IpAddr) -> String {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{}.{}.{}", a, b, c)
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}", s[0], s[1], s[2], s[3])
        }
    }
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Accept a client-supplied device id only if it is short and URL-safe.
pub fn sanitize_device_id(raw: &str) -> Option<&str> {
    let id = raw.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_DEVICE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(id)
}

/// Human readable name such as "Firefox on Linux".
pub fn device_name(user_agent: Option<&str>) -> String {
    let Some(result) = user_agent.and_then(|ua| Parser::new().parse(ua)) else {
        return UNKNOWN_DEVICE.to_string();
    };

    let browser = known(result.name);
    if result.category == "crawler" {
        return browser.unwrap_or("Crawler").to_string();
    }
    match (browser, known(result.os)) {
        (Some(browser), Some(os)) => format!("{} on {}", browser, os),
        (Some(browser), None) => browser.to_string(),
        (None, Some(os)) => format!("Unknown browser on {}", os),
        (None, None) => UNKNOWN_DEVICE.to_string(),
    }
}

/// woothee reports missing fields as "UNKNOWN".
fn known(value: &str) -> Option<&str> {
    (!value.is_empty() && value != "UNKNOWN").then_some(value)
}
