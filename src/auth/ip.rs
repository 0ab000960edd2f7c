//! Client IP extraction utilities.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::ConnectInfo,
    http::{HeaderMap, request::Parts},
};

/// Where the client address is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientIpSource {
    /// The socket peer address.
    #[default]
    Peer,
    /// `X-Forwarded-For` (first entry), then `X-Real-IP`, then the peer.
    /// Only safe behind a proxy that overwrites these headers.
    TrustedProxy,
}

/// Trait for types that provide access to HTTP headers and extensions.
/// Implemented for both `Parts` and `Request` to allow flexible IP extraction.
pub trait HasHeadersAndExtensions {
    fn headers(&self) -> &HeaderMap;
    fn extensions(&self) -> &axum::http::Extensions;
}

impl HasHeadersAndExtensions for Parts {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
    fn extensions(&self) -> &axum::http::Extensions {
        &self.extensions
    }
}

impl<B> HasHeadersAndExtensions for axum::extract::Request<B> {
    fn headers(&self) -> &HeaderMap {
        axum::extract::Request::headers(self)
    }
    fn extensions(&self) -> &axum::http::Extensions {
        axum::extract::Request::extensions(self)
    }
}

/// Extract the client IP address.
pub fn extract_client_ip<T: HasHeadersAndExtensions>(
    source: &T,
    ip_source: ClientIpSource,
) -> Result<IpAddr, &'static str> {
    if ip_source == ClientIpSource::TrustedProxy {
        if let Some(ip) = forwarded_ip(source.headers()) {
            return Ok(ip);
        }
    }
    source
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .ok_or("No client IP available")
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };
    header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn request(headers: &[(&str, &str)], peer: Option<&str>) -> Request<()> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut()
                .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }
        req
    }

    #[test]
    fn test_peer_ignores_forwarded_headers() {
        let req = request(&[("x-forwarded-for", "1.2.3.4")], Some("10.0.0.9:5555"));
        assert_eq!(
            extract_client_ip(&req, ClientIpSource::Peer),
            Ok("10.0.0.9".parse().unwrap())
        );
    }

    #[test]
    fn test_trusted_proxy_uses_first_forwarded_entry() {
        let req = request(
            &[("x-forwarded-for", " 1.2.3.4 , 10.0.0.1"), ("x-real-ip", "5.6.7.8")],
            Some("10.0.0.9:5555"),
        );
        assert_eq!(
            extract_client_ip(&req, ClientIpSource::TrustedProxy),
            Ok("1.2.3.4".parse().unwrap())
        );
    }

    #[test]
    fn test_trusted_proxy_falls_back() {
        let req = request(&[("x-real-ip", "5.6.7.8")], None);
        assert_eq!(
            extract_client_ip(&req, ClientIpSource::TrustedProxy),
            Ok("5.6.7.8".parse().unwrap())
        );

        let req = request(&[("x-forwarded-for", "garbage")], Some("[::1]:80"));
        assert_eq!(
            extract_client_ip(&req, ClientIpSource::TrustedProxy),
            Ok("::1".parse().unwrap())
        );

        let req = request(&[], None);
        assert!(extract_client_ip(&req, ClientIpSource::TrustedProxy).is_err());
    }
}
