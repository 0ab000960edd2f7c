#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode},
};
use serde_json::{Value, json};
use sessionguard::{
    ServerConfig,
    auth::ClientIpSource,
    config::{RateLimitSettings, SecurityConfig},
    create_app,
    db::Database,
    ledger::InMemoryLedgerBackend,
    password::PasswordManager,
};
use tower::ServiceExt;

pub const UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
pub const OTHER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                            (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
pub const TEST_IP: &str = "10.0.0.1";
pub const ALT_IP: &str = "172.16.0.1";
pub const PASSWORD: &str = "correct horse battery";

/// Security settings with limits high enough to stay out of the way.
pub fn test_security() -> SecurityConfig {
    SecurityConfig {
        secure_cookies: false,
        rate_limits: RateLimitSettings {
            login_per_minute: 1000,
            refresh_per_minute: 1000,
            logout_per_minute: 1000,
            me_per_minute: 1000,
        },
        ..SecurityConfig::default()
    }
}

pub struct TestApp {
    pub app: Router,
    pub db: Database,
}

/// Cookies and tokens from a successful login or refresh.
#[derive(Debug, Clone)]
pub struct Session {
    pub access: String,
    pub refresh: String,
    pub set_cookies: Vec<String>,
}

impl Session {
    pub fn cookie_header(&self) -> String {
        format!("access_token={}; refresh_token={}", self.access, self.refresh)
    }
}

/// Where a request comes from.
pub struct Client<'a> {
    pub ip: &'a str,
    pub ua: &'a str,
}

pub const BROWSER: Client<'static> = Client { ip: TEST_IP, ua: UA };

impl TestApp {
    pub async fn new() -> Self {
        Self::with_security(test_security()).await
    }

    pub async fn with_security(security: SecurityConfig) -> Self {
        let db = Database::open(":memory:")
            .await
            .expect("Failed to open test database");
        let config = ServerConfig {
            db: db.clone(),
            jwt_secret: b"test-jwt-secret-that-is-long-enough".to_vec(),
            security,
            ip_source: ClientIpSource::TrustedProxy,
            ledger_backend: Arc::new(InMemoryLedgerBackend::new()),
            passwords: PasswordManager::new(1024, 1, 1).expect("Invalid Argon2 parameters"),
        };
        Self {
            app: create_app(&config),
            db,
        }
    }

    pub async fn send(
        &self,
        client: &Client<'_>,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("user-agent", client.ua)
            .header("x-forwarded-for", client.ip);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn register(&self, username: &str) -> Response<Body> {
        self.send(
            &BROWSER,
            "POST",
            "/auth/register",
            &[],
            Some(json!({
                "username": username,
                "password": PASSWORD,
                "fullName": "Test User",
            })),
        )
        .await
    }

    pub async fn try_login(
        &self,
        client: &Client<'_>,
        username: &str,
        password: &str,
    ) -> Response<Body> {
        self.send(
            client,
            "POST",
            "/auth/login",
            &[],
            Some(json!({ "username": username, "password": password })),
        )
        .await
    }

    /// Register `username` (if needed) and log in from `client`.
    pub async fn login(&self, client: &Client<'_>, username: &str) -> Session {
        let registered = self.register(username).await.status();
        assert!(
            registered == StatusCode::CREATED || registered == StatusCode::CONFLICT,
            "unexpected register status {registered}"
        );
        let response = self.try_login(client, username, PASSWORD).await;
        assert_eq!(response.status(), StatusCode::OK);
        session_from(&response)
    }

    pub async fn refresh(&self, client: &Client<'_>, refresh_token: &str) -> Response<Body> {
        let cookie = format!("refresh_token={}", refresh_token);
        self.send(client, "POST", "/auth/refresh", &[("cookie", &cookie)], None)
            .await
    }

    pub async fn me_with_bearer(&self, client: &Client<'_>, access_token: &str) -> Response<Body> {
        let bearer = format!("Bearer {}", access_token);
        self.send(client, "GET", "/auth/me", &[("authorization", &bearer)], None)
            .await
    }
}

/// Tokens set by a response.
pub fn session_from(response: &Response<Body>) -> Session {
    let set_cookies = extract_set_cookies(response);
    Session {
        access: cookie_value(&set_cookies, "access_token").expect("no access_token cookie"),
        refresh: cookie_value(&set_cookies, "refresh_token").expect("no refresh_token cookie"),
        set_cookies,
    }
}

/// Extract Set-Cookie headers from response
pub fn extract_set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .collect()
}

/// Value of a non-cleared cookie named `name`.
pub fn cookie_value(cookies: &[String], name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    cookies
        .iter()
        .filter(|c| c.starts_with(&prefix) && !c.contains("Max-Age=0"))
        .find_map(|c| c[prefix.len()..].split(';').next().map(str::to_string))
        .filter(|v| !v.is_empty())
}

/// Check if cookies contain a token being cleared (Max-Age=0)
pub fn has_cleared_cookie(cookies: &[String], cookie_name: &str) -> bool {
    let prefix = format!("{}=;", cookie_name);
    cookies
        .iter()
        .any(|c| c.starts_with(&prefix) && c.contains("Max-Age=0"))
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
