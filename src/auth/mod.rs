//! Request authentication.
//!
//! Short-lived access tokens (bearer header or cookie) are checked against
//! the replay ledger, the device fingerprint and the user's token version.
//! When the access token is missing or expired, the extractor rotates the
//! refresh cookie and sets fresh cookies on the response.

mod authenticator;
mod cookie;
mod errors;
mod extractors;
mod ip;
mod state;
mod types;

pub use authenticator::{Authenticated, RequestAuthenticator, presented_access_token};
pub use cookie::{
    ACCESS_COOKIE_NAME, DEVICE_COOKIE_NAME, REFRESH_COOKIE_NAME, cleared_cookies, get_cookie,
    session_cookies,
};
pub use errors::{ApiAuthError, AuthErrorKind};
pub use extractors::{
    Auth, ClientIp, NEW_SESSION_COOKIES, add_session_cookies, discard_session_cookies,
};
pub use ip::{ClientIpSource, HasHeadersAndExtensions, extract_client_ip};
pub use state::HasAuthBackend;
pub use types::AuthenticatedUser;
