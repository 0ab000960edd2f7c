//! Authentication state traits and macro.

use super::authenticator::RequestAuthenticator;
use super::ip::ClientIpSource;

/// Trait for state types that can authenticate requests.
pub trait HasAuthBackend {
    fn authenticator(&self) -> &RequestAuthenticator;
    fn ip_source(&self) -> ClientIpSource;
    fn secure_cookies(&self) -> bool;
}

/// Macro to implement `HasAuthBackend` for state structs with the standard fields.
///
/// The struct must have these fields:
/// - `authenticator: RequestAuthenticator`
/// - `ip_source: ClientIpSource`
/// - `secure_cookies: bool`
#[macro_export]
macro_rules! impl_has_auth_backend {
    ($state_type:ty) => {
        impl $crate::auth::HasAuthBackend for $state_type {
            fn authenticator(&self) -> &$crate::auth::RequestAuthenticator {
                &self.authenticator
            }
            fn ip_source(&self) -> $crate::auth::ClientIpSource {
                self.ip_source
            }
            fn secure_cookies(&self) -> bool {
                self.secure_cookies
            }
        }
    };
}
