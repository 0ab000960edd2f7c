//! Authentication user types.

use crate::db::User;
use crate::jwt::AccessClaims;

/// A request's authenticated principal.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Database row, read during authentication
    pub user: User,
    /// Claims of the access token that authenticated the request
    pub claims: AccessClaims,
}

impl AuthenticatedUser {
    pub fn id(&self) -> i64 {
        self.user.id
    }
}
