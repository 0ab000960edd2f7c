//! Shared error handling for API endpoints.

use axum::{
    Json,
    http::{StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::session::{LoginFailure, RegistrationFailure};

/// Extension trait for concise error mapping on Results.
pub trait ResultExt<T> {
    fn db_err(self, msg: &str) -> Result<T, ApiError>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn db_err(self, msg: &str) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::db_error(msg, e))
    }
}

/// API error type with automatic response conversion.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Conflict(String),
    Locked { retry_after: u64 },
    TooManyRequests { retry_after: u64 },
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn db_error(context: &str, e: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, e);
        Self::Internal("Database error".into())
    }
}

impl From<LoginFailure> for ApiError {
    fn from(failure: LoginFailure) -> Self {
        match failure {
            // A disabled account is indistinguishable from a wrong password
            LoginFailure::InvalidCredentials | LoginFailure::Disabled => {
                Self::unauthorized("Invalid credentials")
            }
            LoginFailure::AccountLocked { retry_after } => Self::Locked { retry_after },
            LoginFailure::Storage(e) => Self::db_error("Login failed", e),
            LoginFailure::Signing(e) => {
                error!("Failed to sign access token: {}", e);
                Self::internal("Failed to generate token")
            }
        }
    }
}

impl From<RegistrationFailure> for ApiError {
    fn from(failure: RegistrationFailure) -> Self {
        match failure {
            RegistrationFailure::InvalidInput(msg) => Self::bad_request(msg),
            RegistrationFailure::UsernameTaken => Self::conflict("Username already taken"),
            RegistrationFailure::Hashing(e) => {
                error!("Failed to hash password: {}", e);
                Self::internal("Registration failed")
            }
            RegistrationFailure::Storage(e) => Self::db_error("Registration failed", e),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            ApiError::Locked { retry_after } => (
                StatusCode::LOCKED,
                "Account temporarily locked".to_string(),
                Some(retry_after),
            ),
            ApiError::TooManyRequests { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests. Please try again later.".to_string(),
                Some(retry_after),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        let mut response = (status, Json(ErrorResponse { error: message })).into_response();
        if let Some(secs) = retry_after {
            response.headers_mut().insert(RETRY_AFTER, secs.into());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_sets_retry_after() {
        let response = ApiError::from(LoginFailure::AccountLocked { retry_after: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert_eq!(response.headers()[RETRY_AFTER], "42");
    }

    #[test]
    fn test_disabled_reports_invalid_credentials() {
        let response = ApiError::from(LoginFailure::Disabled).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[test]
    fn test_username_taken_is_conflict() {
        let response = ApiError::from(RegistrationFailure::UsernameTaken).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
