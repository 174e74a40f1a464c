use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

use crate::auth::jwt::TokenError;
use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;
pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user not found")]
    UserNotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("caller does not own the document")]
    NotOwner,
    #[error("invalid access token")]
    InvalidAccessToken,
    #[error("refresh token not found")]
    RefreshTokenNotFound,
    #[error("refresh token already used")]
    ReusedToken,
    #[error("refresh token expired")]
    ExpiredToken,
    #[error("refresh attempted from a different user agent")]
    SessionHijackSuspected,
    #[error("refresh secret does not match")]
    InvalidRefreshSecret,
    #[error("resource not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn internal<E: Display>(error: E) -> Self {
        Self::Internal(error.to_string())
    }

    /// Refresh-token failures that indicate the credential may be in someone else's hands.
    pub fn is_theft_signal(&self) -> bool {
        matches!(self, Self::ReusedToken | Self::SessionHijackSuspected)
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::Conflict(message) => ServiceError::Conflict(message),
            StoreError::Unavailable(message) => ServiceError::StorageUnavailable(message),
            StoreError::Timeout => {
                ServiceError::StorageUnavailable("transaction deadline exceeded".to_string())
            }
            StoreError::Database(err) => ServiceError::internal(err),
            StoreError::Internal(message) => ServiceError::Internal(message),
        }
    }
}

impl From<TokenError> for ServiceError {
    fn from(value: TokenError) -> Self {
        match value {
            TokenError::InvalidSignature | TokenError::Expired => ServiceError::InvalidAccessToken,
            TokenError::Internal(message) => ServiceError::Internal(message),
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "access denied")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Login failures collapse to one response so unknown logins cannot be probed.
    pub fn from_login(error: ServiceError) -> Self {
        match error {
            ServiceError::UserNotFound | ServiceError::InvalidCredentials => Self::unauthorized(),
            other => other.into(),
        }
    }

    /// Every refresh rejection, theft signals included, looks the same to the client.
    pub fn from_refresh(error: ServiceError) -> Self {
        if error.is_theft_signal() {
            tracing::warn!(error = %error, "refresh refused on suspected token theft");
        }
        match error {
            ServiceError::InvalidAccessToken
            | ServiceError::RefreshTokenNotFound
            | ServiceError::ReusedToken
            | ServiceError::ExpiredToken
            | ServiceError::SessionHijackSuspected
            | ServiceError::InvalidRefreshSecret => {
                Self::new(StatusCode::UNAUTHORIZED, "unable to refresh session")
            }
            other => other.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<ServiceError> for AppError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::InvalidCredentials
            | ServiceError::InvalidAccessToken
            | ServiceError::RefreshTokenNotFound
            | ServiceError::ReusedToken
            | ServiceError::ExpiredToken
            | ServiceError::SessionHijackSuspected
            | ServiceError::InvalidRefreshSecret => AppError::unauthorized(),
            ServiceError::AccessDenied | ServiceError::NotOwner => AppError::forbidden(),
            ServiceError::UserNotFound => AppError::new(StatusCode::NOT_FOUND, "user not found"),
            ServiceError::NotFound => AppError::not_found(),
            ServiceError::Conflict(message) => AppError::new(StatusCode::CONFLICT, message),
            ServiceError::Validation(message) => AppError::bad_request(message),
            ServiceError::StorageUnavailable(message) => {
                tracing::error!(error = %message, "storage unavailable");
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "service temporarily unavailable")
            }
            ServiceError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}
