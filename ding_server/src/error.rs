//! Error kinds that cross the API boundary.
//!
//! User errors carry a precise message. Server errors are logged with full
//! detail and redacted in responses unless `show_errors` is configured.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

static SHOW_ERRORS: AtomicBool = AtomicBool::new(false);

/// Enable or disable server error detail in API responses.
pub fn set_show_errors(show: bool) {
    SHOW_ERRORS.store(show, Ordering::Relaxed);
}

pub fn show_errors() -> bool {
    SHOW_ERRORS.load(Ordering::Relaxed)
}

#[derive(Error, Debug)]
pub enum DingError {
    #[error("bad password")]
    BadAuth,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    User(String),

    #[error("{0}")]
    Server(String),
}

pub type Result<T, E = DingError> = std::result::Result<T, E>;

impl DingError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    /// Wire code, as returned in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadAuth => "user:badAuth",
            Self::NotFound(_) => "user:notFound",
            Self::User(_) => "user:error",
            Self::Server(_) => "server:error",
        }
    }

    pub fn is_user(&self) -> bool {
        !matches!(self, Self::Server(_))
    }

    /// Message safe to show to API clients and to store on a build.
    pub fn public_message(&self) -> String {
        match self {
            Self::Server(_) if !show_errors() => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadAuth => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::User(_) => StatusCode::BAD_REQUEST,
            Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<diesel::result::Error> for DingError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => Self::NotFound("not found".to_string()),
            e => Self::Server(format!("database: {e}")),
        }
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for DingError {
    fn from(e: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        Self::Server(format!("database pool: {e}"))
    }
}

impl From<std::io::Error> for DingError {
    fn from(e: std::io::Error) -> Self {
        Self::Server(format!("io: {e}"))
    }
}

/// Attach context to a failure that is the server's fault.
pub trait ServerContext<T> {
    fn server_context(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ServerContext<T> for std::result::Result<T, E> {
    fn server_context(self, context: &str) -> Result<T> {
        self.map_err(|e| DingError::Server(format!("{context}: {e}")))
    }
}

/// Attach context to a failure caused by user input or a user's build script.
pub trait UserContext<T> {
    fn user_context(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> UserContext<T> for std::result::Result<T, E> {
    fn user_context(self, context: &str) -> Result<T> {
        self.map_err(|e| DingError::User(format!("{context}: {e}")))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for DingError {
    fn into_response(self) -> Response {
        if let Self::Server(message) = &self {
            tracing::error!(error = %message, "request failed with server error");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.public_message(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_redaction() {
        assert_eq!(DingError::BadAuth.code(), "user:badAuth");
        assert_eq!(DingError::not_found("x").code(), "user:notFound");
        assert_eq!(DingError::user("x").code(), "user:error");

        let e = DingError::server("disk on fire");
        assert_eq!(e.code(), "server:error");
        set_show_errors(false);
        assert_eq!(e.public_message(), "internal server error");
        assert_eq!(DingError::user("bad line").public_message(), "bad line");
    }

    #[test]
    fn diesel_not_found_maps_to_user_not_found() {
        let e: DingError = diesel::result::Error::NotFound.into();
        assert!(matches!(e, DingError::NotFound(_)));
        assert!(e.is_user());
    }
}
