use crate::ca::Curve;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("CA certificate is expired")]
    CaExpired,

    #[error("Curve of public key does not match CA curve: got {actual}, want {expected}")]
    IncompatibleKey { expected: Curve, actual: Curve },

    #[error("Network not initialized")]
    NotInitialized,

    #[error("Network already initialized with {cidr}; re-initialization requires force")]
    AlreadyInitialized { cidr: String },

    #[error("Stored network {stored} does not match configured network {configured}; re-initialization requires force")]
    NetworkMismatch { stored: String, configured: String },

    #[error("Network exhausted: next address {next} is outside {cidr} or is its broadcast address")]
    Exhausted { next: String, cidr: String },

    #[error("Token not found or already used")]
    TokenNotFound,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error rejects a presented token. Not-found and expired
    /// are only told apart in logs.
    pub fn is_token_rejection(&self) -> bool {
        matches!(self, Self::TokenNotFound | Self::TokenExpired | Self::Unauthorized)
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convert AppError to HTTP status codes for web responses
impl AppError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CaExpired => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IncompatibleKey { .. } => StatusCode::FORBIDDEN,
            Self::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            Self::AlreadyInitialized { .. } => StatusCode::CONFLICT,
            Self::NetworkMismatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::TokenNotFound => StatusCode::UNAUTHORIZED,
            Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to an unauthenticated caller.
    pub fn public_message(&self) -> String {
        match self {
            Self::TokenNotFound | Self::TokenExpired | Self::Unauthorized => {
                "unauthorized".to_string()
            }
            Self::Forbidden => "forbidden".to_string(),
            Self::Config(_)
            | Self::Store(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Integrity(_)
            | Self::CaExpired
            | Self::NetworkMismatch { .. }
            | Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = serde_json::json!({
            "error": self.public_message(),
            "code": status.as_u16()
        });
        (status, axum::Json(body)).into_response()
    }
}
