use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::DatabaseError(DatabaseError::QueryError(err.to_string()))
    }
}

impl AppError {
    /// Message safe to hand to a client. Store and internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::AuthError(AuthError::Infrastructure(_))
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_)
            | AppError::InternalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": self.public_message()
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
                AuthError::EmailTaken => StatusCode::CONFLICT,
                AuthError::SessionConflict { .. } => StatusCode::CONFLICT,
                AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                AuthError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                AuthError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures surfaced by the register/login/validate operations.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Unknown email and wrong password are deliberately indistinguishable.
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Email is already registered")]
    EmailTaken,

    /// `holder` is the identity that owns the live session. It is kept for
    /// logging and is never part of the display text.
    #[error("Account is active on another device")]
    SessionConflict { holder: String },

    #[error("Rate limited")]
    RateLimited,

    #[error("Store deadline exceeded")]
    Timeout,

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Invalid token")]
    InvalidToken,
}

impl From<DatabaseError> for AuthError {
    fn from(err: DatabaseError) -> Self {
        AuthError::Infrastructure(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Duplicate record")]
    Duplicate,

    #[error("Conditional write lost to a concurrent writer")]
    Contention,
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => DatabaseError::Duplicate,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for DatabaseError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            DatabaseError::ConnectionError(err.to_string())
        } else {
            DatabaseError::QueryError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Encoding(err.to_string())
    }
}
