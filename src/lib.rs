pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod session;

use std::sync::Arc;
use std::time::Duration;
use actix_web::HttpResponse;
use tracing::info;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::{AuthOptions, AuthService, JwtIssuer, RateLimiter, RateLimitConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use db::{Account, CredentialStore, DbOperations, MemoryCredentialStore};
pub use session::{MemorySessionStore, RedisSessionStore, SessionRegistry, SessionStore};

/// Health check endpoint handler
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth_service: Arc<AuthService>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Time source for rate windows, sessions and token expiry.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Connects Postgres (running migrations) and Redis from `config`.
    pub async fn new(config: Settings) -> Result<Self> {
        let db = DbOperations::new_with_options(
            &config.database.url,
            config.database.max_connections,
            Duration::from_secs(config.database.acquire_timeout_secs),
        )
        .await?;
        db.run_migrations().await?;
        info!("Database connected and migrations applied");

        let sessions = RedisSessionStore::connect(&config.redis.url).await?;
        info!("Session store connected");

        Ok(Self::with_stores(
            config,
            Arc::new(db),
            Arc::new(sessions),
            Arc::new(SystemClock),
        ))
    }

    /// Builds the state over caller-supplied stores and clock.
    pub fn with_stores(
        config: Settings,
        credentials: Arc<dyn CredentialStore>,
        session_store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let auth_service = AuthService::new(
            credentials,
            session_store,
            Arc::new(JwtIssuer::new(&config.auth.jwt_secret)),
            clock.clone(),
            AuthOptions::from(&config.auth),
        );
        let rate_limiter = RateLimiter::new(RateLimitConfig::from(&config.rate_limit));

        Self {
            config: Arc::new(config),
            auth_service: Arc::new(auth_service),
            rate_limiter: Arc::new(rate_limiter),
            clock,
        }
    }
}
