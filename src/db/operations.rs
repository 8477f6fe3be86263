use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::db::models::Account;
use crate::error::DatabaseError;

/// Persistent account storage keyed by email.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when no account uses `email`.
    async fn lookup_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError>;

    /// Fails with `DatabaseError::Duplicate` when `email` is taken.
    async fn insert(&self, email: &str, password_hash: &str) -> Result<Uuid, DatabaseError>;
}

/// Postgres-backed `CredentialStore`.
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await
    }
}

#[async_trait]
impl CredentialStore for DbOperations {
    async fn lookup_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(account)
    }

    async fn insert(&self, email: &str, password_hash: &str) -> Result<Uuid, DatabaseError> {
        let account = Account::new(email.to_string(), password_hash.to_string());

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO users (id, email, password_hash, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(account.id)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(account.created_at)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(id)
    }
}
