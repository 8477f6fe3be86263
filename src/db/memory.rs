use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::Account;
use crate::db::operations::CredentialStore;
use crate::error::DatabaseError;

/// In-process `CredentialStore` for tests and local runs without Postgres.
#[derive(Default, Clone)]
pub struct MemoryCredentialStore {
    accounts: Arc<RwLock<HashMap<String, Account>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError> {
        Ok(self.accounts.read().await.get(email).cloned())
    }

    async fn insert(&self, email: &str, password_hash: &str) -> Result<Uuid, DatabaseError> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(email) {
            return Err(DatabaseError::Duplicate);
        }

        let account = Account::new(email.to_string(), password_hash.to_string());
        let id = account.id;
        accounts.insert(email.to_string(), account);
        Ok(id)
    }
}
