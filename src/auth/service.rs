use chrono::Duration;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::password::{hash_password, verify_password};
use crate::auth::token::TokenIssuer;
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::db::operations::CredentialStore;
use crate::error::{AuthError, DatabaseError};
use crate::session::{BindOutcome, SessionRegistry, SessionStore};

/// Lifetimes and limits for the auth flows.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub token_expiry: Duration,
    pub session_ttl: Duration,
    /// Deadline applied to every credential-store and session-store call.
    pub store_timeout: std::time::Duration,
    pub bcrypt_cost: u32,
}

impl From<&AuthConfig> for AuthOptions {
    fn from(config: &AuthConfig) -> Self {
        Self {
            token_expiry: config.token_expiry(),
            session_ttl: config.session_ttl(),
            store_timeout: config.store_timeout(),
            bcrypt_cost: config.bcrypt_cost,
        }
    }
}

/// Register and login flows with single-session enforcement.
///
/// Operations on different accounts share no lock. Dropping a returned future
/// abandons whatever store call is in flight.
pub struct AuthService {
    credentials: Arc<dyn CredentialStore>,
    sessions: SessionRegistry,
    tokens: Arc<dyn TokenIssuer>,
    clock: Arc<dyn Clock>,
    options: AuthOptions,
}

impl AuthService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        session_store: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenIssuer>,
        clock: Arc<dyn Clock>,
        options: AuthOptions,
    ) -> Self {
        Self {
            credentials,
            sessions: SessionRegistry::new(session_store, options.session_ttl),
            tokens,
            clock,
            options,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Creates an account for `email` and binds its first session to `identity`.
    pub async fn register(&self, identity: &str, email: &str, password: &str) -> Result<String, AuthError> {
        let existing = self
            .with_deadline("lookup", self.credentials.lookup_by_email(email))
            .await?;
        if existing.is_some() {
            info!("Registration refused, email already registered");
            return Err(AuthError::EmailTaken);
        }

        let password_hash = hash_password(password, self.options.bcrypt_cost).await?;

        // A concurrent registration of the same email surfaces here as EmailTaken
        let account_id = self
            .with_deadline("insert", self.credentials.insert(email, &password_hash))
            .await?;

        let token = self.issue_and_bind(account_id, identity).await?;
        info!("Registered account {} from {}", account_id, identity);
        Ok(token)
    }

    /// Verifies credentials and binds a fresh token to `identity`.
    ///
    /// Fails with `SessionConflict` while another identity holds an unexpired
    /// session; in that case no token leaves this function.
    pub async fn login(&self, identity: &str, email: &str, password: &str) -> Result<String, AuthError> {
        let account = self
            .with_deadline("lookup", self.credentials.lookup_by_email(email))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password, &account.password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }

        // Refuse before signing when the answer is already known
        let now = self.clock.now();
        let current = self
            .with_deadline("session read", self.sessions.current(account.id, now))
            .await?;
        if let Some(current) = current {
            if current.identity != identity {
                warn!("Login for account {} from {} refused, session held elsewhere", account.id, identity);
                return Err(AuthError::SessionConflict { holder: current.identity });
            }
        }

        let token = self.issue_and_bind(account.id, identity).await?;
        info!("Login for account {} from {}", account.id, identity);
        Ok(token)
    }

    /// Resolves `token` to its account if it is the live session token and
    /// `identity` is the identity it is bound to. Token and session expiry
    /// are both judged by the injected clock.
    pub async fn validate_token(&self, identity: &str, token: &str) -> Result<Uuid, AuthError> {
        let now = self.clock.now();
        let claims = self.tokens.verify(token, now)?;
        let account_id = claims.account_id()?;

        let current = self
            .with_deadline("session read", self.sessions.current(account_id, now))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if current.token != token || current.identity != identity {
            return Err(AuthError::InvalidToken);
        }
        Ok(account_id)
    }

    async fn issue_and_bind(&self, account_id: Uuid, identity: &str) -> Result<String, AuthError> {
        let now = self.clock.now();
        let token = self.tokens.sign(account_id, now, now + self.options.token_expiry)?;

        match self
            .with_deadline("session bind", self.sessions.bind(account_id, identity, &token, now))
            .await?
        {
            BindOutcome::Accepted => Ok(token),
            BindOutcome::Conflict { holder } => {
                warn!("Session bind for account {} from {} lost to another device", account_id, identity);
                Err(AuthError::SessionConflict { holder })
            }
        }
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, call: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, DatabaseError>>,
    {
        match tokio::time::timeout(self.options.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            // Only account insertion reports duplicates
            Ok(Err(DatabaseError::Duplicate)) => Err(AuthError::EmailTaken),
            Ok(Err(e)) => {
                error!("Store {} failed: {}", operation, e);
                Err(e.into())
            }
            Err(_) => {
                warn!("Store {} exceeded {:?}", operation, self.options.store_timeout);
                Err(AuthError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::JwtIssuer;
    use crate::clock::ManualClock;
    use crate::db::memory::MemoryCredentialStore;
    use crate::db::models::Account;
    use crate::db::operations::MockCredentialStore;
    use crate::session::{MemorySessionStore, SessionRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn options() -> AuthOptions {
        AuthOptions {
            token_expiry: Duration::hours(15),
            session_ttl: Duration::hours(24),
            store_timeout: std::time::Duration::from_millis(100),
            bcrypt_cost: crate::auth::password::MIN_BCRYPT_COST,
        }
    }

    fn service_with(
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<dyn SessionStore>,
        clock: &ManualClock,
    ) -> AuthService {
        AuthService::new(
            credentials,
            sessions,
            Arc::new(JwtIssuer::new("test_secret")),
            Arc::new(clock.clone()),
            options(),
        )
    }

    fn service(clock: &ManualClock) -> (AuthService, MemorySessionStore) {
        let sessions = MemorySessionStore::new(Arc::new(clock.clone()));
        let service = service_with(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(sessions.clone()),
            clock,
        );
        (service, sessions)
    }

    fn account_with_password(password: &str) -> Account {
        Account::new(
            "a@x.com".into(),
            bcrypt::hash(password, crate::auth::password::MIN_BCRYPT_COST).unwrap(),
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_email_and_wrong_password_look_alike() {
        let clock = ManualClock::default();
        let sessions = Arc::new(MemorySessionStore::new(Arc::new(clock.clone())));

        let mut missing = MockCredentialStore::new();
        missing.expect_lookup_by_email().returning(|_| Ok(None));
        let unknown = service_with(Arc::new(missing), sessions.clone(), &clock)
            .login("1.2.3.4", "a@x.com", "pw")
            .await
            .unwrap_err();

        let account = account_with_password("pw");
        let mut present = MockCredentialStore::new();
        present
            .expect_lookup_by_email()
            .returning(move |_| Ok(Some(account.clone())));
        let wrong = service_with(Arc::new(present), sessions.clone(), &clock)
            .login("1.2.3.4", "a@x.com", "not-pw")
            .await
            .unwrap_err();

        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert_eq!(sessions.live_entries().await, 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_infrastructure() {
        let clock = ManualClock::default();
        let mut credentials = MockCredentialStore::new();
        credentials
            .expect_lookup_by_email()
            .returning(|_| Err(DatabaseError::ConnectionError("refused".into())));
        let service = service_with(
            Arc::new(credentials),
            Arc::new(MemorySessionStore::new(Arc::new(clock.clone()))),
            &clock,
        );

        let err = service.login("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn test_register_existing_email_inserts_nothing() {
        let clock = ManualClock::default();
        let sessions = MemorySessionStore::new(Arc::new(clock.clone()));
        let account = account_with_password("pw");

        let mut credentials = MockCredentialStore::new();
        credentials
            .expect_lookup_by_email()
            .returning(move |_| Ok(Some(account.clone())));
        credentials.expect_insert().times(0);
        let service = service_with(Arc::new(credentials), Arc::new(sessions.clone()), &clock);

        let err = service.register("1.2.3.4", "a@x.com", "pw2").await.unwrap_err();
        assert!(matches!(err, AuthError::EmailTaken));
        assert_eq!(sessions.live_entries().await, 0);
    }

    #[tokio::test]
    async fn test_register_losing_insert_race_is_conflict() {
        let clock = ManualClock::default();
        let sessions = MemorySessionStore::new(Arc::new(clock.clone()));

        let mut credentials = MockCredentialStore::new();
        credentials.expect_lookup_by_email().returning(|_| Ok(None));
        credentials
            .expect_insert()
            .times(1)
            .returning(|_, _| Err(DatabaseError::Duplicate));
        let service = service_with(Arc::new(credentials), Arc::new(sessions.clone()), &clock);

        let err = service.register("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::EmailTaken));
        assert_eq!(sessions.live_entries().await, 0);
    }

    struct SlowCredentialStore;

    #[async_trait]
    impl CredentialStore for SlowCredentialStore {
        async fn lookup_by_email(&self, _email: &str) -> Result<Option<Account>, DatabaseError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn insert(&self, _email: &str, _password_hash: &str) -> Result<Uuid, DatabaseError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(Uuid::new_v4())
        }
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let clock = ManualClock::default();
        let service = service_with(
            Arc::new(SlowCredentialStore),
            Arc::new(MemorySessionStore::new(Arc::new(clock.clone()))),
            &clock,
        );

        let started = std::time::Instant::now();
        let err = service.login("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        let err = service.register("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
    }

    /// Session store whose reads or writes stall past any deadline.
    struct SlowSessionStore {
        inner: MemorySessionStore,
        slow_reads: bool,
    }

    #[async_trait]
    impl SessionStore for SlowSessionStore {
        async fn get(&self, key: &str) -> Result<Option<SessionRecord>, DatabaseError> {
            if self.slow_reads {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
            self.inner.get(key).await
        }

        async fn conditional_set(
            &self,
            key: &str,
            expected_identity: Option<&str>,
            record: &SessionRecord,
            ttl: Duration,
        ) -> Result<bool, DatabaseError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            self.inner.conditional_set(key, expected_identity, record, ttl).await
        }
    }

    #[tokio::test]
    async fn test_slow_session_read_times_out() {
        let clock = ManualClock::default();
        let store = SlowSessionStore {
            inner: MemorySessionStore::new(Arc::new(clock.clone())),
            slow_reads: true,
        };
        let service = service_with(Arc::new(MemoryCredentialStore::new()), Arc::new(store), &clock);

        let started = std::time::Instant::now();
        let err = service.register("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        let err = service.login("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
    }

    #[tokio::test]
    async fn test_slow_session_write_times_out_without_binding() {
        let clock = ManualClock::default();
        let inner = MemorySessionStore::new(Arc::new(clock.clone()));
        let store = SlowSessionStore {
            inner: inner.clone(),
            slow_reads: false,
        };
        let service = service_with(Arc::new(MemoryCredentialStore::new()), Arc::new(store), &clock);

        let err = service.register("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
        assert_eq!(inner.live_entries().await, 0);
    }

    /// Marks whether a lookup ran to completion or was dropped mid-call.
    struct TrackedCredentialStore {
        completed: Arc<AtomicBool>,
        abandoned: Arc<AtomicBool>,
    }

    struct AbandonGuard(Arc<AtomicBool>);

    impl Drop for AbandonGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CredentialStore for TrackedCredentialStore {
        async fn lookup_by_email(&self, _email: &str) -> Result<Option<Account>, DatabaseError> {
            let guard = AbandonGuard(self.abandoned.clone());
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            std::mem::forget(guard);
            self.completed.store(true, Ordering::SeqCst);
            Ok(None)
        }

        async fn insert(&self, _email: &str, _password_hash: &str) -> Result<Uuid, DatabaseError> {
            Ok(Uuid::new_v4())
        }
    }

    #[tokio::test]
    async fn test_dropped_login_abandons_store_call() {
        let clock = ManualClock::default();
        let completed = Arc::new(AtomicBool::new(false));
        let abandoned = Arc::new(AtomicBool::new(false));
        let store = TrackedCredentialStore {
            completed: completed.clone(),
            abandoned: abandoned.clone(),
        };
        let service = service_with(
            Arc::new(store),
            Arc::new(MemorySessionStore::new(Arc::new(clock.clone()))),
            &clock,
        );

        // Caller gives up well before the store deadline
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            service.login("1.2.3.4", "a@x.com", "pw"),
        )
        .await;

        assert!(outcome.is_err());
        assert!(abandoned.load(Ordering::SeqCst));
        assert!(!completed.load(Ordering::SeqCst));
    }

    struct UnreachableSessionStore;

    #[async_trait]
    impl SessionStore for UnreachableSessionStore {
        async fn get(&self, _key: &str) -> Result<Option<SessionRecord>, DatabaseError> {
            Err(DatabaseError::ConnectionError("connection refused".into()))
        }

        async fn conditional_set(
            &self,
            _key: &str,
            _expected_identity: Option<&str>,
            _record: &SessionRecord,
            _ttl: Duration,
        ) -> Result<bool, DatabaseError> {
            Err(DatabaseError::ConnectionError("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_session_store_failure_returns_no_token() {
        let clock = ManualClock::default();
        let service = service_with(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(UnreachableSessionStore),
            &clock,
        );

        let err = service.register("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn test_register_binds_first_session() {
        let clock = ManualClock::default();
        let (service, _) = service(&clock);

        let token = service.register("1.2.3.4", "u1@x.com", "pw").await.unwrap();
        let account_id = service.validate_token("1.2.3.4", &token).await.unwrap();

        let current = service.sessions().current(account_id, clock.now()).await.unwrap().unwrap();
        assert_eq!(current.identity, "1.2.3.4");
        assert_eq!(current.token, token);
    }

    #[tokio::test]
    async fn test_login_from_other_identity_conflicts() {
        let clock = ManualClock::default();
        let (service, _) = service(&clock);

        let t1 = service.login_after_register("1.2.3.4").await;
        let account_id = service.validate_token("1.2.3.4", &t1).await.unwrap();
        let before = service.sessions().current(account_id, clock.now()).await.unwrap();

        let err = service.login("9.9.9.9", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::SessionConflict { ref holder } if holder == "1.2.3.4"));
        assert_eq!(service.sessions().current(account_id, clock.now()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_relogin_from_same_identity_replaces_token() {
        let clock = ManualClock::default();
        let (service, _) = service(&clock);

        let t1 = service.login_after_register("1.2.3.4").await;
        let t2 = service.login("1.2.3.4", "a@x.com", "pw").await.unwrap();
        assert_ne!(t1, t2);

        let account_id = service.validate_token("1.2.3.4", &t2).await.unwrap();
        assert!(matches!(
            service.validate_token("1.2.3.4", &t1).await,
            Err(AuthError::InvalidToken)
        ));
        let current = service.sessions().current(account_id, clock.now()).await.unwrap().unwrap();
        assert_eq!(current.identity, "1.2.3.4");
    }

    #[tokio::test]
    async fn test_other_identity_can_login_after_ttl() {
        let clock = ManualClock::default();
        let (service, _) = service(&clock);

        service.login_after_register("1.2.3.4").await;
        clock.advance(Duration::hours(23));
        assert!(service.login("9.9.9.9", "a@x.com", "pw").await.is_err());

        clock.advance(Duration::hours(1));
        let token = service.login("9.9.9.9", "a@x.com", "pw").await.unwrap();
        let account_id = service.validate_token("9.9.9.9", &token).await.unwrap();
        let current = service.sessions().current(account_id, clock.now()).await.unwrap().unwrap();
        assert_eq!(current.identity, "9.9.9.9");
    }

    #[tokio::test]
    async fn test_token_not_accepted_from_other_identity() {
        let clock = ManualClock::default();
        let (service, _) = service(&clock);

        let token = service.login_after_register("1.2.3.4").await;
        assert!(matches!(
            service.validate_token("9.9.9.9", &token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    /// Another device binds between the conflict pre-check and the bind.
    struct LateBindingStore {
        inner: MemorySessionStore,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for LateBindingStore {
        async fn get(&self, key: &str) -> Result<Option<SessionRecord>, DatabaseError> {
            self.inner.get(key).await
        }

        async fn conditional_set(
            &self,
            key: &str,
            expected_identity: Option<&str>,
            record: &SessionRecord,
            ttl: Duration,
        ) -> Result<bool, DatabaseError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut theirs = record.clone();
                theirs.identity = "9.9.9.9".into();
                theirs.token = "theirs".into();
                self.inner.conditional_set(key, None, &theirs, ttl).await?;
            }
            self.inner.conditional_set(key, expected_identity, record, ttl).await
        }
    }

    #[tokio::test]
    async fn test_bind_lost_after_signing_discards_token() {
        let clock = ManualClock::default();
        let store = Arc::new(LateBindingStore {
            inner: MemorySessionStore::new(Arc::new(clock.clone())),
            writes: AtomicUsize::new(0),
        });
        let service = service_with(Arc::new(MemoryCredentialStore::new()), store.clone(), &clock);

        let err = service.register("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::SessionConflict { .. }));

        // The account exists, and its one session is the other device's
        let err = service.login("1.2.3.4", "a@x.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::SessionConflict { ref holder } if holder == "9.9.9.9"));
    }

    #[tokio::test]
    async fn test_token_expiry_follows_injected_clock() {
        let clock = ManualClock::default();
        let (service, _) = service(&clock);
        let token = service.login_after_register("1.2.3.4").await;

        clock.advance(Duration::hours(15) - Duration::seconds(1));
        assert!(service.validate_token("1.2.3.4", &token).await.is_ok());

        // Session is still live for another 9 hours, the token is not
        clock.advance(Duration::seconds(1));
        assert!(matches!(
            service.validate_token("1.2.3.4", &token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    impl AuthService {
        async fn login_after_register(&self, identity: &str) -> String {
            self.register(identity, "a@x.com", "pw").await.unwrap();
            self.login(identity, "a@x.com", "pw").await.unwrap()
        }
    }
}
