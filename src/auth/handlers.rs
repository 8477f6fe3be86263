use actix_web::{web, HttpResponse, HttpRequest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::AppState;
use crate::error::{AppError, AuthError};
use tracing::{info, warn};

pub const REGISTER_ROUTE: &str = "/auth/register";
pub const LOGIN_ROUTE: &str = "/auth/login";
pub const SESSION_ROUTE: &str = "/auth/session";

/// bcrypt only looks at the first 72 bytes; longer passwords are refused
/// rather than silently truncated.
const MAX_PASSWORD_BYTES: usize = 72;
const MAX_EMAIL_LEN: usize = 254;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    fn parse(body: &[u8]) -> Result<Self, AppError> {
        let credentials: Credentials = serde_json::from_slice(body)
            .map_err(|_| AppError::ValidationError("Invalid request body".into()))?;

        let email = credentials.email.trim();
        if email.is_empty() || email.len() > MAX_EMAIL_LEN || !email.contains('@') {
            return Err(AppError::ValidationError("Invalid email".into()));
        }
        if credentials.password.is_empty() || credentials.password.len() > MAX_PASSWORD_BYTES {
            return Err(AppError::ValidationError("Invalid password".into()));
        }

        Ok(Self {
            email: email.to_string(),
            password: credentials.password,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub account_id: Uuid,
}

/// Client identity: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
/// The headers are ignored unless `trust_proxy_headers` is set.
pub fn client_identity(req: &HttpRequest, trust_proxy_headers: bool) -> String {
    if !trust_proxy_headers {
        return peer_identity(req);
    }

    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(forwarded) = header("X-Forwarded-For") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty()) {
            return first.to_string();
        }
    }

    if let Some(real_ip) = header("X-Real-IP") {
        return real_ip.to_string();
    }

    peer_identity(req)
}

fn peer_identity(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Counts the request against `route` + `identity`; a denial never reaches the auth service.
async fn rate_gate(state: &AppState, route: &str, identity: &str) -> Result<(), AppError> {
    let key = format!("{}:{}", route, identity);
    if !state.rate_limiter.allow(&key, state.clock.now()).await {
        warn!("Rate limit hit on {} for {}", route, identity);
        return Err(AuthError::RateLimited.into());
    }
    Ok(())
}

pub async fn register(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let identity = client_identity(&req, state.config.server.trust_proxy_headers);
    rate_gate(&state, REGISTER_ROUTE, &identity).await?;

    let credentials = Credentials::parse(&body)?;
    info!("Received registration request from {}", identity);

    let token = state
        .auth_service
        .register(&identity, &credentials.email, &credentials.password)
        .await?;

    Ok(HttpResponse::Created().json(AuthResponse { token }))
}

pub async fn login(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let identity = client_identity(&req, state.config.server.trust_proxy_headers);
    rate_gate(&state, LOGIN_ROUTE, &identity).await?;

    let credentials = Credentials::parse(&body)?;
    info!("Received login request from {}", identity);

    match state
        .auth_service
        .login(&identity, &credentials.email, &credentials.password)
        .await
    {
        Ok(token) => Ok(HttpResponse::Ok().json(AuthResponse { token })),
        Err(e) => {
            warn!("Login from {} failed: {}", identity, e);
            Err(e.into())
        }
    }
}

pub async fn session(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let token = req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AuthError::InvalidToken)?;

    let identity = client_identity(&req, state.config.server.trust_proxy_headers);
    let account_id = state.auth_service.validate_token(&identity, token).await?;

    Ok(HttpResponse::Ok().json(SessionResponse { account_id }))
}

pub async fn whoami(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let identity = client_identity(&req, state.config.server.trust_proxy_headers);
    HttpResponse::Ok().body(format!("Your IP is: {}\n", identity))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(whoami))
        .route("/health", web::get().to(crate::health_check))
        .route(REGISTER_ROUTE, web::post().to(register))
        .route(LOGIN_ROUTE, web::post().to(login))
        .route(SESSION_ROUTE, web::get().to(session));
}
