use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, decode, Header, EncodingKey, DecodingKey, Validation, Algorithm};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // Account ID
    pub exp: i64,     // Expiration time
    pub iat: i64,     // Issued at
    pub jti: String,  // Unique per issuance
}

impl Claims {
    pub fn account_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken)
    }
}

/// Signs and verifies identity tokens with a process-wide secret.
pub trait TokenIssuer: Send + Sync {
    fn sign(
        &self,
        account_id: Uuid,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, AuthError>;

    /// Checks the signature, then expiry against `now`.
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, AuthError>;
}

/// HS256 JSON Web Tokens.
pub struct JwtIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: {
                // `exp` must be present, but it is compared with the caller's clock
                let mut validation = Validation::new(Algorithm::HS256);
                validation.validate_exp = false;
                validation
            },
        }
    }
}

impl TokenIssuer for JwtIssuer {
    fn sign(
        &self,
        account_id: Uuid,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: account_id.to_string(),
            exp: expires_at.timestamp(),
            iat: issued_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Infrastructure(format!("token signing failed: {}", e)))
    }

    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?
            .claims;

        if now.timestamp() >= claims.exp {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }
}
