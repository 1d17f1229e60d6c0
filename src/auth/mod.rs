//! Token issuance and verification.
//!
//! Two token audiences share one signing secret: `USER` tokens authenticate
//! API sessions, `PAYMENT` tokens authorize the confirmation of exactly one
//! payment and expire much sooner. The type tag in the claims keeps one
//! audience's tokens out of the other's endpoints.

use crate::config::AppConfig;
use crate::errors::ServiceError;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Claim structure for issued tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Token audience tag
    pub typ: TokenType,
    /// Target payment, present on `PAYMENT` tokens only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<i64>,
    /// Unique identifier for this token
    pub jti: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiration (unix seconds)
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenType {
    User,
    Payment,
}

/// Verified claims of a payment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTokenClaims {
    pub user_id: i64,
    pub payment_id: i64,
}

/// Authenticated caller identity, always passed explicitly into service
/// operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: i64,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn new(user_id: i64, roles: Vec<String>) -> Self {
        Self { user_id, roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("ADMIN")
    }
}

/// Issues and verifies the signed tokens used by the API.
#[derive(Debug, Clone)]
pub struct TokenService {
    secret: String,
    user_token_ttl: Duration,
    payment_token_ttl: Duration,
}

impl TokenService {
    pub fn new(
        secret: impl Into<String>,
        user_token_ttl: Duration,
        payment_token_ttl: Duration,
    ) -> Self {
        Self {
            secret: secret.into(),
            user_token_ttl,
            payment_token_ttl,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.jwt_secret.clone(),
            Duration::from_secs(config.jwt_expiration_secs),
            Duration::from_secs(config.payment_token_expiration_secs),
        )
    }

    /// Lifetime of freshly issued payment tokens.
    pub fn payment_token_ttl(&self) -> Duration {
        self.payment_token_ttl
    }

    /// Issues a session token for a user.
    pub fn issue_user_token(&self, user_id: i64) -> Result<String, ServiceError> {
        self.issue(user_id, TokenType::User, None, self.user_token_ttl)
    }

    /// Issues a short-lived token scoped to one payment of one user.
    pub fn issue_payment_token(
        &self,
        user_id: i64,
        payment_id: i64,
    ) -> Result<String, ServiceError> {
        self.issue(
            user_id,
            TokenType::Payment,
            Some(payment_id),
            self.payment_token_ttl,
        )
    }

    fn issue(
        &self,
        user_id: i64,
        typ: TokenType,
        payment_id: Option<i64>,
        ttl: Duration,
    ) -> Result<String, ServiceError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            typ,
            payment_id,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ServiceError::InternalError(format!("token creation failed: {}", e)))
    }

    /// Verifies signature and expiry, returning the decoded claims.
    pub fn verify(&self, token: &str) -> Result<Claims, ServiceError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ServiceError::InvalidToken("token has expired".to_string())
            }
            _ => ServiceError::InvalidToken("token verification failed".to_string()),
        })?;

        Ok(data.claims)
    }

    /// Verifies a payment token: signature, expiry, the `PAYMENT` type tag,
    /// and a present payment id.
    pub fn verify_payment_token(&self, token: &str) -> Result<PaymentTokenClaims, ServiceError> {
        let claims = self.verify(token)?;

        if claims.typ != TokenType::Payment {
            return Err(ServiceError::InvalidToken(
                "not a payment token".to_string(),
            ));
        }

        let payment_id = claims.payment_id.ok_or_else(|| {
            ServiceError::InvalidToken("payment token carries no payment id".to_string())
        })?;

        let user_id = claims.sub.parse::<i64>().map_err(|_| {
            ServiceError::InvalidToken("payment token subject is malformed".to_string())
        })?;

        Ok(PaymentTokenClaims {
            user_id,
            payment_id,
        })
    }
}
