//! # JWT Verification
//!
//! Tokens are issued by the user service and signed with a shared HS256 secret.
//! The gateway only verifies; it never mints tokens outside of tests.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::core::config::AuthConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Claims carried by user-service tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,

    #[serde(default)]
    pub role: String,

    /// Expiry, seconds since the Unix epoch
    pub exp: u64,
}

/// Identity established for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub role: String,
}

impl From<Claims> for AuthContext {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.user_id.to_string(),
            role: claims.role,
        }
    }
}

/// Verifies a bearer credential
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> GatewayResult<AuthContext>;
}

/// HS256 verifier for user-service tokens
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Build from the auth section; the secret must be present once env indirection is applied
    pub fn from_config(config: &AuthConfig) -> GatewayResult<Self> {
        let secret = config
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::config("auth.jwt_secret is required when auth is enabled"))?;
        Ok(Self::new(secret.as_bytes()))
    }

    /// Decode and verify signature and expiry
    pub fn verify(&self, token: &str) -> GatewayResult<Claims> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

/// Accepts `Bearer <token>` (any case) or a bare token
fn strip_bearer(credential: &str) -> &str {
    let credential = credential.trim();
    match credential.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => credential,
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &str) -> GatewayResult<AuthContext> {
        let token = strip_bearer(credential);
        if token.is_empty() {
            return Err(GatewayError::auth("missing token"));
        }
        Ok(self.verify(token)?.into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) const SECRET: &[u8] = b"test-secret";

    pub(crate) fn token(secret: &[u8], user_id: i64, expires_in: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = Claims {
            user_id,
            role: "user".to_string(),
            exp: (now + expires_in) as u64,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let auth = JwtAuthenticator::new(SECRET);
        let ctx = auth
            .authenticate(&format!("Bearer {}", token(SECRET, 42, 3600)))
            .await
            .unwrap();
        assert_eq!(ctx.user_id, "42");
        assert_eq!(ctx.role, "user");

        // Bare tokens are accepted too
        assert!(auth.authenticate(&token(SECRET, 7, 3600)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_expired_and_forged_tokens() {
        let auth = JwtAuthenticator::new(SECRET);

        let expired = auth.authenticate(&token(SECRET, 42, -60)).await.unwrap_err();
        assert!(matches!(expired, GatewayError::Jwt { .. }));

        let forged = auth
            .authenticate(&token(b"other-secret", 42, 3600))
            .await
            .unwrap_err();
        assert_eq!(forged.status_code(), axum::http::StatusCode::UNAUTHORIZED);

        assert!(auth.authenticate("Bearer ").await.is_err());
        assert!(auth.authenticate("Bearer not.a.jwt").await.is_err());
    }

    #[test]
    fn test_from_config_requires_secret() {
        let mut config = AuthConfig::default();
        config.enabled = true;
        assert!(JwtAuthenticator::from_config(&config).is_err());

        config.jwt_secret = Some("s3cret".to_string());
        assert!(JwtAuthenticator::from_config(&config).is_ok());
    }
}
