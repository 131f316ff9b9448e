//! JWT session authentication.
//!
//! Tokens are HS256-signed with the configured secret. The subject may be
//! carried as `sub` or as `id`.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tenvis_relay_core::{AuthError, Authenticator, Principal};

use crate::config::AuthConfig;

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    #[serde(alias = "id")]
    pub sub: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
    /// Issued at (Unix timestamp).
    #[serde(default)]
    pub iat: u64,
}

/// Validates and issues session tokens.
#[derive(Clone)]
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl_secs: u64,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl JwtAuthenticator {
    /// Create an authenticator from configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            token_ttl_secs: config.token_ttl_secs,
        }
    }

    /// Issue a token for a subject.
    ///
    /// # Errors
    ///
    /// Returns an error if token encoding fails.
    pub fn issue(&self, subject: &str, username: Option<&str>) -> Result<String, AuthError> {
        let now = unix_now();
        let claims = Claims {
            sub: subject.to_string(),
            username: username.map(str::to_string),
            exp: now + self.token_ttl_secs,
            iat: now,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::InvalidCredential(format!("Failed to issue token: {e}")))
    }

    /// Validate a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Expired`] for expired tokens and
    /// [`AuthError::InvalidCredential`] for anything else that fails.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential(e.to_string()),
            })
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Principal, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let claims = self.validate(credential)?;
        let principal = Principal::new(claims.sub);
        Ok(match claims.username {
            Some(name) => principal.with_name(name),
            None => principal,
        })
    }
}

/// Extracts the bearer token from an Authorization header value.
#[must_use]
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> JwtAuthenticator {
        JwtAuthenticator::new(&AuthConfig {
            jwt_secret: "test-secret-key-for-testing".to_string(),
            token_ttl_secs: 3600,
        })
    }

    #[tokio::test]
    async fn test_issue_and_authenticate() {
        let auth = authenticator();
        let token = auth.issue("user123", Some("alice")).unwrap();

        let principal = auth.authenticate(&token).await.unwrap();
        assert_eq!(principal.subject, "user123");
        assert_eq!(principal.name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_id_claim_alias() {
        let auth = authenticator();
        let claims = serde_json::json!({"id": "abc", "username": "bob", "exp": unix_now() + 60});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key-for-testing"),
        )
        .unwrap();

        let principal = auth.authenticate(&token).await.unwrap();
        assert_eq!(principal.subject, "abc");
    }

    #[tokio::test]
    async fn test_rejected_tokens() {
        let auth = authenticator();

        assert!(matches!(
            auth.authenticate("").await,
            Err(AuthError::MissingCredential)
        ));
        assert!(matches!(
            auth.authenticate("invalid-token").await,
            Err(AuthError::InvalidCredential(_))
        ));

        let other = JwtAuthenticator::new(&AuthConfig {
            jwt_secret: "another-secret".to_string(),
            token_ttl_secs: 3600,
        });
        let foreign = other.issue("user123", None).unwrap();
        assert!(matches!(
            auth.authenticate(&foreign).await,
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let auth = authenticator();
        let claims = Claims {
            sub: "user123".to_string(),
            username: None,
            exp: unix_now() - 3600,
            iat: unix_now() - 7200,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key-for-testing"),
        )
        .unwrap();

        assert!(matches!(
            auth.authenticate(&token).await,
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer_token("bearer xyz789"), Some("xyz789"));
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc123"), None);
        assert_eq!(extract_bearer_token("abc123"), None);
    }
}
