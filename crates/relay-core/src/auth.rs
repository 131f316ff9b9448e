//! Authentication seam used by the session gateway.

use async_trait::async_trait;
use thiserror::Error;

use crate::session::Principal;

/// Authentication errors. Any of them refuses the connection.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("Token is required")]
    MissingCredential,

    /// The credential was rejected.
    #[error("Invalid token: {0}")]
    InvalidCredential(String),

    /// The credential has expired.
    #[error("Token expired")]
    Expired,
}

/// Turns a client credential into a [`Principal`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a credential.
    async fn authenticate(&self, credential: &str) -> Result<Principal, AuthError>;
}
