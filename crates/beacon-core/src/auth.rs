//! Authentication contract.
//!
//! Connections carry an optional [`Identity`]. Anonymous connections may ping
//! but cannot subscribe.

use thiserror::Error;
use tracing::{debug, warn};

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Subject of the token, usually a username.
    pub subject: String,
}

impl Identity {
    /// Create an identity.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token is malformed or its signature does not verify.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token has expired.
    #[error("Token expired")]
    Expired,

    /// Token is of the wrong kind (e.g. a refresh token).
    #[error("Invalid token type: expected {expected}")]
    WrongTokenType { expected: &'static str },

    /// Token has no subject.
    #[error("Token has no subject")]
    MissingSubject,
}

/// Validates bearer tokens.
pub trait AuthValidator: Send + Sync {
    /// Validate a token and return the identity it carries.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not valid.
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Resolve the identity of a connecting client.
///
/// An absent token yields an anonymous connection. A token that fails
/// validation also yields an anonymous connection unless `strict` is set, in
/// which case the error is returned so the transport can refuse the client.
///
/// # Errors
///
/// Returns the validation error when `strict` is set and the token is invalid.
pub fn admit(
    validator: &dyn AuthValidator,
    token: Option<&str>,
    strict: bool,
) -> Result<Option<Identity>, AuthError> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };

    match validator.validate(token) {
        Ok(identity) => {
            debug!(subject = %identity.subject, "Token accepted");
            Ok(Some(identity))
        }
        Err(e) if strict => Err(e),
        Err(e) => {
            warn!(error = %e, "Token rejected, continuing unauthenticated");
            Ok(None)
        }
    }
}
