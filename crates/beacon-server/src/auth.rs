//! JWT authentication.
//!
//! Access tokens are HMAC-signed JWTs carrying `sub`, `exp` and
//! `type = "access"`. WebSocket clients pass them as the `token` query
//! parameter; the mutation API expects an `Authorization: Bearer` header.
//! Tokens are obtained from `/api/auth/login` and renewed with a refresh
//! token at `/api/auth/refresh`.

use crate::api::ApiError;
use crate::handlers::AppState;
use anyhow::Context;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts, HeaderMap};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use beacon_core::{AuthError, AuthValidator, Identity};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Token type accepted for connections and API calls.
pub const ACCESS_TOKEN_TYPE: &str = "access";

/// Token type exchanged for new access tokens.
pub const REFRESH_TOKEN_TYPE: &str = "refresh";

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Expiration time (Unix timestamp).
    pub exp: u64,

    /// Token type, `access` or `refresh`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// Validates and issues HMAC-signed JWTs.
pub struct JwtValidator {
    decoding: DecodingKey,
    encoding: EncodingKey,
    algorithm: Algorithm,
    validation: Validation,
}

impl JwtValidator {
    /// Create a validator for a shared secret.
    #[must_use]
    pub fn new(secret: &str, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;

        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            algorithm,
            validation,
        }
    }

    /// Create a validator from a secret and an algorithm name such as `HS256`.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm name is unknown or not HMAC based.
    pub fn from_secret(secret: &str, algorithm: &str) -> anyhow::Result<Self> {
        let algorithm = Algorithm::from_str(algorithm)
            .with_context(|| format!("Unknown JWT algorithm: {algorithm}"))?;
        anyhow::ensure!(
            matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512),
            "Only HMAC algorithms are supported, got {algorithm:?}"
        );
        Ok(Self::new(secret, algorithm))
    }

    /// Issue an access token for `subject`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be signed.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, AuthError> {
        self.issue_typed(subject, ACCESS_TOKEN_TYPE, ttl)
    }

    /// Issue a token of an arbitrary type.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be signed.
    pub fn issue_typed(
        &self,
        subject: &str,
        token_type: &str,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let exp = chrono::Utc::now().timestamp().max(0) as u64 + ttl.as_secs();
        let claims = Claims {
            sub: Some(subject.to_string()),
            exp,
            token_type: Some(token_type.to_string()),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Verify a token of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature, expiry, type or subject is invalid.
    pub fn verify(&self, token: &str, expected: &'static str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if data.claims.token_type.as_deref() != Some(expected) {
            return Err(AuthError::WrongTokenType { expected });
        }

        match data.claims.sub {
            Some(subject) if !subject.is_empty() => Ok(Identity::new(subject)),
            _ => Err(AuthError::MissingSubject),
        }
    }
}

impl AuthValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify(token, ACCESS_TOKEN_TYPE)
    }
}

/// Extract a bearer token from request headers.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Authenticated caller of the mutation API.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".into()))?;
        state
            .validator
            .validate(token)
            .map(AuthUser)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))
    }
}

/// Token pair returned by login and refresh.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

/// Build the token routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/me", get(me))
}

fn token_pair(
    state: &AppState,
    subject: &str,
    refresh_token: Option<String>,
) -> Result<TokenResponse, ApiError> {
    let auth = &state.config.auth;
    let access_token = state
        .validator
        .issue(subject, auth.access_token_ttl())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let refresh_token = match refresh_token {
        Some(token) => token,
        None => state
            .validator
            .issue_typed(subject, REFRESH_TOKEN_TYPE, auth.refresh_token_ttl())
            .map_err(|e| ApiError::Internal(e.to_string()))?,
    };

    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: "bearer".to_string(),
    })
}

async fn login(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let auth = &state.config.auth;
    if form.username != auth.admin_user || form.password != auth.admin_password {
        return Err(ApiError::Unauthorized(
            "Incorrect username or password".into(),
        ));
    }
    token_pair(&state, &form.username, None).map(Json)
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let identity = state
        .validator
        .verify(&request.refresh_token, REFRESH_TOKEN_TYPE)
        .map_err(|_| ApiError::Unauthorized("Invalid refresh token".into()))?;
    token_pair(&state, &identity.subject, Some(request.refresh_token)).map(Json)
}

async fn me(AuthUser(user): AuthUser) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "username": user.subject }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn validator() -> JwtValidator {
        JwtValidator::from_secret("test-secret", "HS256").unwrap()
    }

    #[test]
    fn test_issue_and_validate() {
        let validator = validator();
        let token = validator.issue("admin", Duration::from_secs(60)).unwrap();
        let identity = validator.validate(&token).unwrap();
        assert_eq!(identity.subject, "admin");
    }

    #[test]
    fn test_refresh_token_rejected() {
        let validator = validator();
        let token = validator
            .issue_typed("admin", "refresh", Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            validator.validate(&token),
            Err(AuthError::WrongTokenType { expected: "access" })
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = validator().issue("admin", Duration::from_secs(60)).unwrap();
        let other = JwtValidator::from_secret("other-secret", "HS256").unwrap();
        assert!(matches!(
            other.validate(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let validator = validator();
        let claims = Claims {
            sub: Some("admin".into()),
            exp: 1_000,
            token_type: Some(ACCESS_TOKEN_TYPE.into()),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(validator.validate(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_missing_subject_rejected() {
        let validator = validator();
        let claims = Claims {
            sub: None,
            exp: chrono::Utc::now().timestamp() as u64 + 60,
            token_type: Some(ACCESS_TOKEN_TYPE.into()),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(
            validator.validate(&token),
            Err(AuthError::MissingSubject)
        ));
    }

    #[test]
    fn test_verify_refresh_token() {
        let validator = validator();
        let refresh = validator
            .issue_typed("admin", REFRESH_TOKEN_TYPE, Duration::from_secs(60))
            .unwrap();
        let identity = validator.verify(&refresh, REFRESH_TOKEN_TYPE).unwrap();
        assert_eq!(identity.subject, "admin");

        let access = validator.issue("admin", Duration::from_secs(60)).unwrap();
        assert!(validator.verify(&access, REFRESH_TOKEN_TYPE).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            validator().validate("not.a.jwt"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_unsupported_algorithm() {
        assert!(JwtValidator::from_secret("s", "RS256").is_err());
        assert!(JwtValidator::from_secret("s", "nope").is_err());
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
