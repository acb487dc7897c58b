//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs handled by `jsonwebtoken`. Only the claims the
//! dispatch core needs are read: the principal id (`sub`), its role and the
//! expiry, checked without leeway.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Secret;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("unsupported token algorithm")]
    UnsupportedAlgorithm,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                AuthError::UnsupportedAlgorithm
            }
            _ => AuthError::Malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Restaurant,
    Courier,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: i64,
}

impl Claims {
    pub fn new(sub: Uuid, role: Role, ttl: chrono::Duration) -> Self {
        Self {
            sub,
            role,
            exp: (Utc::now() + ttl).timestamp(),
        }
    }
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtKeys {
    pub fn new(secret: Secret<String>) -> Self {
        let bytes = secret.reveal().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            validation,
        }
    }

    pub fn sign(&self, claims: &Claims) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .expect("HS256 signing of serializable claims")
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}

/// The authenticated principal of a request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn id(&self) -> Uuid {
        self.0.sub
    }

    pub fn role(&self) -> Role {
        self.0.role
    }

    /// Passes for the restaurant itself or an admin.
    pub fn require_restaurant(&self, restaurant_id: Uuid) -> Result<(), AppError> {
        self.require(Role::Restaurant, restaurant_id)
    }

    /// Passes for the courier itself or an admin.
    pub fn require_courier(&self, courier_id: Uuid) -> Result<(), AppError> {
        self.require(Role::Courier, courier_id)
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        match self.0.role {
            Role::Admin => Ok(()),
            _ => Err(AppError::Forbidden("admin role required".to_string())),
        }
    }

    fn require(&self, role: Role, owner: Uuid) -> Result<(), AppError> {
        match self.0.role {
            Role::Admin => Ok(()),
            r if r == role && self.0.sub == owner => Ok(()),
            r if r == role => Err(AppError::Forbidden("not the resource owner".to_string())),
            _ => Err(AppError::Forbidden(format!("{role:?} role required"))),
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::Missing)?;

        Ok(AuthUser(state.jwt.verify(token)?))
    }
}
