//! Bearer-token authentication and role gates.
//!
//! Access tokens are HS256 JWTs minted by the identity provider with
//! `ACCESS_TOKEN_SECRET`. The user id is carried in the `_id` claim and `exp`
//! is enforced with no leeway. A token is read from `Authorization: Bearer ...`
//! or, failing that, the `accessToken` cookie. The user must exist in the
//! `users` table.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::api::ApiState;
use crate::db;
use crate::errors::{AppError, Result};
use crate::models::{Role, User};

const COOKIE_NAME: &str = "accessToken";

/// The claims this service reads. Anything else in the token is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "_id")]
    pub id: String,
    pub exp: i64,
}

fn unauthorized(why: &str) -> AppError {
    AppError::Unauthorized(why.to_string())
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
    #[cfg(test)]
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
            #[cfg(test)]
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Mint a token the way the identity provider does.
    #[cfg(test)]
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        use jsonwebtoken::{EncodingKey, Header};

        jsonwebtoken::encode(&Header::default(), claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|e| AppError::Internal(format!("token signing: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        match jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => {
                Err(unauthorized("Access token expired"))
            }
            Err(_) => Err(unauthorized("Invalid access token")),
        }
    }
}

fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, value)| value.to_string())
}

/// The caller, resolved from their token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    /// Allow-list gate for a route.
    pub fn require(self, roles: &[Role]) -> Result<User> {
        if roles.contains(&self.0.role) {
            Ok(self.0)
        } else {
            Err(AppError::Forbidden("Access Denied".to_string()))
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<ApiState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<ApiState>) -> Result<Self> {
        let token = token_from_headers(&parts.headers)
            .ok_or_else(|| unauthorized("Unauthorized request"))?;
        let claims = state.tokens.verify(&token)?;

        let mut conn = state.coordinator.pool.acquire().await?;
        let user = db::find_user(&mut conn, &claims.id)
            .await?
            .ok_or_else(|| unauthorized("Invalid access token"))?;
        Ok(AuthUser(user))
    }
}
