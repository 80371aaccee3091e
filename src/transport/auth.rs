//! Identity resolution.
//!
//! Connections present a JWT (HS256) whose `sub` claim is the user id, either
//! during the handshake (`?token=` or a `session` cookie) or later with an
//! `AUTH` frame.

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tungstenite::handshake::server::Request;

use crate::utils::error::AuthError;
use crate::utils::ids::UserId;

const SESSION_COOKIE: &str = "session";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Maps a presented credential to the user it belongs to.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<UserId, AuthError>;
}

pub struct JwtResolver {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Sign a token for `user`, valid for `ttl`.
    pub fn issue(&self, user: &str, ttl: Duration) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user.to_string(),
            exp: (Utc::now() + ttl).timestamp().max(0) as usize,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }
}

impl IdentityResolver for JwtResolver {
    fn resolve(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims.sub)
    }
}

impl std::fmt::Debug for JwtResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtResolver").finish_non_exhaustive()
    }
}

/// Credential presented in the upgrade request: the `token` query parameter,
/// else the `session` cookie.
pub fn handshake_token(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    });
    if from_query.is_some() {
        return from_query;
    }

    req.headers()
        .get_all(tungstenite::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_string)
        })
}
