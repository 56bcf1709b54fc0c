use anyhow::{Context, Result};
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::{CaseId, Role};

pub const SESSION_COOKIE: &str = "mh_session";

pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Session claims: the case the session is bound to and the viewer's role.
/// The role never travels in request bodies; it only ever comes from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub case_id: CaseId,
    pub role: Role,
    pub exp: i64,
}

pub fn mint_session(
    keys: &SessionKeys,
    case_id: &CaseId,
    role: Role,
    ttl: Duration,
) -> Result<String> {
    let claims = SessionClaims {
        case_id: case_id.clone(),
        role,
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(&Header::default(), &claims, &keys.encoding).context("failed to sign session token")
}

pub fn verify_session(keys: &SessionKeys, token: &str) -> Option<SessionClaims> {
    decode::<SessionClaims>(token, &keys.decoding, &Validation::default())
        .map(|data| data.claims)
        .ok()
}

pub fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax")
}

/// Session token from the cookie, falling back to a bearer header.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(cookies) = headers.get(axum::http::header::COOKIE) {
        if let Ok(cookies) = cookies.to_str() {
            for pair in cookies.split(';') {
                let pair = pair.trim();
                if let Some(value) = pair.strip_prefix(&format!("{SESSION_COOKIE}=")) {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
}
