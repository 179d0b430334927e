//! Two independent trust domains: end-user sessions (HS256 bearer tokens whose
//! subject is the owner id) and the shared worker secret that gates batch
//! processing.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::OwnerId;

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: usize,
}

/// Places a worker secret may be presented, highest precedence first.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerCredentials<'a> {
    pub header: Option<&'a str>,
    pub body: Option<&'a str>,
    pub query: Option<&'a str>,
}

impl<'a> WorkerCredentials<'a> {
    pub fn presented(&self) -> Option<&'a str> {
        self.header.or(self.body).or(self.query)
    }
}

pub struct AuthBoundary {
    worker_secret: String,
    session_key: DecodingKey,
    validation: Validation,
}

impl AuthBoundary {
    pub fn new(worker_secret: &str, session_secret: &str) -> Self {
        AuthBoundary {
            worker_secret: worker_secret.to_string(),
            session_key: DecodingKey::from_secret(session_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn authorize_worker(&self, credentials: WorkerCredentials<'_>) -> Result<(), AuthError> {
        let presented = credentials.presented().ok_or(AuthError::MissingCredential)?;
        if self.worker_secret.is_empty() || !secrets_match(self.worker_secret.as_bytes(), presented.as_bytes()) {
            return Err(AuthError::InvalidCredential);
        }
        Ok(())
    }

    pub fn authorize_session(&self, headers: &HeaderMap) -> Result<OwnerId, AuthError> {
        let token = extract_bearer(headers).ok_or(AuthError::MissingCredential)?;
        let data = decode::<SessionClaims>(token, &self.session_key, &self.validation)
            .map_err(|e| AuthError::InvalidSession(e.to_string()))?;

        let sub = data.claims.sub.trim();
        if sub.is_empty() {
            return Err(AuthError::InvalidSession("empty subject".into()));
        }
        Ok(OwnerId(sub.to_string()))
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let token = headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim();

    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Compares every byte of `expected` regardless of where the first mismatch is.
fn secrets_match(expected: &[u8], presented: &[u8]) -> bool {
    let mut diff = expected.len() ^ presented.len();
    for (i, byte) in expected.iter().enumerate() {
        let other = presented.get(i).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }
    diff == 0
}
