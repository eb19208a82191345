use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::types::{Identity, Role};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("empty credential")]
    Empty,
    #[error("invalid credential: {0}")]
    Invalid(String),
}

/// Claims the client reads from a session token. The signature is checked by
/// the server during the channel handshake, never here.
#[derive(Debug, Deserialize)]
struct SessionClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "_id")]
    object_id: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

pub fn identity_from_token(token: &str) -> Result<Identity, AuthError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Empty);
    }

    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Invalid("malformed JWT".into()));
    }

    let payload_bytes = base64_url_decode(parts[1])
        .map_err(|e| AuthError::Invalid(format!("base64 decode error: {e}")))?;

    let claims: SessionClaims = serde_json::from_slice(&payload_bytes)
        .map_err(|e| AuthError::Invalid(format!("invalid JSON payload: {e}")))?;

    let subject_id = claims
        .sub
        .or(claims.id)
        .or(claims.object_id)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::Invalid("missing subject claim".into()))?;

    Ok(Identity::new(
        &subject_id,
        match claims.role.as_deref() {
            Some("admin") => Role::Admin,
            _ => Role::Customer,
        },
        token,
    ))
}

fn base64_url_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| e.to_string())
}

/// Session store publishing the current identity. Consumers observe changes
/// through [`SessionStore::subscribe`].
#[derive(Clone)]
pub struct SessionStore {
    tx: watch::Sender<Option<Identity>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn login(&self, token: &str) -> Result<Identity, AuthError> {
        let identity = identity_from_token(token)?;
        self.set(Some(identity.clone()));
        Ok(identity)
    }

    pub fn logout(&self) {
        self.set(None);
    }

    pub fn set(&self, identity: Option<Identity>) {
        self.tx.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            match &identity {
                Some(id) => info!(subject_id = %id.subject_id, role = ?id.role, "session identity set"),
                None => info!("session identity cleared"),
            }
            *current = identity;
            true
        });
    }

    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
pub(crate) fn test_token(claims: serde_json::Value) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}
