//! Access token handling
//!
//! The login endpoint returns a bearer JWT whose `sub` claim is the numeric
//! user id. The signature is the server's business; the client only reads
//! the payload to learn who it is.

use crate::models::UserId;
use crate::{ChatError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Signed-in identity. Persisted so a restart skips the login step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
}

impl Credentials {
    /// Build credentials from a freshly issued access token.
    pub fn from_token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let user_id = user_id_from_token(&token)?;
        Ok(Self { token, user_id })
    }
}

#[derive(Deserialize)]
struct Claims {
    sub: serde_json::Value,
}

/// Extract the user id from the `sub` claim of a JWT.
pub fn user_id_from_token(token: &str) -> Result<UserId> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return Err(ChatError::InvalidToken("expected three segments".to_string())),
    };

    // Some issuers keep the padding; the no-pad engine rejects it
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ChatError::InvalidToken(e.to_string()))?;
    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|e| ChatError::InvalidToken(e.to_string()))?;

    match claims.sub {
        serde_json::Value::String(s) => s
            .trim()
            .parse::<UserId>()
            .map_err(|_| ChatError::InvalidToken(format!("non-numeric sub {s:?}"))),
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ChatError::InvalidToken(format!("sub out of range: {n}"))),
        other => Err(ChatError::InvalidToken(format!("unexpected sub {other}"))),
    }
}

#[cfg(test)]
pub(crate) fn test_token(sub: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":{sub},"exp":4102444800}}"#));
    format!("{header}.{payload}.signature")
}
