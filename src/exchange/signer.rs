use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::models::AccountCredential;

type HmacSha256 = Hmac<Sha256>;

/// Path signed for the streaming authentication challenge.
pub const WS_AUTH_PATH: &str = "/live";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("HMAC computation failed: {0}")]
    HmacError(String),
}

/// Canonical string signed for every request:
/// `{method}{timestamp}{path}{query}{body}`.
///
/// `query` must carry its leading `?` when non-empty.
pub fn canonical_message(method: &str, timestamp: &str, path: &str, query: &str, body: &str) -> String {
    format!("{method}{timestamp}{path}{query}{body}")
}

/// Hex-encoded HMAC-SHA256 of `message` keyed by `secret`.
pub fn sign_message(secret: &str, message: &str) -> Result<String, SignerError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignerError::HmacError(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Current unix time in whole seconds, as sent in the `timestamp` header.
pub fn unix_timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}

/// Signs requests on behalf of one account.
#[derive(Debug, Clone, Copy)]
pub struct RequestSigner<'a> {
    credential: &'a AccountCredential,
}

impl<'a> RequestSigner<'a> {
    pub fn new(credential: &'a AccountCredential) -> Self {
        Self { credential }
    }

    pub fn api_key(&self) -> &str {
        &self.credential.api_key
    }

    /// Signature for a REST call.
    pub fn sign(
        &self,
        method: &str,
        timestamp: &str,
        path: &str,
        query: &str,
        body: &str,
    ) -> Result<String, SignerError> {
        let message = canonical_message(method, timestamp, path, query, body);
        sign_message(&self.credential.api_secret, &message)
    }

    /// Signature for the WebSocket auth challenge: `GET` + timestamp + `/live`.
    pub fn sign_ws_challenge(&self, timestamp: &str) -> Result<String, SignerError> {
        self.sign("GET", timestamp, WS_AUTH_PATH, "", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_message_matches_reference_vector() {
        let sig = sign_message("key", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn canonical_message_concatenates_in_order() {
        let msg = canonical_message("POST", "1700000000", "/v2/orders", "?page=1", "{\"a\":1}");
        assert_eq!(msg, "POST1700000000/v2/orders?page=1{\"a\":1}");
    }

    #[test]
    fn ws_challenge_signs_get_live() {
        let cred = AccountCredential::new("l1", "Leader", "key", "secret");
        let signer = RequestSigner::new(&cred);
        let expected = sign_message("secret", "GET1700000000/live").unwrap();
        assert_eq!(signer.sign_ws_challenge("1700000000").unwrap(), expected);
        // 32 bytes hex-encoded
        assert_eq!(expected.len(), 64);
    }

    #[test]
    fn different_secrets_give_different_signatures() {
        let a = sign_message("secret-a", "GET1/live").unwrap();
        let b = sign_message("secret-b", "GET1/live").unwrap();
        assert_ne!(a, b);
    }
}
