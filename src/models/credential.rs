use std::fmt;

use serde::Deserialize;
use sqlx::FromRow;

/// Exchange API credentials for one account (leader or follower).
///
/// Loaded from the `accounts` table; the relay only ever holds a read-only
/// copy for the lifetime of a monitoring session.
#[derive(Clone, Deserialize, FromRow)]
pub struct AccountCredential {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl AccountCredential {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// First characters of the API key, safe to log.
    pub fn key_hint(&self) -> &str {
        &self.api_key[..6.min(self.api_key.len())]
    }
}

impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("api_key", &format_args!("{}...", self.key_hint()))
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_secret() {
        let cred = AccountCredential::new("acc-1", "Leader", "abcdef123456", "topsecret");
        let dbg = format!("{cred:?}");
        assert!(!dbg.contains("topsecret"));
        assert!(!dbg.contains("abcdef123456"));
        assert!(dbg.contains("abcdef..."));
    }
}
