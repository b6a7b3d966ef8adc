//! Persistent credential records for both providers.
//!
//! Everything lives in one document that is loaded fully at startup and
//! rewritten fully on every mutation:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - one CredentialRecord per provider     │
//! │  - one ClientCredentials per provider    │
//! │  - mutations serialised by a Mutex       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)    optional, AES-256-GCM
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       JSON document on disk              │
//! │  - written to a temp file, then renamed  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - A record holds both `access_token` and `refresh_token`, or neither.
//!   Anything else is treated as "not authenticated".
//! - `expires_at` is an absolute instant.
//! - `code_verifier` only exists between opening an authorize URL and
//!   receiving the callback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod storage;

pub use encryption::{decrypt, encrypt, validate_key, SealedDocument};
pub use storage::CredentialStore;

/// Access/refresh token pair returned by a token endpoint.
///
/// `expires_at` is already converted from the provider's `expires_in`.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Chat identity resolved after a Kick authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: String,
    pub username: String,
    pub chatroom_id: String,
}

/// Per-provider user credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatroom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

impl CredentialRecord {
    /// Both tokens present.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some()
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns the stored token set, or `None` for partial/absent tokens.
    ///
    /// A missing `expires_at` is reported as already expired so the refresh
    /// path runs.
    pub fn token_set(&self) -> Option<TokenSet> {
        match (&self.access_token, &self.refresh_token) {
            (Some(access), Some(refresh)) => Some(TokenSet {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
                expires_at: self.expires_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            }),
            _ => None,
        }
    }

    /// Replaces the token fields. Identity and verifier are untouched.
    pub fn apply_tokens(&mut self, tokens: &TokenSet) {
        self.access_token = Some(tokens.access_token.clone());
        self.refresh_token = Some(tokens.refresh_token.clone());
        self.expires_at = Some(tokens.expires_at);
    }

    /// Writes all three identity fields together.
    pub fn set_identity(&mut self, identity: &SessionIdentity) {
        self.user_id = Some(identity.user_id.clone());
        self.username = Some(identity.username.clone());
        self.chatroom_id = Some(identity.chatroom_id.clone());
    }

    pub fn clear_identity(&mut self) {
        self.user_id = None;
        self.username = None;
        self.chatroom_id = None;
    }

    /// Drops partial token state loaded from disk.
    pub(crate) fn normalize(&mut self) {
        if !self.is_authenticated() {
            self.access_token = None;
            self.refresh_token = None;
            self.expires_at = None;
        }
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("chatroom_id", &self.chatroom_id)
            .field("has_code_verifier", &self.code_verifier.is_some())
            .finish()
    }
}

/// Application-level OAuth client registered by the user with a provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}
