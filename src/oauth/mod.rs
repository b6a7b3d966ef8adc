//! OAuth 2.0 authorization and token lifecycle for both providers.
//!
//! Authorization code flow with a loopback redirect:
//! 1. `AuthService::authenticate` starts the provider's callback listener
//! 2. The browser opens the provider's authorize URL
//! 3. The provider redirects to `http://127.0.0.1:{port}/callback?code=...`
//! 4. The code is exchanged for tokens (with the PKCE verifier for Kick)
//! 5. Kick only: channel and chatroom identity are resolved
//! 6. Credentials are persisted and the listener shuts down
//!
//! Every later authenticated call goes through [`RefreshGuard::ensure_valid`].

pub mod bootstrap;
pub mod callback;
pub mod exchange;
pub mod guard;
pub mod pkce;
pub mod provider;

pub use bootstrap::KickBootstrapper;
pub use callback::{AuthorizationCode, CallbackListener, ListenerStart};
pub use exchange::{HttpTokenExchanger, TokenExchanger};
pub use guard::RefreshGuard;
pub use pkce::PkcePair;
pub use provider::{ClientAuth, ProviderConfig};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity providers the application links to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Live chat. PKCE, plus a channel/chatroom bootstrap after login.
    Kick,
    /// Music playback. Confidential client with HTTP Basic client auth.
    Spotify,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Kick, Provider::Spotify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Kick => "kick",
            Provider::Spotify => "spotify",
        }
    }

    /// Human-readable name for notifications and callback pages
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Kick => "Kick",
            Provider::Spotify => "Spotify",
        }
    }

    pub fn uses_pkce(&self) -> bool {
        matches!(self, Provider::Kick)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kick" => Ok(Provider::Kick),
            "spotify" => Ok(Provider::Spotify),
            other => Err(format!(
                "unknown provider '{}' (expected 'kick' or 'spotify')",
                other
            )),
        }
    }
}

/// Failures of the authorization and token lifecycle.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The user has not registered an application with the provider
    #[error("no client credentials configured for {0}")]
    MissingClientCredentials(Provider),

    /// A listener is already bound for this provider; the pending one is reused
    #[error("callback listener for {0} is already active")]
    ListenerAlreadyActive(Provider),

    #[error("callback request did not include an authorization code")]
    MissingCallbackCode,

    /// The provider redirected back with `error=...`
    #[error("authorization denied by provider: {error} ({description})")]
    AuthorizationDenied { error: String, description: String },

    /// Token endpoint rejected the request
    #[error("token endpoint returned {status}: {body}")]
    ExchangeFailed { status: u16, body: String },

    #[error("malformed token response: {0}")]
    MalformedTokenResponse(String),

    #[error("channel lookup failed: {0}")]
    ChannelLookupFailed(String),

    #[error("chatroom lookup failed: {0}")]
    ChatroomLookupFailed(String),

    /// Refresh token rejected or expired; the record has been cleared
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("client credentials rejected: {0}")]
    InvalidClientCredentials(String),

    #[error("{0} is not authenticated")]
    NotAuthenticated(Provider),

    /// Provider API call made with a valid token returned an error status
    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    /// The listener closed without delivering a callback
    #[error("no authorization callback was received")]
    CallbackAbandoned,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Message safe to show in a notification. Never includes response bodies.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::MissingClientCredentials(p) => format!(
                "Add your {} client ID and secret before connecting.",
                p.display_name()
            ),
            AuthError::ListenerAlreadyActive(_) => {
                "An authorization is already in progress.".to_string()
            }
            AuthError::MissingCallbackCode => {
                "Authorization failed: no code was returned. Please try again.".to_string()
            }
            AuthError::AuthorizationDenied { .. } => "Authorization was denied.".to_string(),
            AuthError::ExchangeFailed { status, .. } => format!(
                "The provider rejected the login (HTTP {}). Please try again.",
                status
            ),
            AuthError::MalformedTokenResponse(_) => {
                "The provider returned an unexpected response.".to_string()
            }
            AuthError::ChannelLookupFailed(_) => {
                "Connected, but your channel could not be found.".to_string()
            }
            AuthError::ChatroomLookupFailed(_) => {
                "Connected, but your chatroom could not be found.".to_string()
            }
            AuthError::RefreshFailed(_) => {
                "Your session expired. Please connect again.".to_string()
            }
            AuthError::InvalidClientCredentials(_) => {
                "Invalid client ID or secret.".to_string()
            }
            AuthError::NotAuthenticated(p) => format!("Connect {} first.", p.display_name()),
            AuthError::RequestFailed { status, .. } => {
                format!("The provider returned HTTP {}.", status)
            }
            AuthError::CallbackAbandoned => {
                "Authorization was not completed. Please try again.".to_string()
            }
            AuthError::Http(_) | AuthError::Internal(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}
