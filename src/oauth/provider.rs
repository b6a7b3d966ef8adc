//! Per-provider OAuth endpoints and authorize URL construction.

use super::Provider;
use crate::config::AppConfig;
use serde::{Deserialize, Serialize};

/// Path the loopback listener serves and the redirect URI points at.
pub const CALLBACK_PATH: &str = "/callback";

/// How the client id/secret reach the token endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientAuth {
    /// `client_id` and `client_secret` as form fields
    RequestBody,
    /// `Authorization: Basic base64(client_id:client_secret)`
    BasicHeader,
}

/// OAuth provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: Provider,

    /// OAuth authorization endpoint URL
    pub authorize_url: String,

    /// OAuth token endpoint URL
    pub token_url: String,

    /// Requested scopes
    pub scopes: Vec<String>,

    /// Fixed loopback port for the redirect
    pub callback_port: u16,

    pub client_auth: ClientAuth,
}

impl ProviderConfig {
    /// Builds the configuration for `provider` from the app config.
    pub fn for_provider(provider: Provider, config: &AppConfig) -> Self {
        match provider {
            Provider::Kick => Self {
                provider,
                authorize_url: config.kick.authorize_url.clone(),
                token_url: config.kick.token_url.clone(),
                scopes: config.kick.scopes.clone(),
                callback_port: config.kick.callback_port,
                client_auth: ClientAuth::RequestBody,
            },
            Provider::Spotify => Self {
                provider,
                authorize_url: config.spotify.authorize_url.clone(),
                token_url: config.spotify.token_url.clone(),
                scopes: config.spotify.scopes.clone(),
                callback_port: config.spotify.callback_port,
                client_auth: ClientAuth::BasicHeader,
            },
        }
    }

    /// Redirect URI registered with the provider
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.callback_port, CALLBACK_PATH)
    }

    /// Build authorization URL with state, redirect_uri and an optional PKCE challenge
    pub fn build_auth_url(&self, client_id: &str, state: &str, code_challenge: Option<&str>) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.authorize_url,
            urlencoding::encode(client_id),
            urlencoding::encode(&self.redirect_uri()),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        if let Some(challenge) = code_challenge {
            url.push_str("&code_challenge=");
            url.push_str(&urlencoding::encode(challenge));
            url.push_str("&code_challenge_method=S256");
        }
        url
    }
}
