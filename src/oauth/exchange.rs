//! OAuth token exchange logic.
//!
//! Turns an authorization code or a refresh token into a [`TokenSet`] by
//! POSTing a form to the provider's token endpoint.

use super::{AuthError, ClientAuth, ProviderConfig};
use crate::credentials::{ClientCredentials, TokenSet};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::debug;

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECONDS: i64 = 3600;

/// Longer lifetimes are treated as this (one year).
const MAX_EXPIRES_IN_SECONDS: i64 = 365 * 24 * 3600;

/// Token endpoint response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    /// Converts `expires_in` to an absolute instant.
    ///
    /// `previous_refresh` is used when the provider did not rotate the refresh token.
    fn into_token_set(self, previous_refresh: Option<&str>) -> Result<TokenSet, AuthError> {
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))
            .ok_or_else(|| {
                AuthError::MalformedTokenResponse("response did not include a refresh_token".to_string())
            })?;

        let expires_in = self
            .expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECONDS)
            .clamp(0, MAX_EXPIRES_IN_SECONDS);
        let expires_at = Duration::try_seconds(expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::MalformedTokenResponse(format!("expires_in out of range: {}", expires_in))
            })?;

        Ok(TokenSet {
            access_token: self.access_token,
            refresh_token,
            expires_at,
        })
    }
}

/// Token endpoint operations for one provider.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchanges an authorization code. `code_verifier` is sent for PKCE providers.
    async fn exchange_code(
        &self,
        client: &ClientCredentials,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenSet, AuthError>;

    /// Obtains a new access token. A response without `refresh_token` keeps the old one.
    async fn refresh(
        &self,
        client: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenSet, AuthError>;

    /// Checks client credentials before they are saved.
    async fn validate_client(&self, _client: &ClientCredentials) -> Result<(), AuthError> {
        Ok(())
    }
}

/// [`TokenExchanger`] that talks to a real token endpoint.
pub struct HttpTokenExchanger {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl HttpTokenExchanger {
    pub fn new(http: reqwest::Client, config: ProviderConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn post_token(
        &self,
        client: &ClientCredentials,
        mut form: Vec<(&'static str, String)>,
    ) -> Result<TokenResponse, AuthError> {
        let mut request = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json");

        match self.config.client_auth {
            ClientAuth::RequestBody => {
                form.push(("client_id", client.client_id.clone()));
                form.push(("client_secret", client.client_secret.clone()));
            }
            ClientAuth::BasicHeader => {
                request = request.basic_auth(&client.client_id, Some(&client.client_secret));
            }
        }

        let grant_type = form
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        debug!(
            provider = %self.config.provider,
            grant_type = %grant_type,
            endpoint = %self.config.token_url,
            "Requesting token"
        );

        let response = request.form(&form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(AuthError::ExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| AuthError::MalformedTokenResponse(e.to_string()))
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange_code(
        &self,
        client: &ClientCredentials,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenSet, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_uri()),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier.to_string()));
        }

        let response = self.post_token(client, form).await?;
        debug!(
            provider = %self.config.provider,
            has_refresh_token = response.refresh_token.is_some(),
            expires_in = ?response.expires_in,
            "Authorization code exchanged"
        );
        response.into_token_set(None)
    }

    async fn refresh(
        &self,
        client: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenSet, AuthError> {
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];

        let response = self.post_token(client, form).await?;
        debug!(
            provider = %self.config.provider,
            rotated = response.refresh_token.is_some(),
            "Access token refreshed"
        );
        response.into_token_set(Some(refresh_token))
    }

    async fn validate_client(&self, client: &ClientCredentials) -> Result<(), AuthError> {
        if self.config.client_auth != ClientAuth::BasicHeader {
            return Ok(());
        }

        // A client_credentials grant succeeds only for a valid id/secret pair
        let form = vec![("grant_type", "client_credentials".to_string())];
        match self.post_token(client, form).await {
            Ok(_) => Ok(()),
            Err(AuthError::ExchangeFailed { status, body }) => Err(
                AuthError::InvalidClientCredentials(format!("HTTP {}: {}", status, body)),
            ),
            Err(e) => Err(e),
        }
    }
}
