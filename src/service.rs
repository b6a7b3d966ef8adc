//! Entry points for the presentation layer.
//!
//! [`AuthService`] is the only surface the UI calls:
//! `authenticate`, `logout`, `check_authenticated`, `has_client_credentials`
//! and `set_client_credentials`. Flow outcomes arrive asynchronously as
//! [`AuthNotification`]s; raw errors are logged and never shown.

use crate::config::AppConfig;
use crate::credentials::{ClientCredentials, CredentialRecord, CredentialStore};
use crate::lock;
use crate::oauth::callback::CallbackResult;
use crate::oauth::{
    AuthError, CallbackListener, HttpTokenExchanger, KickBootstrapper, PkcePair,
    Provider, ProviderConfig, RefreshGuard, TokenExchanger,
};
use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const NOTIFICATION_CAPACITY: usize = 32;

/// Opens the authorize URL for the user.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> anyhow::Result<()>;
}

/// Default browser of the desktop session.
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> anyhow::Result<()> {
        webbrowser::open(url).context("Failed to open browser")
    }
}

/// Outcome events for the presentation layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthNotification {
    Authenticated {
        provider: Provider,
        username: Option<String>,
    },
    Failed {
        provider: Provider,
        message: String,
    },
    LoggedOut {
        provider: Provider,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SetClientResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SetClientResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// Returned by [`AuthService::authenticate`] once the browser step is underway.
#[derive(Clone, Debug)]
pub struct AuthorizationStarted {
    pub authorize_url: String,
    /// A listener from an earlier attempt was still waiting and handles this one
    pub listener_reused: bool,
}

struct ServiceInner {
    store: Arc<CredentialStore>,
    guard: RefreshGuard,
    http: reqwest::Client,
    providers: HashMap<Provider, ProviderConfig>,
    exchangers: HashMap<Provider, Arc<dyn TokenExchanger>>,
    listeners: HashMap<Provider, CallbackListener>,
    bootstrapper: KickBootstrapper,
    opener: Arc<dyn UrlOpener>,
    /// CSRF state of the latest authorize URL per provider
    pending_state: Mutex<HashMap<Provider, String>>,
    notifications: broadcast::Sender<AuthNotification>,
}

/// Account linking service shared by the UI and the CLI. Cheap to clone.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<ServiceInner>,
}

fn registered<'a, T>(
    map: &'a HashMap<Provider, T>,
    provider: Provider,
    what: &str,
) -> Result<&'a T, AuthError> {
    map.get(&provider)
        .ok_or_else(|| AuthError::Internal(anyhow!("no {} registered for {}", what, provider)))
}

impl AuthService {
    pub fn new(
        config: &AppConfig,
        store: Arc<CredentialStore>,
        opener: Arc<dyn UrlOpener>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        let callback_timeout = config.auth.callback_timeout_seconds.map(Duration::from_secs);
        if let Some(limit) = callback_timeout {
            info!(timeout_secs = limit.as_secs(), "Callback listeners close after timeout");
        }

        let mut providers = HashMap::new();
        let mut exchangers: HashMap<Provider, Arc<dyn TokenExchanger>> = HashMap::new();
        let mut listeners = HashMap::new();
        for provider in Provider::ALL {
            let provider_config = ProviderConfig::for_provider(provider, config);
            listeners.insert(
                provider,
                CallbackListener::new(provider, provider_config.callback_port, callback_timeout),
            );
            exchangers.insert(
                provider,
                Arc::new(HttpTokenExchanger::new(http.clone(), provider_config.clone())),
            );
            providers.insert(provider, provider_config);
        }

        let guard = RefreshGuard::new(
            Arc::clone(&store),
            exchangers.clone(),
            config.auth.refresh_margin_seconds,
        );
        let bootstrapper = KickBootstrapper::new(http.clone(), &config.kick);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Self {
            inner: Arc::new(ServiceInner {
                store,
                guard,
                http,
                providers,
                exchangers,
                listeners,
                bootstrapper,
                opener,
                pending_state: Mutex::new(HashMap::new()),
                notifications,
            }),
        })
    }

    /// Receives notifications published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    /// Handle for authenticated provider API calls.
    pub fn authorized_client(&self) -> AuthorizedClient {
        AuthorizedClient {
            inner: Arc::clone(&self.inner),
        }
    }

    fn notify(&self, notification: AuthNotification) {
        // No subscribers is fine
        let _ = self.inner.notifications.send(notification);
    }

    /// Starts the authorization code flow for `provider`.
    ///
    /// Returns once the listener is bound and the browser was asked to open the
    /// authorize URL; the rest of the flow finishes in the background and is
    /// reported through [`subscribe`](Self::subscribe). Failures to start are
    /// reported there too.
    pub async fn authenticate(&self, provider: Provider) -> Result<AuthorizationStarted, AuthError> {
        match self.start_authorization(provider).await {
            Ok(started) => Ok(started),
            Err(e) => {
                error!(provider = %provider, error = %e, "Could not start authorization");
                self.notify(AuthNotification::Failed {
                    provider,
                    message: e.user_message(),
                });
                Err(e)
            }
        }
    }

    async fn start_authorization(
        &self,
        provider: Provider,
    ) -> Result<AuthorizationStarted, AuthError> {
        let inner = &self.inner;
        let client = inner
            .store
            .client(provider)
            .ok_or(AuthError::MissingClientCredentials(provider))?;
        let provider_config = registered(&inner.providers, provider, "provider config")?;
        let listener = registered(&inner.listeners, provider, "callback listener")?;

        let listener_reused = match listener.start().await?.into_started(provider) {
            Ok((addr, outcome)) => {
                debug!(provider = %provider, addr = %addr, "Waiting for authorization callback");
                let service = self.clone();
                tokio::spawn(async move { service.await_callback(provider, outcome).await });
                false
            }
            Err(reason) => {
                // The pending listener serves this attempt too
                debug!(provider = %provider, reason = %reason, "Reusing active callback listener");
                true
            }
        };

        // A newer attempt replaces any outstanding verifier and state
        let pkce = provider.uses_pkce().then(PkcePair::generate);
        if let Some(pkce) = &pkce {
            inner
                .store
                .update(provider, |record| record.code_verifier = Some(pkce.verifier.clone()))?;
        }
        let state = Uuid::new_v4().to_string();
        lock(&inner.pending_state).insert(provider, state.clone());

        let authorize_url = provider_config.build_auth_url(
            &client.client_id,
            &state,
            pkce.as_ref().map(|p| p.challenge.as_str()),
        );

        if let Err(e) = inner.opener.open(&authorize_url) {
            warn!(
                provider = %provider,
                error = %e,
                url = %authorize_url,
                "Could not open browser, open the URL manually"
            );
        }

        info!(provider = %provider, listener_reused, "Authorization started");
        Ok(AuthorizationStarted {
            authorize_url,
            listener_reused,
        })
    }

    async fn await_callback(self, provider: Provider, outcome: oneshot::Receiver<CallbackResult>) {
        let callback = outcome.await.unwrap_or(Err(AuthError::CallbackAbandoned));

        match self.complete_authorization(provider, callback).await {
            Ok(username) => {
                info!(provider = %provider, username = ?username, "Authorization completed");
                self.notify(AuthNotification::Authenticated { provider, username });
            }
            Err(e) => {
                error!(provider = %provider, error = %e, "Authorization failed");
                self.notify(AuthNotification::Failed {
                    provider,
                    message: e.user_message(),
                });
            }
        }
    }

    /// Exchange → bootstrap (Kick) → persist. Returns the resolved username.
    async fn complete_authorization(
        &self,
        provider: Provider,
        callback: CallbackResult,
    ) -> Result<Option<String>, AuthError> {
        let inner = &self.inner;

        // Single use, cleared whatever happens next
        let verifier = inner.store.take_code_verifier(provider)?;
        let expected_state = lock(&inner.pending_state).remove(&provider);

        let callback = callback?;

        if expected_state.is_none() || expected_state != callback.state {
            warn!(
                provider = %provider,
                "Callback state does not match the latest authorization request, accepting it"
            );
        }
        if provider.uses_pkce() && verifier.is_none() {
            warn!(provider = %provider, "No PKCE verifier outstanding for callback");
        }

        let client = inner
            .store
            .client(provider)
            .ok_or(AuthError::MissingClientCredentials(provider))?;
        let exchanger = registered(&inner.exchangers, provider, "token exchanger")?;

        let tokens = exchanger
            .exchange_code(&client, &callback.code, verifier.as_deref())
            .await?;

        if provider != Provider::Kick {
            inner.store.update(provider, |record| record.apply_tokens(&tokens))?;
            return Ok(None);
        }

        match inner.bootstrapper.bootstrap(&tokens.access_token).await {
            Ok(identity) => {
                inner.store.update(provider, |record| {
                    record.apply_tokens(&tokens);
                    record.set_identity(&identity);
                })?;
                Ok(Some(identity.username))
            }
            Err(e) => {
                // Tokens are valid on their own; identity stays absent
                inner.store.update(provider, |record| {
                    record.apply_tokens(&tokens);
                    record.clear_identity();
                })?;
                Err(e)
            }
        }
    }

    /// Clears every field of the provider's record, cached identity included.
    pub fn logout(&self, provider: Provider) -> Result<(), AuthError> {
        self.inner.store.clear(provider)?;
        lock(&self.inner.pending_state).remove(&provider);
        info!(provider = %provider, "Logged out");
        self.notify(AuthNotification::LoggedOut { provider });
        Ok(())
    }

    /// Goes through the refresh guard, so an expired token is refreshed (or
    /// the record cleared) before answering.
    pub async fn check_authenticated(&self, provider: Provider) -> AuthStatus {
        if !self.inner.guard.ensure_valid(provider).await {
            return AuthStatus {
                authenticated: false,
                username: None,
            };
        }
        AuthStatus {
            authenticated: true,
            username: self.inner.store.record(provider).username,
        }
    }

    pub fn has_client_credentials(&self, provider: Provider) -> bool {
        self.inner.store.client(provider).is_some()
    }

    /// Client id only; the secret is never handed back out.
    pub fn client_id(&self, provider: Provider) -> Option<String> {
        self.inner.store.client(provider).map(|c| c.client_id)
    }

    /// Validates and stores client credentials. User tokens are untouched.
    pub async fn set_client_credentials(
        &self,
        provider: Provider,
        client_id: &str,
        client_secret: &str,
    ) -> SetClientResult {
        let client_id = client_id.trim();
        let client_secret = client_secret.trim();
        if client_id.is_empty() || client_secret.is_empty() {
            return SetClientResult::failed("Client ID and secret are both required.");
        }

        let credentials = ClientCredentials::new(client_id, client_secret);

        let exchanger = match registered(&self.inner.exchangers, provider, "token exchanger") {
            Ok(exchanger) => exchanger,
            Err(e) => return SetClientResult::failed(e.user_message()),
        };
        if let Err(e) = exchanger.validate_client(&credentials).await {
            warn!(provider = %provider, error = %e, "Client credentials rejected");
            return SetClientResult::failed(e.user_message());
        }

        if let Err(e) = self.inner.store.set_client(provider, credentials) {
            error!(provider = %provider, error = %e, "Failed to save client credentials");
            return SetClientResult::failed("Could not save client credentials.");
        }

        info!(provider = %provider, client_id = %client_id, "Client credentials saved");
        SetClientResult::ok()
    }

    /// Returns false when none were stored. Existing user tokens stay.
    pub fn remove_client_credentials(&self, provider: Provider) -> Result<bool, AuthError> {
        let removed = self.inner.store.remove_client(provider)?;
        if removed {
            info!(provider = %provider, "Client credentials removed");
        }
        Ok(removed)
    }

    /// Snapshot for status displays. No refresh is attempted.
    pub fn record(&self, provider: Provider) -> CredentialRecord {
        self.inner.store.record(provider)
    }
}

/// Provider API calls that always pass through the refresh guard.
#[derive(Clone)]
pub struct AuthorizedClient {
    inner: Arc<ServiceInner>,
}

impl AuthorizedClient {
    /// GET `url` with the provider's bearer token and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        provider: Provider,
        url: &str,
    ) -> Result<T, AuthError> {
        let token = self
            .inner
            .guard
            .access_token(provider)
            .await
            .ok_or(AuthError::NotAuthenticated(provider))?;

        let response = self
            .inner
            .http
            .get(url)
            .bearer_auth(&token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}
