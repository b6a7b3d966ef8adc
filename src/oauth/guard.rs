//! Refresh-before-use for stored access tokens.
//!
//! Callers ask [`RefreshGuard::ensure_valid`] before every authenticated call.
//! Unexpired tokens return immediately. Expired tokens are refreshed once per
//! provider at a time; a rejected refresh wipes the record so the next step is
//! a fresh login.

use super::{Provider, TokenExchanger};
use crate::credentials::CredentialStore;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct RefreshGuard {
    store: Arc<CredentialStore>,
    exchangers: HashMap<Provider, Arc<dyn TokenExchanger>>,
    /// Single-flight lock per provider. Held across the refresh call.
    locks: HashMap<Provider, Mutex<()>>,
    refresh_margin: Duration,
}

impl RefreshGuard {
    /// # Arguments
    /// * `refresh_margin_seconds` - Tokens expiring within this window count as expired
    pub fn new(
        store: Arc<CredentialStore>,
        exchangers: HashMap<Provider, Arc<dyn TokenExchanger>>,
        refresh_margin_seconds: i64,
    ) -> Self {
        let locks = Provider::ALL
            .iter()
            .map(|provider| (*provider, Mutex::new(())))
            .collect();

        Self {
            store,
            exchangers,
            locks,
            refresh_margin: Duration::seconds(refresh_margin_seconds.max(0)),
        }
    }

    /// Returns true when `provider` holds a usable access token, refreshing it
    /// first if it has expired.
    ///
    /// Concurrent callers for the same provider are serialised; the second one
    /// re-reads the record and sees the refreshed token.
    pub async fn ensure_valid(&self, provider: Provider) -> bool {
        let Some(lock) = self.locks.get(&provider) else {
            return false;
        };
        let _flight = lock.lock().await;

        let Some(tokens) = self.store.record(provider).token_set() else {
            debug!(provider = %provider, "No stored tokens");
            return false;
        };

        if tokens.expires_at > Utc::now() + self.refresh_margin {
            return true;
        }

        let Some(client) = self.store.client(provider) else {
            // Tokens are kept; they become usable again once client credentials are back
            warn!(
                provider = %provider,
                "Access token expired but no client credentials are configured"
            );
            return false;
        };

        let Some(exchanger) = self.exchangers.get(&provider) else {
            warn!(provider = %provider, "No token exchanger registered");
            return false;
        };

        info!(provider = %provider, expired_at = %tokens.expires_at, "Refreshing access token");

        match exchanger.refresh(&client, &tokens.refresh_token).await {
            Ok(fresh) => match self.store.update(provider, |record| record.apply_tokens(&fresh)) {
                Ok(record) => {
                    info!(
                        provider = %provider,
                        expires_at = ?record.expires_at,
                        "Access token refreshed"
                    );
                    true
                }
                Err(e) => {
                    error!(provider = %provider, error = %e, "Failed to persist refreshed tokens");
                    false
                }
            },
            Err(e) => {
                warn!(
                    provider = %provider,
                    refresh_token = %tokens.refresh_token,
                    error = %e,
                    kind = "RefreshFailed",
                    "Token refresh failed, clearing credentials"
                );
                if let Err(e) = self.store.clear(provider) {
                    error!(provider = %provider, error = %e, "Failed to clear credentials");
                }
                false
            }
        }
    }

    /// Current access token after [`ensure_valid`](Self::ensure_valid) succeeded.
    pub async fn access_token(&self, provider: Provider) -> Option<String> {
        if !self.ensure_valid(provider).await {
            return None;
        }
        self.store.record(provider).access_token
    }
}
