//! Loopback listener that catches a single OAuth redirect.
//!
//! Each provider owns one [`CallbackListener`] bound to its fixed port. The
//! listener moves `Idle → Listening → Idle`:
//! - `start` while `Listening` is a no-op ([`ListenerStart::AlreadyActive`])
//! - the first request to [`CALLBACK_PATH`] is answered, then the server shuts down
//! - the outcome is handed to the caller only after the socket is closed

use super::provider::CALLBACK_PATH;
use super::{AuthError, Provider};
use crate::lock;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Query parameters of the provider redirect
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackQuery {
    fn into_outcome(self) -> CallbackResult {
        if let Some(error) = self.error {
            return Err(AuthError::AuthorizationDenied {
                error,
                description: self
                    .error_description
                    .unwrap_or_else(|| "no description".to_string()),
            });
        }
        match self.code.filter(|code| !code.is_empty()) {
            Some(code) => Ok(AuthorizationCode {
                code,
                state: self.state,
            }),
            None => Err(AuthError::MissingCallbackCode),
        }
    }
}

/// Code (and echoed state) extracted from a successful redirect.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub state: Option<String>,
}

impl fmt::Debug for AuthorizationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationCode")
            .field("code", &"[REDACTED]")
            .field("state", &self.state)
            .finish()
    }
}

pub type CallbackResult = Result<AuthorizationCode, AuthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
}

/// Result of [`CallbackListener::start`].
pub enum ListenerStart {
    /// A new listener is bound; `outcome` resolves once it has shut down.
    /// A dropped sender means the listener closed without a callback.
    Started {
        addr: SocketAddr,
        outcome: oneshot::Receiver<CallbackResult>,
    },
    /// A listener for this provider is already bound; nothing was changed.
    AlreadyActive,
}

impl ListenerStart {
    /// Splits a fresh start into its parts. `AlreadyActive` becomes
    /// [`AuthError::ListenerAlreadyActive`], which callers ignore.
    pub fn into_started(
        self,
        provider: Provider,
    ) -> Result<(SocketAddr, oneshot::Receiver<CallbackResult>), AuthError> {
        match self {
            ListenerStart::Started { addr, outcome } => Ok((addr, outcome)),
            ListenerStart::AlreadyActive => Err(AuthError::ListenerAlreadyActive(provider)),
        }
    }
}

pub struct CallbackListener {
    provider: Provider,
    port: u16,
    timeout: Option<Duration>,
    state: Arc<Mutex<ListenerState>>,
}

impl CallbackListener {
    /// # Arguments
    /// * `port` - Fixed loopback port (0 lets the OS pick, for tests)
    /// * `timeout` - Optional limit on waiting for the redirect; `None` waits forever
    pub fn new(provider: Provider, port: u16, timeout: Option<Duration>) -> Self {
        Self {
            provider,
            port,
            timeout,
            state: Arc::new(Mutex::new(ListenerState::Idle)),
        }
    }

    pub fn state(&self) -> ListenerState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    /// Binds the loopback listener unless one is already active.
    pub async fn start(&self) -> Result<ListenerStart> {
        {
            let mut state = lock(&self.state);
            if *state == ListenerState::Listening {
                debug!(provider = %self.provider, "Callback listener already active");
                return Ok(ListenerStart::AlreadyActive);
            }
            *state = ListenerState::Listening;
        }

        let bound = TcpListener::bind((Ipv4Addr::LOCALHOST, self.port))
            .await
            .and_then(|listener| listener.local_addr().map(|addr| (listener, addr)))
            .with_context(|| {
                format!(
                    "Failed to bind {} callback listener on 127.0.0.1:{}",
                    self.provider, self.port
                )
            });
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                *lock(&self.state) = ListenerState::Idle;
                return Err(e);
            }
        };

        let (handler_state, shutdown_rx) = CallbackState::new(self.provider);
        let delivered = Arc::clone(&handler_state.delivered);
        let router = callback_router(handler_state);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let provider = self.provider;
        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        tokio::spawn(async move {
            let signal = shutdown_signal(provider, shutdown_rx, timeout);
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                warn!(provider = %provider, error = %e, "Callback listener failed");
            }

            *lock(&state) = ListenerState::Idle;
            info!(provider = %provider, "Callback listener stopped");

            let outcome = lock(&delivered).take();
            match outcome {
                Some(outcome) => {
                    if outcome_tx.send(outcome).is_err() {
                        debug!(provider = %provider, "No flow waiting for callback outcome");
                    }
                }
                None => debug!(provider = %provider, "Listener closed without a callback"),
            }
        });

        info!(provider = %self.provider, addr = %addr, "Callback listener started");
        Ok(ListenerStart::Started {
            addr,
            outcome: outcome_rx,
        })
    }
}

async fn shutdown_signal(
    provider: Provider,
    shutdown: oneshot::Receiver<()>,
    timeout: Option<Duration>,
) {
    match timeout {
        Some(limit) => {
            tokio::select! {
                _ = shutdown => {}
                _ = tokio::time::sleep(limit) => {
                    warn!(
                        provider = %provider,
                        timeout_secs = limit.as_secs(),
                        "No authorization callback before timeout, closing listener"
                    );
                }
            }
        }
        None => {
            let _ = shutdown.await;
        }
    }
}

/// Shared between the request handler and the server task.
#[derive(Clone)]
pub(crate) struct CallbackState {
    provider: Provider,
    delivered: Arc<Mutex<Option<CallbackResult>>>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl CallbackState {
    pub(crate) fn new(provider: Provider) -> (Self, oneshot::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = Self {
            provider,
            delivered: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Mutex::new(Some(shutdown_tx))),
        };
        (state, shutdown_rx)
    }

    /// Records the first outcome and signals shutdown. Later calls return false.
    fn deliver(&self, outcome: CallbackResult) -> bool {
        let Some(shutdown) = lock(&self.shutdown).take() else {
            return false;
        };
        *lock(&self.delivered) = Some(outcome);
        let _ = shutdown.send(());
        true
    }
}

pub(crate) fn callback_router(state: CallbackState) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(state)
}

/// GET /callback
///
/// Answers the browser, then hands the outcome over and stops the listener,
/// whether or not a code was present.
async fn handle_callback(
    State(state): State<CallbackState>,
    query: Option<Query<CallbackQuery>>,
) -> Response {
    let provider = state.provider;
    let outcome = query.map(|Query(q)| q).unwrap_or_default().into_outcome();

    let response = match &outcome {
        Ok(_) => {
            info!(provider = %provider, "Authorization callback received");
            (StatusCode::OK, Html(success_page(provider))).into_response()
        }
        Err(AuthError::AuthorizationDenied { error, .. }) => {
            warn!(provider = %provider, error = %error, "Provider denied authorization");
            (
                StatusCode::BAD_REQUEST,
                format!(
                    "{} authorization was denied. You can close this tab.",
                    provider.display_name()
                ),
            )
                .into_response()
        }
        Err(_) => {
            warn!(provider = %provider, "Callback received without an authorization code");
            (
                StatusCode::BAD_REQUEST,
                "Missing authorization code. Return to the app and try again.",
            )
                .into_response()
        }
    };

    if !state.deliver(outcome) {
        return (
            StatusCode::GONE,
            "This authorization request has already been handled.",
        )
            .into_response();
    }

    response
}

fn success_page(provider: Provider) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Connected</title></head>\
         <body style=\"font-family: sans-serif; text-align: center; margin-top: 4em\">\
         <h1>{} connected</h1><p>You can close this tab and return to the app.</p>\
         </body></html>",
        provider.display_name()
    )
}
