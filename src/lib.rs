//! Account linking for a chat-driven music player.
//!
//! Owns the OAuth side of the application: authorizing against the chat
//! provider (Kick, PKCE) and the music provider (Spotify), persisting the
//! resulting credentials, and refreshing them before any authenticated call.

use std::sync::{Mutex, MutexGuard, PoisonError};

// TOML configuration with env overrides
pub mod config;

// Persisted credential and client-credential records
pub mod credentials;

// Tracing setup, audit sink and secret redaction
pub mod logging;

// Authorization flows, token exchange and refresh
pub mod oauth;

// Entry points for the presentation layer
pub mod service;

pub use credentials::{ClientCredentials, CredentialRecord, CredentialStore, TokenSet};
pub use oauth::{AuthError, Provider};
pub use service::{AuthNotification, AuthService, AuthStatus, SetClientResult};

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
