use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Complete tunebridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub kick: KickConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
}

/// Credential store location and at-rest encryption
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Name of the env var holding a base64 32-byte key. Unset var means plain JSON.
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("tunebridge-credentials.json")
}

fn default_encryption_key_env() -> String {
    "TUNEBRIDGE_ENCRYPTION_KEY".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            encryption_key_env: default_encryption_key_env(),
        }
    }
}

impl StorageConfig {
    /// Reads the encryption key from the configured env var, if set.
    pub fn encryption_key(&self) -> Option<String> {
        std::env::var(&self.encryption_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Audit log sink
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rotated log file. `None` disables the file sink.
    #[serde(default = "default_log_directory")]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_file_name")]
    pub file_name: String,
    /// Rotate once the active file would grow past this size
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Rotated generations to keep (oldest discarded)
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Filter used when neither TUNEBRIDGE_LOG nor RUST_LOG is set
    #[serde(default = "default_filter")]
    pub default_filter: String,
}

fn default_log_directory() -> Option<PathBuf> {
    Some(PathBuf::from("logs"))
}

fn default_log_file_name() -> String {
    "tunebridge.log".to_string()
}

fn default_max_file_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_files() -> usize {
    3
}

fn default_filter() -> String {
    "tunebridge=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            file_name: default_log_file_name(),
            max_file_bytes: default_max_file_bytes(),
            max_files: default_max_files(),
            default_filter: default_filter(),
        }
    }
}

/// Outbound HTTP settings shared by all provider calls
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    15
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Token lifecycle tuning
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Tokens expiring within this many seconds are refreshed early
    #[serde(default)]
    pub refresh_margin_seconds: i64,
    /// Tear down an unanswered callback listener after this many seconds.
    /// Unset keeps the listener bound until a request arrives.
    #[serde(default)]
    pub callback_timeout_seconds: Option<u64>,
}

/// Kick (chat provider) endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct KickConfig {
    #[serde(default = "default_kick_port")]
    pub callback_port: u16,
    #[serde(default = "default_kick_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_kick_token_url")]
    pub token_url: String,
    /// Base URL of the public API used for the channel lookup
    #[serde(default = "default_kick_api_base_url")]
    pub api_base_url: String,
    /// Base URL of the site API used for the chatroom lookup
    #[serde(default = "default_kick_chatroom_base_url")]
    pub chatroom_base_url: String,
    #[serde(default = "default_kick_scopes")]
    pub scopes: Vec<String>,
}

fn default_kick_port() -> u16 {
    53134
}

fn default_kick_authorize_url() -> String {
    "https://id.kick.com/oauth/authorize".to_string()
}

fn default_kick_token_url() -> String {
    "https://id.kick.com/oauth/token".to_string()
}

fn default_kick_api_base_url() -> String {
    "https://api.kick.com".to_string()
}

fn default_kick_chatroom_base_url() -> String {
    "https://kick.com".to_string()
}

fn default_kick_scopes() -> Vec<String> {
    ["user:read", "channel:read", "chat:write", "events:subscribe"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for KickConfig {
    fn default() -> Self {
        Self {
            callback_port: default_kick_port(),
            authorize_url: default_kick_authorize_url(),
            token_url: default_kick_token_url(),
            api_base_url: default_kick_api_base_url(),
            chatroom_base_url: default_kick_chatroom_base_url(),
            scopes: default_kick_scopes(),
        }
    }
}

/// Spotify (music provider) endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyConfig {
    #[serde(default = "default_spotify_port")]
    pub callback_port: u16,
    #[serde(default = "default_spotify_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_spotify_token_url")]
    pub token_url: String,
    #[serde(default = "default_spotify_scopes")]
    pub scopes: Vec<String>,
}

fn default_spotify_port() -> u16 {
    8888
}

fn default_spotify_authorize_url() -> String {
    "https://accounts.spotify.com/authorize".to_string()
}

fn default_spotify_token_url() -> String {
    "https://accounts.spotify.com/api/token".to_string()
}

fn default_spotify_scopes() -> Vec<String> {
    [
        "user-read-playback-state",
        "user-modify-playback-state",
        "user-read-currently-playing",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            callback_port: default_spotify_port(),
            authorize_url: default_spotify_authorize_url(),
            token_url: default_spotify_token_url(),
            scopes: default_spotify_scopes(),
        }
    }
}

impl AppConfig {
    /// Applies env var overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TUNEBRIDGE_STORE_PATH") {
            if !v.is_empty() {
                self.storage.path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("TUNEBRIDGE_KICK_CALLBACK_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.kick.callback_port = port;
            }
        }
        if let Ok(v) = std::env::var("TUNEBRIDGE_SPOTIFY_CALLBACK_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.spotify.callback_port = port;
            }
        }
        if let Ok(v) = std::env::var("TUNEBRIDGE_HTTP_TIMEOUT_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.http.timeout_seconds = secs;
            }
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads the file if it exists (defaults otherwise), then applies env overrides.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        AppConfig::default()
    };
    config.apply_env_overrides();
    Ok(config)
}
