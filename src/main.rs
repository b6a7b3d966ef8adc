use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tunebridge::config::load_or_default;
use tunebridge::logging::init_logging;
use tunebridge::service::SystemBrowser;
use tunebridge::{AuthNotification, AuthService, CredentialStore, Provider};

#[derive(Parser)]
#[command(name = "tunebridge", version, about = "Link Kick and Spotify accounts")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "TUNEBRIDGE_CONFIG", default_value = "tunebridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authorize in the browser and wait for the result
    Login { provider: Provider },
    /// Forget the provider's tokens and cached identity
    Logout { provider: Provider },
    /// Show stored credentials for every provider (no refresh)
    Status,
    /// Manage the OAuth application credentials
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
    /// Token maintenance
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Validate and store a client id/secret
    Set {
        provider: Provider,
        #[arg(long)]
        id: String,
        #[arg(long, env = "TUNEBRIDGE_CLIENT_SECRET", hide_env_values = true)]
        secret: String,
    },
    Show { provider: Provider },
    Remove { provider: Provider },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Refresh if expired and report whether the provider is usable
    Check { provider: Provider },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_or_default(&cli.config)?;
    let _audit = init_logging(&config.logging)?;
    debug!(config = %cli.config.display(), "Configuration loaded");

    let encryption_key = config.storage.encryption_key();
    let store = Arc::new(CredentialStore::open(
        &config.storage.path,
        encryption_key.as_deref(),
    )?);
    info!(path = %config.storage.path.display(), encrypted = encryption_key.is_some(), "Credential store opened");

    let service = AuthService::new(&config, store, Arc::new(SystemBrowser))?;

    match cli.command {
        Command::Login { provider } => login(&service, provider).await,
        Command::Logout { provider } => {
            service.logout(provider)?;
            println!("{}: logged out", provider.display_name());
            Ok(())
        }
        Command::Status => {
            for provider in Provider::ALL {
                print_status(&service, provider);
            }
            Ok(())
        }
        Command::Client { action } => client(&service, action).await,
        Command::Token {
            action: TokenAction::Check { provider },
        } => {
            let status = service.check_authenticated(provider).await;
            match (status.authenticated, status.username) {
                (true, Some(username)) => println!("{}: valid ({})", provider.display_name(), username),
                (true, None) => println!("{}: valid", provider.display_name()),
                (false, _) => bail!("{} is not authenticated", provider.display_name()),
            }
            Ok(())
        }
    }
}

async fn login(service: &AuthService, provider: Provider) -> Result<()> {
    let mut notifications = service.subscribe();
    let started = service.authenticate(provider).await?;

    println!("Complete the {} login in your browser.", provider.display_name());
    println!("If it did not open, visit:\n  {}", started.authorize_url);

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification? {
                AuthNotification::Authenticated { provider: p, username } if p == provider => {
                    match username {
                        Some(name) => println!("{}: connected as {}", provider.display_name(), name),
                        None => println!("{}: connected", provider.display_name()),
                    }
                    return Ok(());
                }
                AuthNotification::Failed { provider: p, message } if p == provider => {
                    bail!(message);
                }
                _ => continue,
            },
            _ = tokio::signal::ctrl_c() => {
                bail!("Login cancelled");
            }
        }
    }
}

async fn client(service: &AuthService, action: ClientAction) -> Result<()> {
    match action {
        ClientAction::Set {
            provider,
            id,
            secret,
        } => {
            let result = service.set_client_credentials(provider, &id, &secret).await;
            if !result.success {
                bail!(result.error.unwrap_or_else(|| "Client credentials rejected".to_string()));
            }
            println!("{}: client credentials saved", provider.display_name());
        }
        ClientAction::Show { provider } => match service.client_id(provider) {
            Some(id) => println!("{}: client id {} (secret stored)", provider.display_name(), id),
            None => println!("{}: no client credentials", provider.display_name()),
        },
        ClientAction::Remove { provider } => {
            if service.remove_client_credentials(provider)? {
                println!("{}: client credentials removed", provider.display_name());
            } else {
                println!("{}: no client credentials to remove", provider.display_name());
            }
        }
    }
    Ok(())
}

fn print_status(service: &AuthService, provider: Provider) {
    let record = service.record(provider);
    let name = provider.display_name();
    let client = if service.has_client_credentials(provider) {
        "client configured"
    } else {
        "no client"
    };

    if !record.is_authenticated() {
        println!("{}: not connected ({})", name, client);
        return;
    }

    let expiry = record
        .expires_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    match record.username {
        Some(username) => println!(
            "{}: connected as {} (token expires {}, {})",
            name, username, expiry, client
        ),
        None => println!("{}: connected (token expires {}, {})", name, expiry, client),
    }
}
