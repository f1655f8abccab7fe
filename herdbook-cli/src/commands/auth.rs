//! Authentication commands for the Herdbook CLI.
//!
//! The backend identifies callers by API key. `login` asks the backend who
//! the key belongs to and caches the answer so later runs keep working
//! offline; `logout` forgets it.

use clap::{Args, Subcommand};

use herdbook_core::{AuthCache, HttpRemote, Identity};

use super::{runtime, CommandError};
use crate::config::Config;

/// Authentication commands
#[derive(Args)]
pub struct AuthCommand {
    #[command(subcommand)]
    command: AuthSubcommand,
}

#[derive(Subcommand)]
enum AuthSubcommand {
    /// Confirm the configured API key with the server and cache the identity
    Login,
    /// Forget the cached identity
    Logout,
    /// Show authentication status
    Status,
}

impl AuthCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let cache = AuthCache::new(&config.data_dir.value);
        match &self.command {
            AuthSubcommand::Login => runtime()?.block_on(login(config, &cache)),
            AuthSubcommand::Logout => logout(&cache),
            AuthSubcommand::Status => status(config, &cache),
        }
    }
}

async fn login(config: &Config, cache: &AuthCache) -> Result<(), CommandError> {
    let (Some(url), Some(key)) = (&config.sync.server_url, &config.sync.api_key) else {
        return Err(CommandError::NotConfigured);
    };
    let remote = HttpRemote::with_timeout(url.clone(), key.clone(), config.sync.timeout())?;

    let online = remote.is_reachable().await;
    if !online {
        println!("Server unreachable, using cached identity.");
    }

    match cache.resolve_identity(online, remote.fetch_identity()).await {
        Some(identity) => {
            print_identity(&identity);
            Ok(())
        }
        None if online => Err(CommandError::InvalidInput(
            "Server rejected the API key".to_string(),
        )),
        None => {
            println!("No cached identity. Log in again once the server is reachable.");
            Ok(())
        }
    }
}

fn logout(cache: &AuthCache) -> Result<(), CommandError> {
    cache.clear()?;
    println!("Logged out.");
    Ok(())
}

fn status(config: &Config, cache: &AuthCache) -> Result<(), CommandError> {
    match &config.sync.api_key {
        Some(key) => println!("API key:  {}", mask_key(key)),
        None => println!("API key:  not set"),
    }

    match cache.get_cached() {
        Some(session) => {
            print_identity(&session.identity);
            println!(
                "Cached:   {}",
                session.cached_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        None if config.sync.is_configured() => {
            println!("Not logged in. Run 'herd auth login' to authenticate.");
        }
        None => println!("Not configured. Set sync.server_url and sync.api_key first."),
    }
    Ok(())
}

fn print_identity(identity: &Identity) {
    println!("User:     {}", identity.user_id);
    println!("Farm:     {}", identity.farm_id);
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}
