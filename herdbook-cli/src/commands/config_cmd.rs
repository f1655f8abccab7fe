use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::{CommandError, OutputFormat};
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Show current configuration
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# herdbook configuration

# Directory for the local store, gateway cache and auth session
# data_dir: ~/.local/share/herdbook

sync:
  # server_url: http://localhost:8080
  # api_key: your-api-key
  collections: [animals, vaccines, reproduction, sales, clients]
  active_interval_secs: 5
  inactive_interval_secs: 30
  auto_sync: true

cache:
  version: v1
  app_origin: http://localhost:5173
  listen: 127.0.0.1:4173

queue:
  max_retries: 3
  periodic_interval_secs: 300
"#;

impl ConfigCommand {
    pub fn run(&self, config: &Config, cli_config_path: Option<PathBuf>) -> Result<(), CommandError> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        let json = serde_json::to_string_pretty(config)
                            .map_err(|e| CommandError::InvalidInput(e.to_string()))?;
                        println!("{}", json);
                    }
                    OutputFormat::Text => print_config(config),
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = cli_config_path.unwrap_or_else(Config::default_config_path);

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'herd config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(DEFAULT_CONFIG.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}

fn print_config(config: &Config) {
    println!("Configuration");
    println!("=============\n");

    if let Some(path) = &config.config_file {
        println!("Config file: {}", path.display());
    } else {
        println!(
            "Config file: {} (not found)",
            Config::default_config_path().display()
        );
    }
    println!();

    println!("data_dir: {}", config.data_dir.value.display());
    println!("  source: {}", config.data_dir.source);
    println!();

    println!("sync:");
    println!(
        "  server_url: {}",
        config.sync.server_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  api_key: {}",
        if config.sync.api_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    println!("  collections: {}", config.sync.collections.join(", "));
    println!(
        "  intervals: {}s active, {}s inactive, {}s initial delay",
        config.sync.active_interval_secs,
        config.sync.inactive_interval_secs,
        config.sync.initial_delay_secs
    );
    println!("  batch_size: {}", config.sync.batch_size);
    println!("  auto_sync: {}", config.sync.auto_sync);
    println!();

    println!("cache:");
    println!("  version: {}", config.cache.version);
    println!("  app_origin: {}", config.cache.app_origin);
    println!("  listen: {}", config.cache.listen);
    println!("  precache: {}", config.cache.precache.join(", "));
    for route in &config.cache.fallback_routes {
        println!("  fallback: {} -> {}", route.prefix, route.list_path);
    }
    println!();

    println!("queue:");
    println!("  max_retries: {}", config.queue.max_retries);
    println!("  periodic_interval_secs: {}", config.queue.periodic_interval_secs);
}
