use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{
    try_auto_sync, AuthCommand, ConfigCommand, DocCommand, QueueCommand, ServeCommand,
    SyncCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "herd")]
#[command(version)]
#[command(about = "Offline-first farm records: local store, sync and offline gateway", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log sync activity to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read and write documents in the local store
    Doc(DocCommand),

    /// Sync with the backend
    Sync(SyncCommand),

    /// Manage the cached login
    Auth(AuthCommand),

    /// Inspect and replay queued mutations
    Queue(QueueCommand),

    /// Run the offline gateway
    Serve(ServeCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "herd=debug,herdbook_core=debug"
    } else {
        "herd=warn,herdbook_core=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Save config path for init command
    let cli_config_path = cli.config.clone();

    let config = Config::load(cli.config)?;

    // Auto-sync BEFORE read commands
    if is_read_command(&cli.command) {
        try_auto_sync(&config);
    }

    let result = execute_command(&cli.command, &config, cli_config_path);

    // Auto-sync AFTER write commands (only if command succeeded)
    if result.is_ok() && is_write_command(&cli.command) {
        try_auto_sync(&config);
    }

    result
}

fn execute_command(
    command: &Option<Commands>,
    config: &Config,
    cli_config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Some(Commands::Doc(cmd)) => cmd.run(config)?,
        Some(Commands::Sync(cmd)) => cmd.run(config)?,
        Some(Commands::Auth(cmd)) => cmd.run(config)?,
        Some(Commands::Queue(cmd)) => cmd.run(config)?,
        Some(Commands::Serve(cmd)) => cmd.run(config)?,
        Some(Commands::Config(cmd)) => cmd.run(config, cli_config_path)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Returns true if the command is a read operation that should sync before execution.
fn is_read_command(cmd: &Option<Commands>) -> bool {
    matches!(cmd, Some(Commands::Doc(d)) if d.command.is_read())
}

/// Returns true if the command is a write operation that should sync after execution.
fn is_write_command(cmd: &Option<Commands>) -> bool {
    matches!(cmd, Some(Commands::Doc(d)) if d.command.is_write())
}
