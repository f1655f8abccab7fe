mod auth;
mod config_cmd;
mod doc;
mod queue;
mod serve;
mod session;
mod sync_cmd;

pub use auth::AuthCommand;
pub use config_cmd::ConfigCommand;
pub use doc::{DocCommand, DocSubcommand};
pub use queue::QueueCommand;
pub use serve::ServeCommand;
pub use session::try_auto_sync;
use session::Session;
pub use sync_cmd::SyncCommand;

use clap::ValueEnum;
use herdbook_core::{AuthCacheError, RemoteError, ReplicationError, StoreError, WorkerError};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Errors from CLI commands
#[derive(Debug)]
pub enum CommandError {
    Store(StoreError),
    Replication(ReplicationError),
    Remote(RemoteError),
    Worker(WorkerError),
    AuthCache(AuthCacheError),
    /// Sync needs both a server URL and an API key
    NotConfigured,
    InvalidInput(String),
    Io(std::io::Error),
    RuntimeError(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Store(e) => write!(f, "{}", e),
            CommandError::Replication(e) => write!(f, "Sync failed: {}", e),
            CommandError::Remote(e) => write!(f, "Server error: {}", e),
            CommandError::Worker(e) => write!(f, "{}", e),
            CommandError::AuthCache(e) => write!(f, "{}", e),
            CommandError::NotConfigured => write!(
                f,
                "Sync not configured. Set sync.server_url and sync.api_key in config or HERD_SYNC_URL and HERD_SYNC_API_KEY."
            ),
            CommandError::InvalidInput(msg) => write!(f, "{}", msg),
            CommandError::Io(e) => write!(f, "I/O error: {}", e),
            CommandError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Store(e) => Some(e),
            CommandError::Replication(e) => Some(e),
            CommandError::Remote(e) => Some(e),
            CommandError::Worker(e) => Some(e),
            CommandError::AuthCache(e) => Some(e),
            CommandError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        CommandError::Store(e)
    }
}

impl From<ReplicationError> for CommandError {
    fn from(e: ReplicationError) -> Self {
        CommandError::Replication(e)
    }
}

impl From<RemoteError> for CommandError {
    fn from(e: RemoteError) -> Self {
        CommandError::Remote(e)
    }
}

impl From<WorkerError> for CommandError {
    fn from(e: WorkerError) -> Self {
        CommandError::Worker(e)
    }
}

impl From<AuthCacheError> for CommandError {
    fn from(e: AuthCacheError) -> Self {
        CommandError::AuthCache(e)
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::Io(e)
    }
}

/// Builds the multi-threaded runtime each command drives its async work on.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, CommandError> {
    tokio::runtime::Runtime::new().map_err(|e| CommandError::RuntimeError(e.to_string()))
}
