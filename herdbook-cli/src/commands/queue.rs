use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand};
use serde_json::Value;

use herdbook_core::{QueuedMutation, SyncSummary};

use super::serve::open_worker;
use super::{runtime, CommandError, OutputFormat};
use crate::config::Config;

/// Inspect and replay the background mutation queue
#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    command: QueueSubcommand,
}

#[derive(Subcommand)]
enum QueueSubcommand {
    /// List queued mutations
    Ls {
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Queue a write for later replay
    Add {
        /// HTTP method (POST, PUT, PATCH, DELETE)
        method: String,

        /// Absolute URL, or a path on the app origin
        url: String,

        /// JSON body
        #[arg(long)]
        body: Option<String>,
    },

    /// Replay every queued mutation now
    Flush,
}

impl QueueCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        runtime()?.block_on(self.execute(config))
    }

    async fn execute(&self, config: &Config) -> Result<(), CommandError> {
        let worker = open_worker(config).await?;

        match &self.command {
            QueueSubcommand::Ls { format } => {
                let queued = worker.queue().list().await.map_err(herdbook_core::WorkerError::from)?;
                match format {
                    OutputFormat::Json => println!(
                        "{}",
                        serde_json::to_string_pretty(&queued)
                            .map_err(|e| CommandError::InvalidInput(e.to_string()))?
                    ),
                    OutputFormat::Text => print_queue(&queued, worker.queue().max_retries()),
                }
            }
            QueueSubcommand::Add { method, url, body } => {
                let mutation = build_mutation(worker.manager().app_origin(), method, url, body.as_deref())?;
                let id = worker.enqueue(&mutation).await?;
                println!("Queued {} {} as {}", mutation.method, mutation.url, id);
            }
            QueueSubcommand::Flush => {
                let pending = worker.queue().len().await.map_err(herdbook_core::WorkerError::from)?;
                if pending == 0 {
                    println!("Queue is empty.");
                    return Ok(());
                }
                println!("Replaying {} queued mutation(s)...", pending);
                print_summary(&worker.process_queue().await?);
            }
        }
        Ok(())
    }
}

fn build_mutation(
    origin: &url::Url,
    method: &str,
    url: &str,
    body: Option<&str>,
) -> Result<QueuedMutation, CommandError> {
    let method = method.to_ascii_uppercase();
    if matches!(method.as_str(), "GET" | "HEAD" | "OPTIONS") {
        return Err(CommandError::InvalidInput(format!(
            "{} requests are not queued; only writes are",
            method
        )));
    }

    let url = origin
        .join(url)
        .map_err(|e| CommandError::InvalidInput(format!("Invalid URL '{}': {}", url, e)))?;
    let body = body
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|e| CommandError::InvalidInput(format!("Invalid JSON body: {}", e)))?;

    Ok(QueuedMutation::new(url.as_str(), &method, body))
}

fn print_queue(queued: &[QueuedMutation], max_retries: u32) {
    if queued.is_empty() {
        println!("Queue is empty.");
        return;
    }
    for mutation in queued {
        let queued_at = Utc
            .timestamp_millis_opt(mutation.timestamp)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{}  {:<6} {}  (queued {}, retries {}/{})",
            mutation.id, mutation.method, mutation.url, queued_at, mutation.retries, max_retries
        );
    }
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "{} synced, {} failed, {} remaining",
        summary.synced, summary.failed, summary.remaining
    );
}
