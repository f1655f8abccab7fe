//! Sync CLI commands for replicating with the backend.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};

use herdbook_core::{
    NetworkStatus, Platform, RemoteSource, ReplicationScheduler, SyncProgress, SyncStatusTracker,
    Visibility,
};

use super::{runtime, CommandError, Session};
use crate::config::Config;

/// Sync with the backend
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration, local state and server status
    Status,

    /// Keep replicating until Ctrl-C
    Watch {
        /// Poll on the inactive interval, as a backgrounded app would
        #[arg(long)]
        background: bool,
    },
}

impl SyncCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        let rt = runtime()?;

        match &self.command {
            None => rt.block_on(self.sync(config)),
            Some(SyncSubcommand::Status) => rt.block_on(self.status(config)),
            Some(SyncSubcommand::Watch { background }) => rt.block_on(self.watch(config, *background)),
        }
    }

    async fn sync(&self, config: &Config) -> Result<(), CommandError> {
        let session = Session::open(config).await?;
        session.remote()?;

        println!("Syncing with server...");
        println!();

        let mut any_updated = false;
        for (collection, result) in session.sync_all().await {
            match result {
                Ok(outcome) => {
                    let status = if outcome.pushed > 0 || outcome.applied > 0 {
                        any_updated = true;
                        "✓ updated"
                    } else {
                        "✓ up to date"
                    };
                    println!(
                        "  {} {} (pushed {}, rejected {}, pulled {}, applied {})",
                        status,
                        collection,
                        outcome.pushed,
                        outcome.rejected,
                        outcome.pulled,
                        outcome.applied
                    );
                }
                Err(e) => {
                    println!("  ✗ {} - {}", collection, e);
                }
            }
        }

        println!();
        if any_updated {
            println!("Sync complete.");
        } else {
            println!("Already up to date.");
        }

        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), CommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let session = Session::open(config).await?;

        let remote = match session.remote() {
            Ok(remote) => remote,
            Err(_) => {
                println!("Status: Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"http://localhost:8080\"");
                println!("    api_key: \"your-api-key\"");
                println!();
                println!("Or set environment variables:");
                println!("  HERD_SYNC_URL");
                println!("  HERD_SYNC_API_KEY");
                return Ok(());
            }
        };

        println!("Server:    {}", remote.server_url());
        println!(
            "Auto-sync: {}",
            if config.sync.auto_sync {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!(
            "Polling:   every {}s (foreground), {}s (background)",
            config.sync.active_interval_secs, config.sync.inactive_interval_secs
        );
        println!();

        print!("Server status: ");
        let online = remote.is_reachable().await;
        if online {
            println!("✓ connected");
        } else {
            println!("✗ unreachable");
        }
        println!();

        println!("{:<16} {:>8} {:>8}  checkpoint", "collection", "local", "remote");
        for name in session.registry().names() {
            let local = session.store.count(name).await?;
            let remote_count = if online {
                match remote.count(name).await {
                    Ok(count) => count.to_string(),
                    Err(e) => {
                        tracing::debug!(collection = name, "count failed: {}", e);
                        "?".to_string()
                    }
                }
            } else {
                "-".to_string()
            };
            let checkpoint = match session.store.checkpoint(name).await? {
                Some(cp) => format!("#{}", cp.sequence),
                None => "none".to_string(),
            };
            println!("{:<16} {:>8} {:>8}  {}", name, local, remote_count, checkpoint);
        }

        Ok(())
    }

    async fn watch(&self, config: &Config, background: bool) -> Result<(), CommandError> {
        let session = Session::open(config).await?;
        let remote = session.remote()?;

        let visibility = if background {
            Visibility::Hidden
        } else {
            Visibility::Visible
        };
        let platform = Platform::new(visibility, network_status(remote.is_reachable().await));

        let scheduler = ReplicationScheduler::new(
            session.registry().clone(),
            platform.clone(),
            config.sync.scheduler(),
        );
        let source: Arc<dyn RemoteSource> = remote.clone();
        let tracker = SyncStatusTracker::new(session.store.clone(), source, session.registry().clone());

        scheduler.start().await;
        tracker.start();
        println!(
            "Watching {} collection(s) every {}s. Press Ctrl-C to stop.",
            session.registry().len(),
            scheduler.interval().await.as_secs()
        );

        let mut progress = tracker.subscribe();
        let mut ping = tokio::time::interval(ping_interval(config));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_percent = None;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ping.tick() => {
                    let status = network_status(remote.is_reachable().await);
                    if platform.set_network(status) {
                        println!("Network: {}", describe_network(status));
                    }
                }
                Ok(()) = progress.changed() => {
                    let snapshot = progress.borrow_and_update().clone();
                    report_progress(&snapshot, &mut last_percent);
                    if tracker.take_completion_notice().await? {
                        println!("Initial sync complete.");
                    }
                }
            }
        }

        tracker.stop();
        scheduler.stop().await;
        println!();
        println!("Stopped after {} sync round(s).", scheduler.dispatch_count());
        Ok(())
    }
}

fn network_status(reachable: bool) -> NetworkStatus {
    if reachable {
        NetworkStatus::Online
    } else {
        NetworkStatus::Offline
    }
}

fn describe_network(status: NetworkStatus) -> &'static str {
    match status {
        NetworkStatus::Online => "online",
        NetworkStatus::Offline => "offline",
    }
}

/// Connectivity is checked as often as the foreground poll, at least every second.
fn ping_interval(config: &Config) -> Duration {
    Duration::from_secs(config.sync.active_interval_secs.max(1))
}

fn report_progress(progress: &SyncProgress, last_percent: &mut Option<u8>) {
    if progress.collections.is_empty() {
        return;
    }
    let percent = progress.percent();
    if *last_percent != Some(percent) {
        println!("Initial sync: {}%", percent);
        *last_percent = Some(percent);
    }
}
