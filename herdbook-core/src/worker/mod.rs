//! The cache manager and background mutation queue, run as one worker.
//!
//! The worker sits in front of the application origin. GETs go through the
//! [`CacheManager`] strategies; mutations go to the network and are queued
//! in the [`MutationQueue`] when the network is unreachable. The application
//! talks to it with [`WorkerCommand`]s and hears back through
//! [`ClientMessage`] broadcasts.

mod cache;
mod fallback;
mod messages;
mod queue;

pub use cache::{bucket_name, CacheError, CacheStorage};
pub use fallback::{
    cache_key, default_fallback_routes, default_precache, CacheManager, FallbackRoute,
    InstallReport, ManagerConfig, RequestClass, CACHE_PREFIX, OFFLINE_HTML, OFFLINE_PAGE,
    ROOT_SHELL,
};
pub use messages::{ClientMessage, WorkerCommand};
pub use queue::{MutationQueue, QueueError, QueuedMutation, SyncSummary, MAX_RETRIES};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::db::{open_pool, WORKER_MIGRATIONS};
use crate::http::{FetchError, FetchRequest, FetchResponse, Fetcher};

/// Response header carrying the queued mutation id.
pub const QUEUED_HEADER: &str = "x-herdbook-queued";

const CLIENT_BUFFER: usize = 32;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: WorkerState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
}

/// Wake-ups delivered to the worker's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Message(WorkerCommand),
    /// Explicit sync request from the host
    Sync,
    /// Connectivity came back
    Online,
    PeriodicSync,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub manager: ManagerConfig,
    pub max_retries: u32,
    /// Periodic queue wake; `None` disables it
    pub periodic_interval: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(manager: ManagerConfig) -> Self {
        Self {
            manager,
            max_retries: MAX_RETRIES,
            periodic_interval: Some(Duration::from_secs(300)),
        }
    }
}

pub struct ServiceWorker {
    manager: CacheManager,
    queue: MutationQueue,
    state: watch::Sender<WorkerState>,
    // Serializes lifecycle transitions
    lifecycle: Mutex<()>,
    clients: broadcast::Sender<ClientMessage>,
    periodic_interval: Option<Duration>,
}

impl ServiceWorker {
    /// Opens the worker database at `path`.
    pub async fn open(
        path: &Path,
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, WorkerError> {
        let pool = open_pool(path, &WORKER_MIGRATIONS).await?;
        let clients = broadcast::channel(CLIENT_BUFFER).0;

        let manager = CacheManager::new(CacheStorage::new(pool.clone()), fetcher.clone(), config.manager);
        let queue = MutationQueue::new(pool, fetcher, clients.clone())
            .with_max_retries(config.max_retries);
        tracing::debug!(bucket = manager.bucket(), "worker opened at {}", path.display());

        Ok(Self {
            manager,
            queue,
            state: watch::channel(WorkerState::Parsed).0,
            lifecycle: Mutex::new(()),
            clients,
            periodic_interval: config.periodic_interval,
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Listens for sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
        self.clients.subscribe()
    }

    /// Precaches the manifest and moves to `Installed`.
    pub async fn install(&self) -> Result<InstallReport, WorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let state = self.state();
        if state != WorkerState::Parsed {
            return Err(WorkerError::InvalidState {
                action: "install",
                state,
            });
        }

        self.state.send_replace(WorkerState::Installing);
        let report = self.manager.install().await;
        self.state.send_replace(WorkerState::Installed);
        tracing::info!(cached = report.cached, failed = report.failed.len(), "worker installed");
        Ok(report)
    }

    /// Drops stale buckets and moves to `Activated`.
    pub async fn activate(&self) -> Result<(), WorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let state = self.state();
        if state != WorkerState::Installed {
            return Err(WorkerError::InvalidState {
                action: "activate",
                state,
            });
        }

        self.state.send_replace(WorkerState::Activating);
        match self.manager.activate().await {
            Ok(removed) => {
                self.state.send_replace(WorkerState::Activated);
                tracing::info!(removed = removed.len(), "worker activated");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(WorkerState::Installed);
                Err(e.into())
            }
        }
    }

    /// Activates an installed worker now. Does nothing in any other state.
    pub async fn skip_waiting(&self) -> Result<(), WorkerError> {
        if self.state() == WorkerState::Installed {
            self.activate().await?;
        }
        Ok(())
    }

    /// Serves an intercepted request.
    ///
    /// Mutations that cannot reach the network are queued and answered with
    /// `202 Accepted`; the queued id is in the [`QUEUED_HEADER`] header.
    /// Until the worker is activated every request goes straight to the
    /// network.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchResponse, WorkerError> {
        if self.state() != WorkerState::Activated {
            return Ok(self.manager.fetcher().fetch(request).await?);
        }
        if !request.is_mutation() {
            return Ok(self.manager.handle(request).await?);
        }

        match self.manager.fetcher().fetch(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::info!(url = %request.url, "network unavailable, queuing mutation: {}", e);
                let id = self.enqueue(&QueuedMutation::from_request(request)).await?;
                let body = serde_json::json!({ "queued": true, "id": id }).to_string();
                let mut response = FetchResponse::synthetic(202, "application/json", body);
                response.headers.insert(QUEUED_HEADER.to_string(), id);
                Ok(response)
            }
        }
    }

    /// Queues a mutation for replay.
    pub async fn enqueue(&self, mutation: &QueuedMutation) -> Result<String, WorkerError> {
        Ok(self.queue.enqueue(mutation).await?)
    }

    pub async fn process_queue(&self) -> Result<SyncSummary, WorkerError> {
        Ok(self.queue.process().await?)
    }

    /// Handles an application command. Route caching runs in the background.
    pub async fn handle_message(&self, command: WorkerCommand) -> Result<Option<JoinHandle<InstallReport>>, WorkerError> {
        match command {
            WorkerCommand::CacheDynamicRoutes { urls } => {
                let manager = self.manager.clone();
                Ok(Some(tokio::spawn(async move {
                    let report = manager.cache_urls(&urls).await;
                    tracing::debug!(cached = report.cached, failed = report.failed.len(), "dynamic routes cached");
                    report
                })))
            }
            WorkerCommand::SkipWaiting => {
                self.skip_waiting().await?;
                Ok(None)
            }
        }
    }

    async fn handle_event(&self, event: WorkerEvent) {
        let result = match event {
            WorkerEvent::Message(command) => self.handle_message(command).await.map(|_| ()),
            WorkerEvent::Sync | WorkerEvent::Online | WorkerEvent::PeriodicSync => {
                tracing::debug!(?event, "queue wake");
                self.process_queue().await.map(|_| ())
            }
        };
        if let Err(e) = result {
            tracing::error!("worker event failed: {}", e);
        }
    }

    /// Runs the event loop until every sender of `events` is dropped.
    /// Wakes are handled one at a time.
    pub fn spawn(self: Arc<Self>, mut events: mpsc::Receiver<WorkerEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut periodic = self.periodic_interval.map(|period| {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker
            });

            loop {
                let event = match periodic.as_mut() {
                    Some(ticker) => tokio::select! {
                        event = events.recv() => event,
                        _ = ticker.tick() => Some(WorkerEvent::PeriodicSync),
                    },
                    None => events.recv().await,
                };

                match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                }
            }
            tracing::debug!("worker event loop finished");
        })
    }
}
