//! Host platform signals: visibility, connectivity and focus.
//!
//! The host (a CLI, a desktop shell, a test) reports transitions through
//! [`Platform`]. Components listen with [`Platform::watch`] and keep the
//! listener task in a [`Subscription`], which is cancelled on drop. A
//! component that listens to several signals collects them in
//! [`Subscriptions`] and releases them together on teardown.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// A platform transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    Visibility(Visibility),
    Network(NetworkStatus),
    Focus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Visibility,
    Network,
    Focus,
}

impl PlatformEvent {
    pub fn kind(&self) -> SignalKind {
        match self {
            PlatformEvent::Visibility(_) => SignalKind::Visibility,
            PlatformEvent::Network(_) => SignalKind::Network,
            PlatformEvent::Focus => SignalKind::Focus,
        }
    }
}

struct PlatformInner {
    events: broadcast::Sender<PlatformEvent>,
    visibility: watch::Sender<Visibility>,
    network: watch::Sender<NetworkStatus>,
}

/// Current platform state plus a stream of transitions. Cheap to clone.
#[derive(Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    pub fn new(visibility: Visibility, network: NetworkStatus) -> Self {
        Self {
            inner: Arc::new(PlatformInner {
                events: broadcast::channel(EVENT_BUFFER).0,
                visibility: watch::channel(visibility).0,
                network: watch::channel(network).0,
            }),
        }
    }

    pub fn visibility(&self) -> Visibility {
        *self.inner.visibility.borrow()
    }

    pub fn network(&self) -> NetworkStatus {
        *self.inner.network.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.network() == NetworkStatus::Online
    }

    /// Reports the visibility. Emits an event only on an actual transition;
    /// returns whether one happened.
    pub fn set_visibility(&self, visibility: Visibility) -> bool {
        let changed = self.inner.visibility.send_if_modified(|current| {
            if *current == visibility {
                return false;
            }
            *current = visibility;
            true
        });
        if changed {
            tracing::debug!(?visibility, "visibility changed");
            let _ = self.inner.events.send(PlatformEvent::Visibility(visibility));
        }
        changed
    }

    /// Reports connectivity. Emits an event only on an actual transition.
    pub fn set_network(&self, status: NetworkStatus) -> bool {
        let changed = self.inner.network.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::info!(?status, "network status changed");
            let _ = self.inner.events.send(PlatformEvent::Network(status));
        }
        changed
    }

    /// Reports that the application window gained focus.
    pub fn focus(&self) {
        let _ = self.inner.events.send(PlatformEvent::Focus);
    }

    /// Listens for transitions of one kind.
    pub fn watch(&self, kind: SignalKind) -> SignalWatch {
        SignalWatch {
            kind,
            rx: self.inner.events.subscribe(),
        }
    }

    /// Connectivity as a watch channel, for callers that only need the
    /// latest value.
    pub fn network_receiver(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.network.subscribe()
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new(Visibility::Visible, NetworkStatus::Online)
    }
}

/// Stream of events of a single [`SignalKind`].
pub struct SignalWatch {
    kind: SignalKind,
    rx: broadcast::Receiver<PlatformEvent>,
}

impl SignalWatch {
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Next matching event, or `None` once the platform is gone.
    pub async fn recv(&mut self) -> Option<PlatformEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind() == self.kind => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(kind = ?self.kind, skipped, "signal watch lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A cancellable listener task.
pub struct Subscription {
    name: &'static str,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            task: Some(tokio::spawn(future)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Subscriptions released together.
#[derive(Default)]
pub struct Subscriptions {
    items: Vec<Subscription>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.items.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn active(&self) -> usize {
        self.items.iter().filter(|s| s.is_active()).count()
    }

    pub fn cancel_all(&mut self) {
        for mut subscription in self.items.drain(..) {
            tracing::trace!(name = subscription.name(), "cancelling subscription");
            subscription.cancel();
        }
    }
}
