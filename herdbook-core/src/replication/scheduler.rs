//! Adaptive polling of every registered collection.
//!
//! The scheduler owns exactly one polling timer. Its period is the active
//! interval while the app is visible and the inactive interval while hidden;
//! changing it aborts and awaits the old timer before the new one starts.
//! Becoming visible, coming back online and window focus each force an
//! immediate re-sync of every collection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{ReplicationRegistry, Replicator};
use crate::platform::{
    NetworkStatus, Platform, PlatformEvent, SignalKind, Subscription, Subscriptions, Visibility,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Polling period while visible
    pub active_interval: Duration,
    /// Polling period while hidden
    pub inactive_interval: Duration,
    /// Delay before the one-off sync after `start`
    pub initial_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(5),
            inactive_interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Why a dispatch happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Initial,
    Tick,
    Visible,
    Online,
    Focus,
    Manual,
}

/// The re-sync tasks started by one dispatch.
#[derive(Default)]
pub struct SyncDispatch {
    tasks: Vec<JoinHandle<()>>,
}

impl SyncDispatch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every task of this dispatch. Failures were already logged.
    pub async fn join(self) {
        join_all(self.tasks).await;
    }
}

struct SchedulerState {
    running: bool,
    interval: Duration,
    timer: Option<JoinHandle<()>>,
    initial: Option<JoinHandle<()>>,
    subscriptions: Subscriptions,
}

struct Inner {
    config: SchedulerConfig,
    platform: Platform,
    registry: RwLock<ReplicationRegistry>,
    state: Mutex<SchedulerState>,
    last_dispatch: std::sync::Mutex<Option<Instant>>,
    dispatches: AtomicU64,
    live_timers: Arc<AtomicUsize>,
}

/// Counts a timer task as live for as long as its future exists.
struct LiveTimer(Arc<AtomicUsize>);

impl LiveTimer {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveTimer {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ReplicationScheduler {
    inner: Arc<Inner>,
}

impl ReplicationScheduler {
    pub fn new(registry: ReplicationRegistry, platform: Platform, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    running: false,
                    interval: config.active_interval,
                    timer: None,
                    initial: None,
                    subscriptions: Subscriptions::new(),
                }),
                config,
                platform,
                registry: RwLock::new(registry),
                last_dispatch: std::sync::Mutex::new(None),
                dispatches: AtomicU64::new(0),
                live_timers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn register(&self, replicator: Arc<dyn Replicator>) {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(replicator);
    }

    /// Snapshot of the registered replicators.
    pub fn registry(&self) -> ReplicationRegistry {
        self.inner.registry()
    }

    /// Starts listening to platform signals, schedules the initial sync and
    /// starts polling. Calling it on a running scheduler does nothing.
    pub async fn start(&self) {
        let mut state = self.inner.state.lock().await;
        if state.running {
            return;
        }
        state.running = true;

        for kind in [SignalKind::Visibility, SignalKind::Network, SignalKind::Focus] {
            let inner = self.inner.clone();
            let mut signals = self.inner.platform.watch(kind);
            state.subscriptions.push(Subscription::spawn(
                signal_name(kind),
                async move {
                    while let Some(event) = signals.recv().await {
                        inner.on_signal(event).await;
                    }
                },
            ));
        }

        let inner = self.inner.clone();
        let delay = self.inner.config.initial_delay;
        state.initial = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.trigger_sync(SyncTrigger::Initial);
            inner.state.lock().await.initial = None;
        }));

        let interval = self.inner.interval_for(self.inner.platform.visibility());
        state.interval = interval;
        state.timer = Some(self.inner.spawn_timer(interval));

        tracing::info!(
            collections = self.inner.registry().len(),
            interval_ms = interval.as_millis() as u64,
            "replication scheduler started"
        );
    }

    /// Cancels the timer, the pending initial sync and every signal
    /// subscription. Re-syncs already in flight run to completion.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.running {
            return;
        }
        state.running = false;
        state.subscriptions.cancel_all();
        if let Some(initial) = state.initial.take() {
            initial.abort();
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
            let _ = timer.await;
        }
        tracing::info!("replication scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Current polling period.
    pub async fn interval(&self) -> Duration {
        self.inner.state.lock().await.interval
    }

    /// Replaces the polling timer.
    pub async fn set_interval(&self, interval: Duration) {
        self.inner.set_interval(interval).await;
    }

    /// Re-syncs every registered collection now.
    pub fn trigger_sync(&self, trigger: SyncTrigger) -> SyncDispatch {
        self.inner.trigger_sync(trigger)
    }

    /// Number of dispatches that reached at least one collection.
    pub fn dispatch_count(&self) -> u64 {
        self.inner.dispatches.load(Ordering::SeqCst)
    }

    /// Number of polling timer tasks currently alive.
    pub fn live_timers(&self) -> usize {
        self.inner.live_timers.load(Ordering::SeqCst)
    }

    pub async fn has_pending_initial_sync(&self) -> bool {
        self.inner.state.lock().await.initial.is_some()
    }
}

impl Drop for ReplicationScheduler {
    fn drop(&mut self) {
        // Tasks hold the inner state alive; abort them if stop() was skipped.
        if let Ok(mut state) = self.inner.state.try_lock() {
            state.subscriptions.cancel_all();
            if let Some(initial) = state.initial.take() {
                initial.abort();
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}

impl Inner {
    fn registry(&self) -> ReplicationRegistry {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn interval_for(&self, visibility: Visibility) -> Duration {
        match visibility {
            Visibility::Visible => self.config.active_interval,
            Visibility::Hidden => self.config.inactive_interval,
        }
    }

    fn spawn_timer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let live = LiveTimer::new(self.live_timers.clone());
        let inner = self.clone();
        tokio::spawn(async move {
            let _live = live;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.trigger_sync(SyncTrigger::Tick);
            }
        })
    }

    async fn set_interval(self: &Arc<Self>, interval: Duration) {
        let mut state = self.state.lock().await;
        if state.interval == interval && (state.timer.is_some() || !state.running) {
            return;
        }
        state.interval = interval;
        if !state.running {
            return;
        }

        if let Some(old) = state.timer.take() {
            old.abort();
            let _ = old.await;
        }
        state.timer = Some(self.spawn_timer(interval));
        tracing::debug!(interval_ms = interval.as_millis() as u64, "polling interval changed");
    }

    async fn on_signal(self: &Arc<Self>, event: PlatformEvent) {
        match event {
            PlatformEvent::Visibility(visibility) => {
                self.set_interval(self.interval_for(visibility)).await;
                if visibility == Visibility::Visible {
                    self.trigger_sync(SyncTrigger::Visible);
                }
            }
            PlatformEvent::Network(NetworkStatus::Online) => {
                self.trigger_sync(SyncTrigger::Online);
            }
            PlatformEvent::Network(NetworkStatus::Offline) => {
                tracing::debug!("offline, waiting for connectivity");
            }
            PlatformEvent::Focus => {
                self.trigger_sync(SyncTrigger::Focus);
            }
        }
    }

    fn trigger_sync(&self, trigger: SyncTrigger) -> SyncDispatch {
        let now = Instant::now();
        let since_last = {
            let mut last = self
                .last_dispatch
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            last.replace(now).map(|prev| now.duration_since(prev))
        };

        let registry = self.registry();
        if registry.is_empty() {
            tracing::debug!(?trigger, "no collections registered, nothing to sync");
            return SyncDispatch::default();
        }

        tracing::info!(
            ?trigger,
            collections = registry.len(),
            since_last_ms = since_last.map(|d| d.as_millis() as u64),
            "dispatching re-sync"
        );
        self.dispatches.fetch_add(1, Ordering::SeqCst);

        let tasks = registry
            .iter()
            .map(|(name, replicator)| {
                let name = name.to_string();
                let replicator = replicator.clone();
                tokio::spawn(async move {
                    match replicator.re_sync().await {
                        Ok(outcome) => {
                            tracing::debug!(collection = %name, ?outcome, "re-sync complete")
                        }
                        Err(e) if e.is_transient() => {
                            tracing::warn!(collection = %name, "re-sync failed: {}", e)
                        }
                        Err(e) => tracing::error!(collection = %name, "re-sync failed: {}", e),
                    }
                })
            })
            .collect();

        SyncDispatch { tasks }
    }
}

fn signal_name(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::Visibility => "visibility",
        SignalKind::Network => "network",
        SignalKind::Focus => "focus",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::testing::CountingReplicator;
    use std::sync::atomic::Ordering;

    struct Fixture {
        scheduler: ReplicationScheduler,
        platform: Platform,
        animals: Arc<CountingReplicator>,
        vaccines: Arc<CountingReplicator>,
    }

    fn fixture() -> Fixture {
        let animals = Arc::new(CountingReplicator::new("animals"));
        let vaccines = Arc::new(CountingReplicator::new("vaccines"));
        let mut registry = ReplicationRegistry::new();
        registry.register(animals.clone());
        registry.register(vaccines.clone());

        let platform = Platform::default();
        let scheduler =
            ReplicationScheduler::new(registry, platform.clone(), SchedulerConfig::default());
        Fixture {
            scheduler,
            platform,
            animals,
            vaccines,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_fires_once_after_delay() {
        let f = fixture();
        f.scheduler.start().await;
        assert!(f.scheduler.has_pending_initial_sync().await);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(f.animals.calls(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.animals.calls(), 1);
        assert_eq!(f.vaccines.calls(), 1);
        assert!(!f.scheduler.has_pending_initial_sync().await);

        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_active_interval() {
        let f = fixture();
        f.scheduler.start().await;

        // initial at 1s, ticks at 5s and 10s
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(f.animals.calls(), 3);
        assert_eq!(f.scheduler.live_timers(), 1);

        f.scheduler.stop().await;
        assert_eq!(f.scheduler.live_timers(), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.animals.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_switches_interval_without_syncing() {
        let f = fixture();
        f.scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(f.animals.calls(), 1);

        f.platform.set_visibility(Visibility::Hidden);
        settle().await;
        assert_eq!(f.scheduler.interval().await, Duration::from_secs(30));
        assert_eq!(f.animals.calls(), 1);
        assert_eq!(f.scheduler.live_timers(), 1);

        // The old 5s timer is gone; nothing fires until the 30s period ends.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(f.animals.calls(), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.animals.calls(), 2);

        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_forces_exactly_one_sync() {
        let f = fixture();
        f.platform.set_visibility(Visibility::Hidden);
        f.scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(f.scheduler.interval().await, Duration::from_secs(30));
        let before = f.scheduler.dispatch_count();

        f.platform.set_visibility(Visibility::Visible);
        settle().await;

        assert_eq!(f.scheduler.dispatch_count(), before + 1);
        assert_eq!(f.animals.calls(), 2);
        assert_eq!(f.vaccines.calls(), 2);
        assert_eq!(f.scheduler.interval().await, Duration::from_secs(5));
        assert_eq!(f.scheduler.live_timers(), 1);

        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_and_focus_trigger_offline_does_not() {
        let f = fixture();
        f.scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        f.platform.set_network(NetworkStatus::Offline);
        settle().await;
        assert_eq!(f.animals.calls(), 1);

        f.platform.set_network(NetworkStatus::Online);
        settle().await;
        assert_eq!(f.animals.calls(), 2);

        f.platform.focus();
        settle().await;
        assert_eq!(f.animals.calls(), 3);

        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_switches_never_stack_timers() {
        let f = fixture();
        f.scheduler.start().await;

        for _ in 0..10 {
            f.platform.set_visibility(Visibility::Hidden);
            settle().await;
            assert!(f.scheduler.live_timers() <= 1);
            f.platform.set_visibility(Visibility::Visible);
            settle().await;
            assert!(f.scheduler.live_timers() <= 1);
        }
        f.scheduler.set_interval(Duration::from_secs(2)).await;
        assert_eq!(f.scheduler.live_timers(), 1);

        f.scheduler.stop().await;
        assert_eq!(f.scheduler.live_timers(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_other_collections() {
        let f = fixture();
        f.animals.fail.store(true, Ordering::SeqCst);

        let dispatch = f.scheduler.trigger_sync(SyncTrigger::Manual);
        assert_eq!(dispatch.len(), 2);
        dispatch.join().await;

        assert_eq!(f.animals.calls(), 1);
        assert_eq!(f.vaccines.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_is_noop() {
        let scheduler = ReplicationScheduler::new(
            ReplicationRegistry::new(),
            Platform::default(),
            SchedulerConfig::default(),
        );
        assert!(scheduler.trigger_sync(SyncTrigger::Manual).is_empty());
        assert_eq!(scheduler.dispatch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_initial_sync() {
        let f = fixture();
        f.scheduler.start().await;
        f.scheduler.stop().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.animals.calls(), 0);
        assert!(!f.scheduler.is_running().await);
    }
}
