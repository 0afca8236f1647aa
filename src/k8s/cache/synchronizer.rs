/**
 * Resource synchronizer
 *
 * Lists a collection once, keeps the result current from a watch stream,
 * re-lists on a timer to heal anything the watch missed, and only tells
 * observers about changes once the first listing is in the cache.
 */
use super::config::SyncConfig;
use super::data_cache::{CacheStats, ResourceCache};
use super::errors::already_started_error;
use super::ready_gate::ReadyGate;
use super::subscription::{ChannelObserver, ObserverSet, ResourceEvent, ResourceObserver};
use crate::error::{Error, Result};
use crate::k8s::registry::{
    ResourceKey, ResourceKind, ResourceRecord, ResourceRegistry, WatchEvent, WatchStream,
};
use futures::StreamExt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives sync failures, observer panics and non-fatal registry errors
pub type ErrorReporter = Arc<dyn Fn(&Error) + Send + Sync>;

fn log_error(err: &Error) {
    error!("❌ Resource synchronizer: {}", err);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchConnectionStatus {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub connection_status: WatchConnectionStatus,
    pub watch_restarts: u64,
    pub resyncs: u64,
    /// Changes that altered the cache, before or after ready
    pub events_applied: u64,
    pub events_dispatched: u64,
    pub observer_panics: u64,
}

/// Keeps a local copy of one remote collection and reports live changes
///
/// ```ignore
/// let sync = ResourceSynchronizer::new(registry, kind, None, Duration::from_secs(60))?;
/// sync.register_observer(Arc::new(ObserverFns::new().on_add(|r| println!("{}", r.key))));
/// sync.start(cancel.clone())?;
/// if !sync.wait_until_ready(&cancel).await {
///     // cancelled, or the initial listing failed and the deadline fired
/// }
/// ```
pub struct ResourceSynchronizer {
    registry: Arc<dyn ResourceRegistry>,
    kind: ResourceKind,
    namespace: Option<String>,
    config: SyncConfig,
    cache: Arc<ResourceCache>,
    gate: Arc<ReadyGate>,
    observers: Arc<ObserverSet>,
    stats: Arc<RwLock<SyncStats>>,
    reporter: ErrorReporter,
    started: AtomicBool,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceSynchronizer {
    /// Create a synchronizer for `kind`, optionally limited to one namespace
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the registry handle is unusable, the
    /// kind is malformed or `resync_interval` is zero
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        kind: ResourceKind,
        namespace: Option<String>,
        resync_interval: Duration,
    ) -> Result<Self> {
        Self::with_config(
            registry,
            kind,
            namespace,
            SyncConfig::with_resync_interval(resync_interval),
        )
    }

    /// # Errors
    ///
    /// Same as [`ResourceSynchronizer::new`], plus an invalid backoff range
    pub fn with_config(
        registry: Arc<dyn ResourceRegistry>,
        kind: ResourceKind,
        namespace: Option<String>,
        config: SyncConfig,
    ) -> Result<Self> {
        registry.validate()?;
        kind.validate()?;
        config.validate()?;

        Ok(Self {
            registry,
            kind,
            namespace,
            config,
            cache: Arc::new(ResourceCache::new()),
            gate: Arc::new(ReadyGate::new()),
            observers: Arc::new(ObserverSet::new()),
            stats: Arc::new(RwLock::new(SyncStats::default())),
            reporter: Arc::new(log_error),
            started: AtomicBool::new(false),
            task_handle: Mutex::new(None),
        })
    }

    /// Replace the default hook, which logs through `tracing`
    #[must_use]
    pub fn with_error_reporter(mut self, reporter: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    #[must_use]
    pub const fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Add an observer
    ///
    /// Register before [`start`](Self::start); an observer added later may
    /// miss changes that were dispatched in between.
    pub fn register_observer(&self, observer: Arc<dyn ResourceObserver>) {
        self.observers.register(observer);
    }

    /// Register a [`ChannelObserver`] and return its receiving end
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ResourceEvent> {
        let (observer, receiver) = ChannelObserver::new();
        debug!("Subscribed channel observer {} to {}", observer.id, self.kind);
        self.register_observer(Arc::new(observer));
        receiver
    }

    /// Launch the background listing/watch task and return right away
    ///
    /// The task runs until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when called twice or outside a tokio runtime
    pub fn start(&self, cancel: CancellationToken) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::Configuration(format!("synchronizer must be started inside a tokio runtime: {e}"))
        })?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(already_started_error(&self.kind));
        }

        let driver = Driver {
            registry: self.registry.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            config: self.config.clone(),
            cache: self.cache.clone(),
            gate: self.gate.clone(),
            observers: self.observers.clone(),
            stats: self.stats.clone(),
            reporter: self.reporter.clone(),
            cancel,
        };
        let handle = runtime.spawn(driver.run());
        *self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Wait for the initial listing to land in the cache
    ///
    /// Returns `true` once ready, `false` if `cancel` fires first (or had
    /// already fired). Does not poll.
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> bool {
        self.gate.wait(cancel).await
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.cache.get(key)
    }

    /// Current cache content, ordered by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        self.cache.snapshot()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for the background task to finish after cancellation
    pub async fn join(&self) {
        let handle = self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("❌ {} synchronizer task ended abnormally: {}", self.kind, e);
            }
        }
    }
}

enum StreamEnd {
    Closed,
    Failed,
    Resync,
}

/// State moved into the background task
struct Driver {
    registry: Arc<dyn ResourceRegistry>,
    kind: ResourceKind,
    namespace: Option<String>,
    config: SyncConfig,
    cache: Arc<ResourceCache>,
    gate: Arc<ReadyGate>,
    observers: Arc<ObserverSet>,
    stats: Arc<RwLock<SyncStats>>,
    reporter: ErrorReporter,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self) {
        info!(
            "🔍 Starting {} synchronizer ({})",
            self.kind,
            self.namespace.as_deref().unwrap_or("all namespaces")
        );

        if let ControlFlow::Continue(resume_token) = self.initial_sync().await {
            self.watch_loop(resume_token).await;
        }

        self.update_stats(|stats| stats.connection_status = WatchConnectionStatus::Disconnected);
        info!("🛑 {} synchronizer stopped", self.kind);
    }

    /// List everything, absorb it silently, then open the gate
    async fn initial_sync(&self) -> ControlFlow<(), Option<String>> {
        let listing = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!("{} synchronizer cancelled before the initial listing completed", self.kind);
                return ControlFlow::Break(());
            }
            result = self.registry.list(&self.kind, self.namespace.as_deref()) => result,
        };

        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                (self.reporter)(&Error::SyncFailure(Box::new(e)));
                return ControlFlow::Break(());
            }
        };

        let count = listing.records.len();
        for record in listing.records {
            if self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            self.cache.insert(record);
        }
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }

        self.gate.open();
        info!("✅ {} synced, {} object(s) in cache", self.kind, count);
        ControlFlow::Continue(listing.resume_token)
    }

    async fn watch_loop(&self, mut resume_token: Option<String>) {
        let period = self.config.resync_interval;
        let mut resync = interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = self.config.initial_backoff;

        loop {
            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                result = self.registry.watch(
                    &self.kind,
                    self.namespace.as_deref(),
                    resume_token.as_deref(),
                ) => result,
            };

            let mut stream = match opened {
                Ok(stream) => {
                    self.update_stats(|stats| stats.connection_status = WatchConnectionStatus::Connected);
                    debug!("{} watch opened at {:?}", self.kind, resume_token);
                    stream
                }
                Err(e) => {
                    warn!("❌ {} watch could not be opened: {}, retrying in {:?}", self.kind, e, backoff);
                    (self.reporter)(&e);
                    if self.recover(&mut resume_token, &mut backoff).await.is_break() {
                        return;
                    }
                    continue;
                }
            };

            let end = self
                .consume(&mut stream, &mut resync, &mut resume_token, &mut backoff)
                .await;
            // Release the subscription before anything else happens.
            drop(stream);

            let flow = match end {
                ControlFlow::Break(()) => return,
                ControlFlow::Continue(StreamEnd::Resync) => self.resync(&mut resume_token).await,
                ControlFlow::Continue(StreamEnd::Closed) => {
                    self.note_restart();
                    self.pause(&mut backoff).await
                }
                ControlFlow::Continue(StreamEnd::Failed) => {
                    self.note_restart();
                    self.recover(&mut resume_token, &mut backoff).await
                }
            };
            if flow.is_break() {
                return;
            }
        }
    }

    /// Apply watch events until the stream ends, fails, or a resync is due
    async fn consume(
        &self,
        stream: &mut WatchStream,
        resync: &mut Interval,
        resume_token: &mut Option<String>,
        backoff: &mut Duration,
    ) -> ControlFlow<(), StreamEnd> {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return ControlFlow::Break(()),
                _ = resync.tick() => return ControlFlow::Continue(StreamEnd::Resync),
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        *backoff = self.config.initial_backoff;
                        if let Some(version) = &event.record.resource_version {
                            *resume_token = Some(version.clone());
                        }
                        self.apply(event);
                    }
                    Some(Err(e)) => {
                        warn!("❌ {} watch stream failed: {}", self.kind, e);
                        (self.reporter)(&e);
                        return ControlFlow::Continue(StreamEnd::Failed);
                    }
                    None => {
                        debug!("🔍 {} watch stream ended normally, re-watching in {:?}", self.kind, backoff);
                        return ControlFlow::Continue(StreamEnd::Closed);
                    }
                },
            }
        }
    }

    /// Sleep for the current backoff and grow it
    ///
    /// The backoff only shrinks back once a stream delivers an event.
    async fn pause(&self, backoff: &mut Duration) -> ControlFlow<()> {
        self.update_stats(|stats| stats.connection_status = WatchConnectionStatus::Reconnecting);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return ControlFlow::Break(()),
            () = sleep(*backoff) => {}
        }
        *backoff = self.config.next_backoff(*backoff);
        ControlFlow::Continue(())
    }

    /// Back off, then re-list so the next watch starts from a known state
    async fn recover(&self, resume_token: &mut Option<String>, backoff: &mut Duration) -> ControlFlow<()> {
        self.pause(backoff).await?;
        self.resync(resume_token).await
    }

    /// Re-list and apply only the net difference to the cache
    async fn resync(&self, resume_token: &mut Option<String>) -> ControlFlow<()> {
        let listing = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return ControlFlow::Break(()),
            result = self.registry.list(&self.kind, self.namespace.as_deref()) => result,
        };
        self.update_stats(|stats| stats.resyncs += 1);

        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                warn!("⚠️  {} resync listing failed, keeping current cache", self.kind);
                (self.reporter)(&e);
                return ControlFlow::Continue(());
            }
        };

        let changes = self.cache.diff(&listing.records);
        if changes.is_empty() {
            debug!("🔄 {} resync found no drift", self.kind);
        } else {
            info!("🔄 {} resync healing {} change(s)", self.kind, changes.len());
        }
        for change in changes {
            if self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            self.apply(change);
        }

        if listing.resume_token.is_some() {
            *resume_token = listing.resume_token;
        }
        ControlFlow::Continue(())
    }

    fn apply(&self, event: WatchEvent) {
        let Some(change) = self.cache.apply(event) else {
            return;
        };
        self.update_stats(|stats| stats.events_applied += 1);

        if !self.gate.is_ready() {
            return;
        }

        let panics = self.observers.dispatch(&change);
        self.update_stats(|stats| {
            stats.events_dispatched += 1;
            stats.observer_panics += panics.len() as u64;
        });
        for panic in &panics {
            (self.reporter)(panic);
        }
    }

    fn note_restart(&self) {
        self.update_stats(|stats| {
            stats.watch_restarts += 1;
            stats.connection_status = WatchConnectionStatus::Reconnecting;
        });
    }

    fn update_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.write().unwrap_or_else(PoisonError::into_inner));
    }
}
