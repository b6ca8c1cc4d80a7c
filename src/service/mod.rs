//! Service coordinator: one entry point for every vector store operation.
//!
//! Owns the connection (client plus both collection handles), the circuit
//! breaker, the offline queue, the query cache and the dimension tracker.
//! Writes that cannot reach the server are queued and replayed once the
//! breaker closes; reads degrade to empty results instead of failing.

pub mod dimension;
pub mod events;
pub mod index_metadata;
pub mod inflight;
mod reads;
mod writes;

pub use dimension::DimensionTracker;
pub use events::ServiceEvent;
pub use index_metadata::IndexMetadata;
pub use inflight::InflightQueries;
pub use reads::CachedRead;
pub use writes::WriteOutcome;

use crate::cache::{keys, InvalidationBus, QueryCache};
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::observability::health::{
    check_health_via_client, check_health_via_http, create_health_check_interval, ComponentHealth, HealthCheckFn,
    HealthMonitor, HealthStatus, ServiceHealth,
};
use crate::queue::{FlushResult, OfflineQueue, QueueConfig, QueueSnapshot};
use crate::scheduler::IntervalHandle;
use crate::vector_db::{
    ChromaStoreFactory, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, CollectionHandle,
    CollectionKind, StateTransition, StoreFactory, VectorStore,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Re-initializations allowed per call when the server forgot a collection
const MAX_NOT_FOUND_RECOVERIES: usize = 2;

/// Lifecycle of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Client and collection handles, always replaced together
pub(crate) struct Connection {
    pub(crate) store: Arc<dyn VectorStore>,
    pub(crate) files: CollectionHandle,
    pub(crate) folders: CollectionHandle,
}

impl Connection {
    pub(crate) fn handle(&self, kind: CollectionKind) -> &CollectionHandle {
        match kind {
            CollectionKind::Files => &self.files,
            CollectionKind::Folders => &self.folders,
        }
    }

    fn with_handle(&self, kind: CollectionKind, handle: CollectionHandle) -> Self {
        let (files, folders) = match kind {
            CollectionKind::Files => (handle, self.folders.clone()),
            CollectionKind::Folders => (self.files.clone(), handle),
        };
        Self {
            store: self.store.clone(),
            files,
            folders,
        }
    }
}

type InitFlight = Shared<BoxFuture<'static, Result<()>>>;

/// Record counts per collection
#[derive(Debug, Clone, Serialize)]
pub struct CollectionCounts {
    pub files: usize,
    pub folders: usize,
}

/// Known dimension per collection
#[derive(Debug, Clone, Serialize)]
pub struct DimensionSnapshot {
    pub files: Option<usize>,
    pub folders: Option<usize>,
}

/// Everything `get_stats` reports
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub state: InitState,
    pub server_url: String,
    pub circuit: CircuitBreakerStats,
    pub queue: QueueSnapshot,
    pub cache: crate::cache::CacheStats,
    pub dimensions: DimensionSnapshot,
    /// `None` when the server could not be asked
    pub counts: Option<CollectionCounts>,
    pub inflight_queries: usize,
}

pub(crate) struct ServiceInner {
    pub(crate) config: Config,
    factory: Arc<dyn StoreFactory>,
    state: RwLock<InitState>,
    connection: RwLock<Option<Arc<Connection>>>,
    init_flight: tokio::sync::Mutex<Option<InitFlight>>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) queue: OfflineQueue,
    pub(crate) cache: Arc<QueryCache<CachedRead>>,
    bus: InvalidationBus,
    pub(crate) inflight: InflightQueries<CachedRead>,
    pub(crate) dimensions: DimensionTracker,
    events: broadcast::Sender<ServiceEvent>,
    http: reqwest::Client,
    monitor: Mutex<Option<HealthMonitor>>,
    sweeper: Mutex<Option<IntervalHandle>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    bus_listener: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Resilient access layer over a remote vector store
#[derive(Clone)]
pub struct VectorDbService {
    inner: Arc<ServiceInner>,
}

impl VectorDbService {
    /// Build the coordinator. Nothing is contacted until `initialize` or the
    /// first operation; a persisted offline queue is loaded here.
    pub async fn new(config: Config, factory: Arc<dyn StoreFactory>) -> Result<Self> {
        config.validate()?;

        let queue = OfflineQueue::load(QueueConfig::from(&config.queue)).await;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.health.check_timeout_ms))
            .build()
            .map_err(|e| ServiceError::Config(format!("HTTP client: {}", e)))?;
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(ServiceInner {
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from(&config.circuit_breaker)),
            cache: Arc::new(QueryCache::from_settings(&config.cache)),
            bus: InvalidationBus::default(),
            inflight: InflightQueries::new(config.query.max_inflight),
            dimensions: DimensionTracker::new(),
            factory,
            state: RwLock::new(InitState::Uninitialized),
            connection: RwLock::new(None),
            init_flight: tokio::sync::Mutex::new(None),
            queue,
            events,
            http,
            monitor: Mutex::new(None),
            sweeper: Mutex::new(None),
            listener: Mutex::new(None),
            bus_listener: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            config,
        });

        *inner.listener.lock() = Some(spawn_breaker_listener(&inner));
        *inner.bus_listener.lock() = Some(inner.bus.attach(&inner.cache));

        if inner.config.cache.sweep_interval_ms > 0 {
            let sweeper = inner
                .cache
                .spawn_sweeper(Duration::from_millis(inner.config.cache.sweep_interval_ms));
            *inner.sweeper.lock() = Some(sweeper);
        }

        if inner.config.health.interval_ms > 0 {
            *inner.monitor.lock() = Some(spawn_health_monitor(&inner));
        }

        if !inner.queue.is_empty() {
            info!("{} operations waiting from a previous run", inner.queue.len());
        }

        Ok(Self { inner })
    }

    /// Coordinator talking to the configured server over HTTP
    pub async fn connect(config: Config) -> Result<Self> {
        let factory = Arc::new(ChromaStoreFactory::new(config.timeouts.operation()));
        Self::new(config, factory).await
    }

    /// Connect and open both collections. Concurrent calls share one attempt;
    /// when already ready, an unhealthy connection is rebuilt.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.initialize(false).await
    }

    pub fn state(&self) -> InitState {
        *self.inner.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == InitState::Ready
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    pub fn cache(&self) -> &QueryCache<CachedRead> {
        &self.inner.cache
    }

    /// Publish here to drop cached reads after changes made outside this service
    pub fn invalidation_bus(&self) -> &InvalidationBus {
        &self.inner.bus
    }

    /// Known embedding dimension of a collection
    pub fn collection_dimension(&self, kind: CollectionKind) -> Option<usize> {
        self.inner.dimensions.get(kind)
    }

    /// Replay queued writes now
    pub async fn flush_offline_queue(&self) -> Result<FlushResult> {
        self.inner.flush_queue().await
    }

    pub async fn get_stats(&self) -> ServiceStats {
        let inner = &self.inner;
        let counts = inner.remote_counts().await;
        let circuit = inner.breaker.stats();
        let state = *inner.state.read();

        ServiceStats {
            state,
            server_url: inner.config.server.base_url(),
            circuit,
            queue: inner.queue.stats(),
            cache: inner.cache.stats(),
            dimensions: DimensionSnapshot {
                files: inner.dimensions.get(CollectionKind::Files),
                folders: inner.dimensions.get(CollectionKind::Folders),
            },
            counts,
            inflight_queries: inner.inflight.len(),
        }
    }

    /// Server, breaker and queue health
    pub async fn check_health(&self) -> ServiceHealth {
        let inner = &self.inner;
        let mut components = Vec::new();

        let started = Instant::now();
        let timeout = Duration::from_millis(inner.config.health.check_timeout_ms);
        let server = match inner.current_connection() {
            Some(conn) => {
                if check_health_via_client(conn.store.as_ref(), timeout).await {
                    ComponentHealth::new("vector_db", HealthStatus::Healthy, "Heartbeat OK")
                } else {
                    ComponentHealth::new("vector_db", HealthStatus::Unhealthy, "Heartbeat failed")
                }
            }
            None => {
                let probe = check_health_via_http(
                    &inner.http,
                    &inner.config.server.base_url(),
                    Duration::from_millis(inner.config.health.http_timeout_ms),
                )
                .await;
                match probe.endpoint {
                    Some(endpoint) if probe.healthy => ComponentHealth::new(
                        "vector_db",
                        HealthStatus::Degraded,
                        format!("Reachable via {}, not initialized", endpoint),
                    ),
                    _ => ComponentHealth::new("vector_db", HealthStatus::Unhealthy, "Server unreachable"),
                }
            }
        };
        components.push(server.with_response_time(started.elapsed()));

        let circuit = inner.breaker.state();
        let status = match circuit {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Open => HealthStatus::Unhealthy,
        };
        components.push(ComponentHealth::new("circuit_breaker", status, circuit.as_str()));

        let waiting = inner.queue.len();
        components.push(if waiting == 0 {
            ComponentHealth::new("offline_queue", HealthStatus::Healthy, "Empty")
        } else {
            ComponentHealth::new(
                "offline_queue",
                HealthStatus::Degraded,
                format!("{} operations waiting", waiting),
            )
        });

        ServiceHealth::from_components(components)
    }

    /// Delete and recreate the files collection
    pub async fn reset_files(&self) -> Result<()> {
        self.inner.reset_collection(CollectionKind::Files).await
    }

    /// Delete and recreate the folders collection
    pub async fn reset_folders(&self) -> Result<()> {
        self.inner.reset_collection(CollectionKind::Folders).await
    }

    pub async fn reset_all(&self) -> Result<()> {
        self.inner.reset_collection(CollectionKind::Files).await?;
        self.inner.reset_collection(CollectionKind::Folders).await
    }

    /// Stop background tasks and save the offline queue
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down vector store service");

        if let Some(monitor) = inner.monitor.lock().take() {
            monitor.stop();
        }
        if let Some(sweeper) = inner.sweeper.lock().take() {
            sweeper.stop();
        }
        if let Some(listener) = inner.listener.lock().take() {
            listener.abort();
        }
        if let Some(listener) = inner.bus_listener.lock().take() {
            listener.abort();
        }

        inner.queue.shutdown().await?;
        info!("Service shut down, {} operations left queued", inner.queue.len());
        Ok(())
    }
}

impl ServiceInner {
    pub(crate) fn emit(&self, event: ServiceEvent) {
        debug!("Event: {}", event.name());
        let _ = self.events.send(event);
    }

    pub(crate) fn current_connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }

    fn set_state(&self, state: InitState) {
        *self.state.write() = state;
    }

    /// Shared initialization; `force` skips the health shortcut when ready
    pub(crate) async fn initialize(self: &Arc<Self>, force: bool) -> Result<()> {
        if !force && *self.state.read() == InitState::Ready {
            if let Some(conn) = self.current_connection() {
                if check_health_via_client(conn.store.as_ref(), self.config.timeouts.operation()).await {
                    return Ok(());
                }
            }
            warn!("Vector store connection unhealthy, reinitializing");
        }

        let attempt = {
            let mut flight = self.init_flight.lock().await;
            match flight.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let inner = self.clone();
                    let attempt = async move { inner.run_initialization().await }.boxed().shared();
                    *flight = Some(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;

        let mut flight = self.init_flight.lock().await;
        if flight.as_ref().map(|f| f.ptr_eq(&attempt)).unwrap_or(false) {
            *flight = None;
        }
        result
    }

    async fn run_initialization(self: Arc<Self>) -> Result<()> {
        self.set_state(InitState::Initializing);
        let server_url = self.config.server.base_url();
        info!("Initializing vector store connection to {}", server_url);

        if self.config.server.is_insecure_remote() {
            let message = format!(
                "Connecting to remote host {} over plain HTTP; embeddings and metadata travel unencrypted",
                self.config.server.effective_host()
            );
            warn!("{}", message);
            self.emit(ServiceEvent::SecurityWarning { message });
        }

        let timeout = self.config.timeouts.init();
        let result = with_timeout("initialize", timeout, self.establish()).await;

        match result {
            Ok(conn) => {
                *self.connection.write() = Some(Arc::new(conn));
                self.set_state(InitState::Ready);
                info!("Vector store ready at {}", server_url);
                Ok(())
            }
            Err(e) => {
                self.set_state(InitState::Failed);
                warn!("Vector store initialization failed: {}", e);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Connection> {
        let store = self.factory.connect(&self.config.server).await?;
        let timeout = self.config.timeouts.operation();
        with_timeout("heartbeat", timeout, store.heartbeat()).await?;

        let (files, folders) = match self.open_collections(store.as_ref()).await {
            Ok(handles) => handles,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => self.recover_from_corruption(store.as_ref(), e).await?,
        };

        self.learn_dimension(store.as_ref(), CollectionKind::Files, &files).await;
        self.learn_dimension(store.as_ref(), CollectionKind::Folders, &folders).await;

        Ok(Connection { store, files, folders })
    }

    async fn open_collections(&self, store: &dyn VectorStore) -> Result<(CollectionHandle, CollectionHandle)> {
        let timeout = self.config.timeouts.operation();
        let files = with_timeout(
            "get_or_create_collection",
            timeout,
            store.get_or_create_collection(&self.config.server.files_collection),
        )
        .await?;
        let folders = with_timeout(
            "get_or_create_collection",
            timeout,
            store.get_or_create_collection(&self.config.server.folders_collection),
        )
        .await?;
        Ok((files, folders))
    }

    /// Heartbeat answered but collections cannot be opened
    async fn recover_from_corruption(
        &self,
        store: &dyn VectorStore,
        cause: ServiceError,
    ) -> Result<(CollectionHandle, CollectionHandle)> {
        let auto_reset = self.config.recovery.auto_reset_on_corruption;
        error!("Server is healthy but collection setup failed: {}", cause);
        self.emit(ServiceEvent::CorruptionSuspected {
            error: cause.to_string(),
            auto_reset,
        });

        if !auto_reset {
            return Err(cause);
        }

        warn!("Recreating collections; stored embeddings will be lost");
        let timeout = self.config.timeouts.operation();
        for name in [&self.config.server.files_collection, &self.config.server.folders_collection] {
            match with_timeout("delete_collection", timeout, store.delete_collection(name)).await {
                Ok(()) => info!("Deleted collection {}", name),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Could not delete collection {}: {}", name, e),
            }
        }
        self.dimensions.forget(CollectionKind::Files);
        self.dimensions.forget(CollectionKind::Folders);
        self.cache.clear();

        self.open_collections(store).await
    }

    /// Take the dimension from a stored vector; an empty collection has none
    async fn learn_dimension(&self, store: &dyn VectorStore, kind: CollectionKind, handle: &CollectionHandle) {
        let timeout = self.config.timeouts.operation();
        let count = match with_timeout("count", timeout, store.count(handle)).await {
            Ok(count) => count,
            Err(e) => {
                debug!("Could not count {}: {}", kind, e);
                return;
            }
        };

        if count == 0 {
            self.dimensions.forget(kind);
            return;
        }

        match with_timeout("get", timeout, store.get(handle, None, Some(1), true)).await {
            Ok(records) => {
                if let Some(dim) = records.first().map(|r| r.dimension()).filter(|d| *d > 0) {
                    debug!("{} collection holds {}-dimensional vectors", kind, dim);
                    self.dimensions.learn(kind, dim);
                }
            }
            Err(e) => debug!("Could not sample {}: {}", kind, e),
        }
    }

    pub(crate) async fn connection_or_init(self: &Arc<Self>) -> Result<Arc<Connection>> {
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }
        self.initialize(false).await?;
        self.current_connection()
            .ok_or_else(|| ServiceError::NotInitialized("no connection after initialization".to_string()))
    }

    /// Run `call` against the current connection, retrying transient failures
    /// with backoff and rebuilding the connection when the server no longer
    /// knows a collection.
    pub(crate) async fn call<T, F>(self: &Arc<Self>, operation: &str, mut request: F) -> Result<T>
    where
        F: FnMut(Arc<Connection>) -> BoxFuture<'static, Result<T>>,
    {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut recoveries = 0;
        let mut attempt = 1;
        let mut delay = Duration::from_millis(retry.base_delay_ms);

        loop {
            let result = match self.connection_or_init().await {
                Ok(conn) => request(conn).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_not_found() && recoveries < MAX_NOT_FOUND_RECOVERIES => {
                    recoveries += 1;
                    warn!(
                        "{}: collection missing on server, reinitializing ({}/{})",
                        operation, recoveries, MAX_NOT_FOUND_RECOVERIES
                    );
                    self.initialize(true).await?;
                }
                Err(e) if e.is_transient() && !e.is_not_found() && attempt < max_attempts => {
                    debug!("{} attempt {} failed: {}", operation, attempt, e);
                    tokio::time::sleep(with_jitter(delay)).await;
                    delay = (delay * 2).min(Duration::from_millis(retry.max_delay_ms));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `call` behind the circuit breaker; exactly one outcome is recorded
    pub(crate) async fn guarded<T, F>(self: &Arc<Self>, operation: &str, request: F) -> Result<T>
    where
        F: FnMut(Arc<Connection>) -> BoxFuture<'static, Result<T>>,
    {
        // held across the call so a cancelled caller still settles its trial slot
        let Some(permit) = self.breaker.acquire() else {
            return Err(ServiceError::CircuitOpen);
        };

        let result = self.call(operation, request).await;
        match &result {
            Err(e) if e.is_transient() => permit.failure(&e.to_string()),
            // a definite answer from the server, even a refusal, means it is up
            _ => permit.success(),
        }
        result
    }

    pub(crate) async fn flush_queue(self: &Arc<Self>) -> Result<FlushResult> {
        if self.queue.is_empty() {
            return Ok(FlushResult::default());
        }
        let replay = writes::QueueReplay::new(self.clone());
        let result = self.queue.flush(&replay).await?;
        self.emit(ServiceEvent::QueueFlushed(result.clone()));
        Ok(result)
    }

    fn spawn_flush(self: &Arc<Self>, reason: &'static str) {
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.flush_queue().await {
                Ok(result) if result.processed > 0 || result.failed > 0 => {
                    info!("Queue flush after {}: {:?}", reason, result);
                }
                Ok(_) => {}
                Err(e) => debug!("Queue flush after {} skipped: {}", reason, e),
            }
        });
    }

    async fn on_transition(self: &Arc<Self>, transition: StateTransition) {
        info!(
            "Circuit breaker {} -> {}",
            transition.from.as_str(),
            transition.to.as_str()
        );
        self.emit(ServiceEvent::CircuitStateChange {
            from: transition.from,
            to: transition.to,
        });

        match transition.to {
            CircuitState::Open => {
                let stats = self.breaker.stats();
                self.emit(ServiceEvent::Offline {
                    reason: stats.last_failure,
                });
            }
            CircuitState::HalfOpen => self.emit(ServiceEvent::Recovering),
            CircuitState::Closed => {
                self.emit(ServiceEvent::Online);
                if !self.queue.is_empty() {
                    self.spawn_flush("recovery");
                }
            }
        }
    }

    /// Periodic check: heartbeat (or connect), then replay anything queued.
    ///
    /// The heartbeat is also a breaker call, so an idle service still closes
    /// an open breaker once the server is back, and opens it when it is not.
    async fn monitor_tick(self: Arc<Self>) -> bool {
        let timeout = Duration::from_millis(self.config.health.check_timeout_ms);
        let healthy = match self.current_connection() {
            Some(conn) => check_health_via_client(conn.store.as_ref(), timeout).await,
            None => self.initialize(false).await.is_ok(),
        };

        let settled = healthy && self.breaker.state() == CircuitState::Closed;
        if !settled {
            if let Some(permit) = self.breaker.acquire() {
                if healthy {
                    permit.success();
                } else {
                    permit.failure("health check failed");
                }
            }
        }

        if healthy && !self.queue.is_empty() && !self.queue.is_flushing() {
            self.spawn_flush("health check");
        }
        healthy
    }

    async fn remote_counts(self: &Arc<Self>) -> Option<CollectionCounts> {
        let conn = self.current_connection()?;
        if self.breaker.state() == CircuitState::Open {
            return None;
        }
        let timeout = self.config.timeouts.operation();
        let files = with_timeout("count", timeout, conn.store.count(&conn.files)).await;
        let folders = with_timeout("count", timeout, conn.store.count(&conn.folders)).await;
        match (files, folders) {
            (Ok(files), Ok(folders)) => Some(CollectionCounts { files, folders }),
            (Err(e), _) | (_, Err(e)) => {
                debug!("Could not count collections: {}", e);
                None
            }
        }
    }

    async fn reset_collection(self: &Arc<Self>, kind: CollectionKind) -> Result<()> {
        let conn = self.connection_or_init().await?;
        let name = conn.handle(kind).name.clone();
        let timeout = self.config.timeouts.operation();
        warn!("Resetting {} collection {}", kind, name);

        match with_timeout("delete_collection", timeout, conn.store.delete_collection(&name)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Collection {} already gone", name),
            Err(e) => return Err(e),
        }
        let handle = with_timeout(
            "get_or_create_collection",
            timeout,
            conn.store.get_or_create_collection(&name),
        )
        .await?;

        *self.connection.write() = Some(Arc::new(conn.with_handle(kind, handle)));
        self.dimensions.forget(kind);
        let prefix = match kind {
            CollectionKind::Files => keys::FILES_PREFIX,
            CollectionKind::Folders => keys::FOLDERS_PREFIX,
        };
        self.cache.invalidate_for_category(prefix);
        if kind == CollectionKind::Files {
            // folder lookups by file id read file vectors
            self.cache.invalidate_for_category("folders:file:");
        }
        info!("Collection {} recreated", name);
        Ok(())
    }
}

/// Forward breaker transitions to the coordinator until it is dropped
fn spawn_breaker_listener(inner: &Arc<ServiceInner>) -> JoinHandle<()> {
    let mut transitions = inner.breaker.subscribe();
    let weak: Weak<ServiceInner> = Arc::downgrade(inner);

    tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(transition) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.on_transition(transition).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Missed {} breaker transitions", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_health_monitor(inner: &Arc<ServiceInner>) -> HealthMonitor {
    let weak: Weak<ServiceInner> = Arc::downgrade(inner);
    let check: HealthCheckFn = Arc::new(move || {
        let weak = weak.clone();
        async move {
            match weak.upgrade() {
                Some(inner) => inner.monitor_tick().await,
                None => false,
            }
        }
        .boxed()
    });

    create_health_check_interval(
        check,
        Duration::from_millis(inner.config.health.interval_ms),
        Duration::from_millis(inner.config.health.check_timeout_ms),
    )
}

/// Bound a remote call; running out of time is a transient failure
pub(crate) async fn with_timeout<T>(
    operation: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Up to half the delay again, so retrying callers spread out
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64) / 2;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_db::{EmbeddingRecord, InMemoryStore, SharedStoreFactory};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.health.interval_ms = 0;
        config.cache.sweep_interval_ms = 0;
        config.retry.max_attempts = 1;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.success_threshold = 1;
        config.circuit_breaker.reset_timeout_ms = 50;
        config.queue.batch_delay_ms = 0;
        config.timeouts.operation_ms = 1_000;
        config
    }

    struct CountingFactory {
        store: Arc<dyn VectorStore>,
        connects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StoreFactory for CountingFactory {
        async fn connect(&self, _config: &crate::config::ServerConfig) -> Result<Arc<dyn VectorStore>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.store.clone())
        }
    }

    /// A server that has forgotten every collection it hands out
    struct ForgetfulStore {
        inner: InMemoryStore,
        upserts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl VectorStore for ForgetfulStore {
        async fn heartbeat(&self) -> Result<u64> {
            self.inner.heartbeat().await
        }

        async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle> {
            self.inner.get_or_create_collection(name).await
        }

        async fn delete_collection(&self, name: &str) -> Result<()> {
            self.inner.delete_collection(name).await
        }

        async fn upsert(&self, collection: &CollectionHandle, _records: Vec<EmbeddingRecord>) -> Result<()> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::VectorDbError::CollectionNotFound(format!(
                "Collection {} does not exist.",
                collection.id
            ))
            .into())
        }

        async fn query(
            &self,
            collection: &CollectionHandle,
            params: crate::vector_db::QueryParams,
        ) -> Result<Vec<crate::vector_db::QueryMatch>> {
            self.inner.query(collection, params).await
        }

        async fn get(
            &self,
            collection: &CollectionHandle,
            ids: Option<Vec<String>>,
            limit: Option<usize>,
            include_vectors: bool,
        ) -> Result<Vec<EmbeddingRecord>> {
            self.inner.get(collection, ids, limit, include_vectors).await
        }

        async fn delete(&self, collection: &CollectionHandle, ids: Vec<String>) -> Result<()> {
            self.inner.delete(collection, ids).await
        }

        async fn count(&self, collection: &CollectionHandle) -> Result<usize> {
            self.inner.count(collection).await
        }
    }

    async fn service_with(store: &Arc<InMemoryStore>) -> VectorDbService {
        let factory = Arc::new(SharedStoreFactory::new(store.clone()));
        VectorDbService::new(test_config(), factory).await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready() {
        let store = Arc::new(InMemoryStore::new());
        let service = service_with(&store).await;
        assert_eq!(service.state(), InitState::Uninitialized);

        service.initialize().await.unwrap();
        assert!(service.is_ready());
        assert!(service.check_health().await.is_healthy());
    }

    #[tokio::test]
    async fn test_concurrent_initialize_connects_once() {
        let store = Arc::new(InMemoryStore::new());
        let factory = Arc::new(CountingFactory {
            store,
            connects: AtomicUsize::new(0),
        });
        let service = VectorDbService::new(test_config(), factory.clone()).await.unwrap();

        let (a, b, c) = tokio::join!(service.initialize(), service.initialize(), service.initialize());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_unreachable() {
        let store = Arc::new(InMemoryStore::new());
        store.set_reachable(false);
        let service = service_with(&store).await;

        let err = service.initialize().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(service.state(), InitState::Failed);
    }

    #[tokio::test]
    async fn test_dimension_learned_from_server() {
        let store = Arc::new(InMemoryStore::new());
        let handle = store.get_or_create_collection("file_embeddings").await.unwrap();
        store
            .upsert(&handle, vec![EmbeddingRecord::new("f1", vec![0.1, 0.2, 0.3])])
            .await
            .unwrap();

        let service = service_with(&store).await;
        service.initialize().await.unwrap();
        assert_eq!(service.collection_dimension(CollectionKind::Files), Some(3));
        assert_eq!(service.collection_dimension(CollectionKind::Folders), None);
    }

    #[tokio::test]
    async fn test_reads_degrade_when_unreachable() {
        let store = Arc::new(InMemoryStore::new());
        store.set_reachable(false);
        let service = service_with(&store).await;

        let matches = service.query_similar_files(vec![1.0, 0.0], 3).await.unwrap();
        assert!(matches.is_empty());
        assert_eq!(service.circuit_breaker().state(), CircuitState::Open);

        // rejected by the breaker without touching the store
        let calls = store.call_count();
        assert!(service.get_all_folders().await.unwrap().is_empty());
        assert_eq!(store.call_count(), calls);
    }

    #[tokio::test]
    async fn test_invalid_query_is_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let service = service_with(&store).await;

        let err = service.query_folders_by_embedding(vec![], 3).await.unwrap_err();
        assert!(err.is_validation());
        let err = service.query_folders("", 3).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_zero_top_k_uses_default() {
        let store = Arc::new(InMemoryStore::new());
        let service = service_with(&store).await;
        for i in 0..8 {
            service
                .upsert_folder(EmbeddingRecord::new(format!("folder-{}", i), vec![1.0, i as f32]))
                .await
                .unwrap();
        }

        let matches = service.query_folders_by_embedding(vec![1.0, 0.0], 0).await.unwrap();
        assert_eq!(matches.len(), service.config().query.default_top_k);
    }

    #[tokio::test]
    async fn test_reset_files_forgets_dimension() {
        let store = Arc::new(InMemoryStore::new());
        let service = service_with(&store).await;
        service
            .upsert_file(EmbeddingRecord::new("f1", vec![1.0, 2.0]))
            .await
            .unwrap();
        assert_eq!(service.collection_dimension(CollectionKind::Files), Some(2));

        service.reset_files().await.unwrap();
        assert_eq!(service.collection_dimension(CollectionKind::Files), None);
        assert!(store.is_empty("file_embeddings"));

        // a new dimension is accepted after the reset
        let outcome = service
            .upsert_file(EmbeddingRecord::new("f2", vec![1.0, 2.0, 3.0]))
            .await
            .unwrap();
        assert!(outcome.is_applied());
    }

    #[tokio::test]
    async fn test_stats_report_counts() {
        let store = Arc::new(InMemoryStore::new());
        let service = service_with(&store).await;
        service
            .batch_upsert_folders(vec![
                EmbeddingRecord::new("a", vec![1.0, 0.0]),
                EmbeddingRecord::new("b", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let stats = service.get_stats().await;
        assert_eq!(stats.state, InitState::Ready);
        let counts = stats.counts.unwrap();
        assert_eq!(counts.folders, 2);
        assert_eq!(counts.files, 0);
        assert_eq!(stats.dimensions.folders, Some(2));
        assert_eq!(stats.queue.size, 0);
    }

    #[tokio::test]
    async fn test_insecure_remote_warns() {
        let store = Arc::new(InMemoryStore::new());
        let mut config = test_config();
        config.server.url = Some("http://vectors.example.com:8000".to_string());
        let factory = Arc::new(SharedStoreFactory::new(store));
        let service = VectorDbService::new(config, factory).await.unwrap();
        let mut events = service.subscribe();

        service.initialize().await.unwrap();

        let mut warned = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ServiceEvent::SecurityWarning { .. }) {
                warned = true;
            }
        }
        assert!(warned);
    }

    #[tokio::test]
    async fn test_not_found_recovery_is_bounded() {
        let store = Arc::new(ForgetfulStore {
            inner: InMemoryStore::new(),
            upserts: AtomicUsize::new(0),
        });
        let factory = Arc::new(CountingFactory {
            store: store.clone(),
            connects: AtomicUsize::new(0),
        });
        let service = VectorDbService::new(test_config(), factory.clone()).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            service.upsert_file(EmbeddingRecord::new("f1", vec![1.0, 0.0])),
        )
        .await
        .expect("recovery loop did not terminate");

        let err = result.unwrap_err();
        assert!(err.is_not_found());
        // first connect plus one per recovery
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1 + MAX_NOT_FOUND_RECOVERIES);
        assert_eq!(store.upserts.load(Ordering::SeqCst), 1 + MAX_NOT_FOUND_RECOVERIES);
        assert!(service.offline_queue().is_empty());
        // the server answered, so the breaker stays closed
        assert_eq!(service.circuit_breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_health_monitor_closes_breaker_when_idle() {
        let store = Arc::new(InMemoryStore::new());
        let mut config = test_config();
        config.health.interval_ms = 20;
        let factory = Arc::new(SharedStoreFactory::new(store.clone()));
        let service = VectorDbService::new(config, factory).await.unwrap();
        service.initialize().await.unwrap();

        store.set_reachable(false);
        assert!(service.query_similar_files(vec![1.0, 0.0], 3).await.unwrap().is_empty());
        assert_eq!(service.circuit_breaker().state(), CircuitState::Open);
        let mut events = service.subscribe();

        // no traffic from here on; only the monitor talks to the server
        store.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(service.circuit_breaker().state(), CircuitState::Closed);
        assert!(service.check_health().await.is_healthy());
        let mut online = false;
        while let Ok(event) = events.try_recv() {
            online |= matches!(event, ServiceEvent::Online);
        }
        assert!(online);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_heartbeat_opens_breaker() {
        let store = Arc::new(InMemoryStore::new());
        let mut config = test_config();
        config.health.interval_ms = 20;
        let factory = Arc::new(SharedStoreFactory::new(store.clone()));
        let service = VectorDbService::new(config, factory).await.unwrap();
        service.initialize().await.unwrap();
        assert_eq!(service.circuit_breaker().state(), CircuitState::Closed);

        store.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_ne!(service.circuit_breaker().state(), CircuitState::Closed);
        assert!(service.circuit_breaker().stats().total_failures >= 1);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let service = service_with(&store).await;
        service.shutdown().await.unwrap();
        service.shutdown().await.unwrap();
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(100);
        for _ in 0..50 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay && jittered <= Duration::from_millis(150));
        }
    }
}
