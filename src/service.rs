/*!
 * Client pool service
 *
 * [`ClientPoolService`] owns everything the rest of the application uses to
 * talk to the search store: the client pool, the primary client watched by
 * the connectivity heartbeat, the bulk indexer, and the queue of failed bulk
 * items waiting for the store to come back.
 *
 * Heartbeat cycle:
 *
 * ```text
 *   Healthy ──probe fails──▶ Degraded   (indexer closed, primary dropped,
 *      ▲                        │        reachable = false)
 *      └──────rebuild ok────────┘        (new primary + indexer,
 *                                        reachable = true, queue resubmitted)
 * ```
 */

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use storm_core_resilience::{
    BulkExecutor, BulkIndexer, BulkIndexerConfig, BulkItem, BulkItemOutcome, BulkListener,
    ClientPool, ConnectivityConfig, ConnectivityMonitor, ConnectivityState, FailureQueue,
    PoolConfig, PoolFactory, PoolStats, Reachability, ResilienceError, Transition,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::elastic::bulk::{validate_payload, StoreBulkExecutor};
use crate::store::{StoreClient, StoreRequest};

/// Everything the service needs besides the client factory
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub pool: PoolConfig,
    pub bulk: BulkIndexerConfig,
    pub monitor: ConnectivityConfig,
    /// Cap on queued bulk failures; `None` keeps every item
    pub failure_queue_capacity: Option<usize>,
    /// Keep-alive of scroll contexts
    pub scroll_keep_alive: Duration,
    /// Server-side timeout sent with searches
    pub request_timeout: Option<Duration>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            bulk: BulkIndexerConfig::default(),
            monitor: ConnectivityConfig::default(),
            failure_queue_capacity: None,
            scroll_keep_alive: Duration::from_secs(20),
            request_timeout: Some(Duration::from_secs(20)),
        }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pool: config.elastic.pool_config(),
            bulk: config.bulk.indexer_config(),
            monitor: config.monitor.connectivity_config(),
            failure_queue_capacity: config.bulk.failure_queue_capacity,
            scroll_keep_alive: config.elastic.scroll_keep_alive(),
            request_timeout: Some(config.elastic.request_timeout()),
        }
    }
}

/// Point-in-time view of the service counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Bulk items the store accepted
    pub succeeded: u64,
    /// Bulk items currently counted as failed and not yet resubmitted
    pub failed_total: u64,
    /// Items waiting in the failure queue
    pub queued_failures: usize,
    /// Bulk requests sent
    pub flushed_requests: u64,
    /// Items taken from the failure queue and submitted again
    pub resubmitted: u64,
    /// Degraded to healthy transitions
    pub recoveries: u64,
    pub reachable: bool,
}

#[derive(Debug, Default)]
struct ServiceCounters {
    succeeded: AtomicU64,
    failed_total: AtomicU64,
    flushed_requests: AtomicU64,
    resubmitted: AtomicU64,
}

impl ServiceCounters {
    fn release_failed(&self, count: u64) {
        let _ = self
            .failed_total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(count))
            });
    }
}

/// Routes bulk outcomes into the service counters and the failure queue
struct ServiceListener {
    failures: Arc<FailureQueue<BulkItem>>,
    counters: Arc<ServiceCounters>,
}

impl BulkListener for ServiceListener {
    fn on_flush_start(&self, seq: u64, count: usize) {
        self.counters.flushed_requests.fetch_add(1, Ordering::Relaxed);
        debug!(seq, count, "Bulk flush started");
    }

    fn on_error(&self, seq: u64, error: &ResilienceError, items: &[BulkItem]) {
        error!(seq, count = items.len(), "❌ Bulk flush failed: {}", error);
    }

    fn on_flush_end(&self, seq: u64, elapsed: Duration) {
        debug!(
            seq,
            elapsed_ms = elapsed.as_millis() as u64,
            failed_total = self.counters.failed_total.load(Ordering::Relaxed),
            "Bulk flush finished"
        );
    }

    fn on_item_success(&self, _item: &BulkItem, _outcome: &BulkItemOutcome) {
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn on_item_failure(&self, item: &BulkItem, error: &ResilienceError) {
        debug!(index = %item.index, id = ?item.id, "Bulk item failed: {}", error);
        self.failures.push(item.clone());
        self.counters.failed_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Façade over the store: queries, scrolls, index management and bulk writes.
///
/// Construct once with [`ClientPoolService::start`] and share the `Arc`.
pub struct ClientPoolService<C: StoreClient> {
    factory: Arc<dyn PoolFactory<C>>,
    pool: Arc<ClientPool<C>>,
    executor: Arc<dyn BulkExecutor<C>>,
    listener: Arc<ServiceListener>,
    settings: ServiceSettings,

    indexer: RwLock<Option<Arc<BulkIndexer>>>,
    primary: Mutex<Option<C>>,
    monitor: Mutex<ConnectivityMonitor>,
    reachable: Reachability,
    failures: Arc<FailureQueue<BulkItem>>,
    counters: Arc<ServiceCounters>,

    /// Serializes heartbeats against each other and against `close`
    cycle: tokio::sync::Mutex<()>,
    heartbeat_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<C: StoreClient> ClientPoolService<C> {
    /// Build the service, connect the primary client and start the heartbeat.
    ///
    /// A failed first connection is not an error: the service starts
    /// degraded and the heartbeat keeps trying.
    pub async fn start(factory: Arc<dyn PoolFactory<C>>, settings: ServiceSettings) -> Arc<Self> {
        let failures = Arc::new(FailureQueue::new(settings.failure_queue_capacity));
        let counters = Arc::new(ServiceCounters::default());
        let executor: Arc<dyn BulkExecutor<C>> = Arc::new(StoreBulkExecutor {
            timeout: Some(settings.bulk.timeout),
        });

        let service = Arc::new(Self {
            pool: ClientPool::new(factory.clone(), settings.pool.clone()),
            factory,
            executor,
            listener: Arc::new(ServiceListener {
                failures: failures.clone(),
                counters: counters.clone(),
            }),
            indexer: RwLock::new(None),
            primary: Mutex::new(None),
            monitor: Mutex::new(ConnectivityMonitor::new(
                settings.monitor.clone(),
                ConnectivityState::Degraded,
            )),
            reachable: Reachability::new(false),
            failures,
            counters,
            cycle: tokio::sync::Mutex::new(()),
            heartbeat_task: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            settings,
        });

        let initial = match service.rebuild_primary().await {
            Some(client) => {
                service.install_primary(client);
                info!("✅ Connected to search store");
                ConnectivityState::Healthy
            }
            None => {
                warn!("⚠️  Search store unreachable at startup, starting degraded");
                ConnectivityState::Degraded
            }
        };
        *service.monitor_guard() =
            ConnectivityMonitor::new(service.settings.monitor.clone(), initial);

        let task = service.spawn_heartbeat();
        *service.heartbeat_task.lock().await = task;

        service
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let every = self.settings.monitor.check_interval;
        if every.is_zero() {
            return None;
        }
        let service = Arc::downgrade(self);
        let token = self.shutdown.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(service) = service.upgrade() else { break };
                        service.heartbeat().await;
                    }
                }
            }
            debug!("Connectivity heartbeat stopped");
        }))
    }

    /// Run one connectivity check.
    ///
    /// Healthy: probe the primary client, and on failure tear down the
    /// indexer and the primary. Degraded: try to build a new primary, and on
    /// success start a fresh indexer and resubmit the failure queue.
    pub async fn heartbeat(&self) -> Transition {
        let _cycle = self.cycle.lock().await;
        if self.is_closed() {
            return Transition::Steady;
        }

        let state = self.monitor_guard().state();
        match state {
            ConnectivityState::Healthy => {
                let primary = self.primary_guard().clone();
                let ok = match primary {
                    Some(client) => self.factory.validate(&client).await,
                    None => false,
                };
                let transition = self.monitor_guard().observe(ok);
                if transition == Transition::Lost {
                    warn!("❌ Search store probe failed, switching to degraded mode");
                    self.degrade().await;
                }
                transition
            }
            ConnectivityState::Degraded => {
                let rebuilt = self.rebuild_primary().await;
                let recovered = rebuilt.is_some();
                if let Some(client) = rebuilt {
                    self.install_primary(client);
                }
                let transition = self.monitor_guard().observe(recovered);
                if transition == Transition::Recovered {
                    info!("✅ Search store reachable again");
                    self.resubmit_failures();
                }
                transition
            }
        }
    }

    /// New client from the factory that passes a liveness probe
    async fn rebuild_primary(&self) -> Option<C> {
        let client = match self.factory.create().await {
            Ok(client) => client,
            Err(e) => {
                debug!("Primary client rebuild failed: {}", e);
                return None;
            }
        };
        if self.factory.validate(&client).await {
            Some(client)
        } else {
            self.factory.destroy(client).await;
            None
        }
    }

    fn install_primary(&self, client: C) {
        *self.primary_guard() = Some(client);

        let indexer = Arc::new(BulkIndexer::new(
            self.pool.clone(),
            self.executor.clone(),
            self.listener.clone(),
            self.settings.bulk.clone(),
        ));
        let stale = self
            .indexer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(indexer);
        if let Some(stale) = stale {
            tokio::spawn(async move { stale.close().await });
        }

        self.reachable.set(true);
    }

    /// Stop accepting writes, flush what is buffered and drop the primary
    async fn degrade(&self) {
        self.reachable.set(false);

        let indexer = self.take_indexer();
        if let Some(indexer) = indexer {
            indexer.close().await;
        }

        let primary = self.primary_guard().take();
        if let Some(client) = primary {
            self.factory.destroy(client).await;
        }

        debug!(
            queued = self.failures.len(),
            "Bulk indexer closed while degraded"
        );
    }

    /// Drain the failure queue through the normal submit path
    fn resubmit_failures(&self) -> usize {
        let items = self.failures.drain();
        if items.is_empty() {
            return 0;
        }

        let count = items.len();
        self.counters.release_failed(count as u64);
        info!(count, "🔁 Resubmitting queued bulk items");

        for item in items {
            self.counters.resubmitted.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.submit_for_bulk_write(item) {
                debug!("Resubmitted bulk item rejected: {}", e);
            }
        }
        count
    }

    /// Borrow a client, send `request` and return the body of a 2xx response.
    ///
    /// 404 comes back as [`ResilienceError::NotFound`], any other non-2xx
    /// status as [`ResilienceError::RequestError`]. No retry at this level.
    pub async fn execute_query(&self, request: StoreRequest) -> Result<Value, ResilienceError> {
        let name = request.name();
        let result = self
            .pool
            .with_client(|client| async move { client.send(&request).await?.into_result() })
            .await;

        match &result {
            Err(e) if !e.is_not_found() => debug!(request = name, "Store request failed: {}", e),
            _ => {}
        }
        result
    }

    /// `_source` of one document
    pub async fn get_document(&self, index: &str, id: &str) -> Result<Value, ResilienceError> {
        let body = self
            .execute_query(StoreRequest::Get {
                index: index.to_string(),
                id: id.to_string(),
            })
            .await?;
        let source = body.get("_source").cloned();
        Ok(source.unwrap_or(body))
    }

    /// Run `query` as a scroll search and collect the `_source` of every hit.
    ///
    /// The whole scroll runs on one borrowed client. A failed page fails the
    /// whole call; the scroll context is cleared either way.
    pub async fn scroll_search(&self, index: &str, query: Value) -> Result<Vec<Value>, ResilienceError> {
        let keep_alive = self.settings.scroll_keep_alive;
        let timeout = self.settings.request_timeout;
        let index = index.to_string();

        self.pool
            .with_client(|client| async move {
                let first = StoreRequest::Search {
                    index: index.clone(),
                    body: query,
                    scroll: Some(keep_alive),
                    timeout,
                };
                let mut page = client.send(&first).await?.into_result()?;
                let mut documents = Vec::new();
                let mut open_scroll = None;

                let outcome = loop {
                    let sources = hit_sources(&page);
                    let exhausted = sources.is_empty();
                    documents.extend(sources);

                    let scroll_id = page
                        .get("_scroll_id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if let Some(id) = &scroll_id {
                        open_scroll = Some(id.clone());
                    }
                    let Some(scroll_id) = scroll_id.filter(|_| !exhausted) else {
                        break Ok(());
                    };

                    let next = StoreRequest::Scroll {
                        scroll_id,
                        scroll: keep_alive,
                    };
                    match client.send(&next).await.and_then(|r| r.into_result()) {
                        Ok(body) => page = body,
                        Err(e) => break Err(e),
                    }
                };

                if let Some(scroll_id) = open_scroll {
                    if let Err(e) = client.send(&StoreRequest::ClearScroll { scroll_id }).await {
                        debug!("Failed to clear scroll context: {}", e);
                    }
                }

                match outcome {
                    Ok(()) => {
                        debug!(index = %index, hits = documents.len(), "Scroll search finished");
                        Ok(documents)
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Whether `index` exists.
    ///
    /// Only a 404 counts as missing; any other failure is logged and reported
    /// as existing so callers do not try to recreate it.
    pub async fn index_exists(&self, index: &str) -> bool {
        let request = StoreRequest::IndexExists {
            index: index.to_string(),
        };
        match self.execute_query(request).await {
            Ok(_) => true,
            Err(ResilienceError::NotFound) => false,
            Err(e) => {
                warn!(index, "Could not check index existence: {}", e);
                true
            }
        }
    }

    /// Create the index named by `template` unless it already exists.
    ///
    /// Returns the resolved index name.
    pub async fn create_index(
        &self,
        template: &str,
        mappings: Value,
        suffix: &str,
    ) -> Result<String, ResilienceError> {
        let index = resolve_index_name(template, suffix)?;
        if self.index_exists(&index).await {
            debug!(index = %index, "Index already exists");
            return Ok(index);
        }

        self.execute_query(StoreRequest::IndexCreate {
            index: index.clone(),
            body: mappings,
        })
        .await?;
        info!(index = %index, "📦 Index created");
        Ok(index)
    }

    /// Queue `item` for the next bulk flush.
    ///
    /// Fails with `NotReachable` while degraded. Acceptance only means the
    /// item is buffered: its outcome shows up in [`stats`](Self::stats), and
    /// failed items land in the failure queue.
    pub fn submit_for_bulk_write(&self, item: BulkItem) -> Result<(), ResilienceError> {
        validate_payload(&item)?;
        if !self.reachable.is_reachable() {
            return Err(ResilienceError::NotReachable);
        }
        let indexer = self
            .indexer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ResilienceError::NotReachable)?;

        if let Err(e) = indexer.add(item.clone()) {
            warn!(index = %item.index, "Bulk item not accepted: {}", e);
            self.failures.push(item);
            self.counters.failed_total.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }

    /// Flush the buffered bulk items now and wait for the result
    pub async fn flush(&self) -> Result<(), ResilienceError> {
        let indexer = self
            .indexer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ResilienceError::NotReachable)?;
        indexer.flush().await
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.is_reachable()
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.monitor_guard().state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &Arc<ClientPool<C>> {
        &self.pool
    }

    pub fn failures(&self) -> &FailureQueue<BulkItem> {
        &self.failures
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed_total: self.counters.failed_total.load(Ordering::Relaxed),
            queued_failures: self.failures.len(),
            flushed_requests: self.counters.flushed_requests.load(Ordering::Relaxed),
            resubmitted: self.counters.resubmitted.load(Ordering::Relaxed),
            recoveries: self.monitor_guard().stats().recoveries,
            reachable: self.reachable.is_reachable(),
        }
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Orderly shutdown: stop the heartbeat, flush and close the indexer,
    /// close the pool, clear the failure queue. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down client pool service");

        self.shutdown.cancel();
        let task = self.heartbeat_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("❌ Heartbeat task failed: {}", e);
            }
        }

        let _cycle = self.cycle.lock().await;
        self.reachable.set(false);

        let indexer = self.take_indexer();
        if let Some(indexer) = indexer {
            indexer.close().await;
        }

        let primary = self.primary_guard().take();
        if let Some(client) = primary {
            self.factory.destroy(client).await;
        }

        self.pool.close().await;

        let dropped = self.failures.len();
        self.failures.clear();
        if dropped > 0 {
            warn!(dropped, "Discarded queued bulk failures on shutdown");
        }

        let stats = self.stats();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed_total,
            requests = stats.flushed_requests,
            "✅ Client pool service closed"
        );
    }

    fn take_indexer(&self) -> Option<Arc<BulkIndexer>> {
        self.indexer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn primary_guard(&self) -> std::sync::MutexGuard<'_, Option<C>> {
        self.primary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitor_guard(&self) -> std::sync::MutexGuard<'_, ConnectivityMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: StoreClient> Drop for ClientPoolService<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Replace `$` in an index template with `suffix`
pub fn resolve_index_name(template: &str, suffix: &str) -> Result<String, ResilienceError> {
    if !template.contains('$') {
        return Ok(template.to_string());
    }
    if suffix.is_empty() {
        return Err(ResilienceError::Validation(format!(
            "index template '{}' needs a suffix",
            template
        )));
    }
    Ok(template.replace('$', suffix))
}

/// `_source` of every hit in a search or scroll page
fn hit_sources(page: &Value) -> Vec<Value> {
    page.pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| hit.get("_source").cloned())
                .collect()
        })
        .unwrap_or_default()
}
