//! Bulk Indexer: batches small writes into few round-trips
//!
//! Items handed to [`BulkIndexer::add`] go to a dispatcher task that owns the
//! current batch. The batch is handed off to a flush worker when the flush
//! interval elapses, when it reaches `flush_bytes` (or `flush_items` if set),
//! on an explicit [`BulkIndexer::flush`], or on [`BulkIndexer::close`].
//! At most `num_workers` flushes run at once.
//!
//! Each flush borrows one client from the [`ClientPool`], sends every item of
//! the batch through the [`BulkExecutor`] in one request and always returns
//! the client afterwards. Outcomes are reported per item to the
//! [`BulkListener`]: exactly one of `on_item_success` / `on_item_failure` per
//! item. A batch-level error (borrow failure, transport error, timeout) fails
//! every item of the batch.

use super::client_pool::ClientPool;
use super::error::ResilienceError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Kind of write carried by a [`BulkItem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkAction {
    /// Index (create or replace) a document
    Index,
    /// Create a document, failing if it already exists
    Create,
    /// Partially update a document
    Update,
    /// Delete a document
    Delete,
}

impl BulkAction {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
            BulkAction::Update => "update",
            BulkAction::Delete => "delete",
        }
    }

    /// Whether the action carries a document payload
    pub fn has_payload(&self) -> bool {
        !matches!(self, BulkAction::Delete)
    }
}

/// One pending write operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub action: BulkAction,
    /// Target index
    pub index: String,
    /// Document id; the store assigns one when absent
    pub id: Option<String>,
    /// Serialized JSON document
    pub payload: Option<String>,
}

impl BulkItem {
    pub fn new(
        action: BulkAction,
        index: impl Into<String>,
        id: Option<String>,
        payload: Option<String>,
    ) -> Self {
        Self {
            action,
            index: index.into(),
            id,
            payload,
        }
    }

    /// `index` item
    pub fn index(index: impl Into<String>, id: Option<String>, payload: impl Into<String>) -> Self {
        Self::new(BulkAction::Index, index, id, Some(payload.into()))
    }

    /// `create` item
    pub fn create(index: impl Into<String>, id: Option<String>, payload: impl Into<String>) -> Self {
        Self::new(BulkAction::Create, index, id, Some(payload.into()))
    }

    /// `update` item
    pub fn update(index: impl Into<String>, id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(BulkAction::Update, index, Some(id.into()), Some(payload.into()))
    }

    /// `delete` item
    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(BulkAction::Delete, index, Some(id.into()), None)
    }

    /// Approximate encoded size, used for the byte threshold
    pub fn size_hint(&self) -> usize {
        // action line framing: {"<action>":{"_index":"","_id":""}}\n
        32 + self.action.as_str().len()
            + self.index.len()
            + self.id.as_ref().map_or(0, String::len)
            + self.payload.as_ref().map_or(0, |p| p.len() + 1)
    }
}

/// Store verdict for one item of a bulk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemOutcome {
    /// Per-item HTTP status
    pub status: u16,
    /// Store error description (`type: reason`) for rejected items
    pub error: Option<String>,
}

impl BulkItemOutcome {
    pub fn ok(status: u16) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn rejected(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one batch through a client.
///
/// Returns one outcome per item, in item order. `Err` means the whole batch
/// failed (transport, non-2xx on the request itself).
#[async_trait::async_trait]
pub trait BulkExecutor<C>: Send + Sync {
    async fn execute(
        &self,
        client: &C,
        items: &[BulkItem],
    ) -> Result<Vec<BulkItemOutcome>, ResilienceError>;
}

/// Flush and per-item observation hooks. All methods default to no-ops.
pub trait BulkListener: Send + Sync {
    /// A batch of `count` items is about to be sent
    fn on_flush_start(&self, _seq: u64, _count: usize) {}

    /// The whole batch failed; every item is reported failed right after
    fn on_error(&self, _seq: u64, _error: &ResilienceError, _items: &[BulkItem]) {}

    /// The batch resolved
    fn on_flush_end(&self, _seq: u64, _elapsed: Duration) {}

    fn on_item_success(&self, _item: &BulkItem, _outcome: &BulkItemOutcome) {}

    fn on_item_failure(&self, _item: &BulkItem, _error: &ResilienceError) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl BulkListener for NoopListener {}

/// Configuration for the bulk indexer
#[derive(Debug, Clone)]
pub struct BulkIndexerConfig {
    /// Maximum concurrent flushes
    pub num_workers: usize,
    /// Flush the pending batch at this interval
    pub flush_interval: Duration,
    /// Flush once the pending batch reaches this many bytes
    pub flush_bytes: usize,
    /// Flush once the pending batch reaches this many items
    pub flush_items: Option<usize>,
    /// Bound on one bulk request
    pub timeout: Duration,
}

impl Default for BulkIndexerConfig {
    fn default() -> Self {
        Self {
            num_workers: 8,
            flush_interval: Duration::from_secs(5),
            flush_bytes: 5 * 1024 * 1024,
            flush_items: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Indexer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkStats {
    /// Items accepted by `add`
    pub num_added: u64,
    /// Items the store accepted
    pub num_flushed: u64,
    /// Items that failed (rejected or batch-level error)
    pub num_failed: u64,
    /// Bulk requests sent
    pub num_requests: u64,
}

#[derive(Debug, Default)]
struct BulkCounters {
    added: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
    requests: AtomicU64,
}

enum Command {
    Item(BulkItem),
    Flush(oneshot::Sender<()>),
}

/// Shared by the dispatcher and every flush worker
struct FlushContext<C: Send + Sync + 'static> {
    pool: Arc<ClientPool<C>>,
    executor: Arc<dyn BulkExecutor<C>>,
    listener: Arc<dyn BulkListener>,
    counters: Arc<BulkCounters>,
    timeout: Duration,
}

impl<C: Clone + Send + Sync + 'static> FlushContext<C> {
    async fn flush(&self, seq: u64, items: Vec<BulkItem>) {
        let started = Instant::now();
        self.listener.on_flush_start(seq, items.len());

        match self.send(&items).await {
            Ok(outcomes) => self.resolve(&items, outcomes),
            Err(e) => {
                self.listener.on_error(seq, &e, &items);
                self.counters
                    .failed
                    .fetch_add(items.len() as u64, Ordering::Relaxed);
                for item in &items {
                    self.listener.on_item_failure(item, &e);
                }
            }
        }

        self.listener.on_flush_end(seq, started.elapsed());
    }

    async fn send(&self, items: &[BulkItem]) -> Result<Vec<BulkItemOutcome>, ResilienceError> {
        let client = self.pool.borrow().await?;
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let result = tokio::time::timeout(self.timeout, self.executor.execute(&client, items))
            .await
            .unwrap_or(Err(ResilienceError::Timeout(self.timeout)));

        self.pool.release(client).await;
        result
    }

    fn resolve(&self, items: &[BulkItem], outcomes: Vec<BulkItemOutcome>) {
        if outcomes.len() != items.len() {
            warn!(
                items = items.len(),
                outcomes = outcomes.len(),
                "Bulk response does not match request size"
            );
        }

        let mut outcomes = outcomes.into_iter();
        for item in items {
            match outcomes.next() {
                Some(outcome) if outcome.is_success() => {
                    self.counters.flushed.fetch_add(1, Ordering::Relaxed);
                    self.listener.on_item_success(item, &outcome);
                }
                Some(outcome) => {
                    debug!(
                        index = %item.index,
                        id = item.id.as_deref().unwrap_or(""),
                        status = outcome.status,
                        reason = outcome.error.as_deref().unwrap_or(""),
                        "Bulk item rejected"
                    );
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let err = ResilienceError::RequestError {
                        status_code: outcome.status,
                    };
                    self.listener.on_item_failure(item, &err);
                }
                None => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let err = ResilienceError::FlushError("no response for item".to_string());
                    self.listener.on_item_failure(item, &err);
                }
            }
        }
    }
}

/// Pending items not yet handed to a worker
#[derive(Default)]
struct Batch {
    items: Vec<BulkItem>,
    bytes: usize,
}

impl Batch {
    fn push(&mut self, item: BulkItem) {
        self.bytes += item.size_hint();
        self.items.push(item);
    }

    fn is_full(&self, config: &BulkIndexerConfig) -> bool {
        self.bytes >= config.flush_bytes
            || config
                .flush_items
                .is_some_and(|limit| self.items.len() >= limit)
    }

    fn take(&mut self) -> Vec<BulkItem> {
        self.bytes = 0;
        std::mem::take(&mut self.items)
    }
}

struct Dispatcher<C: Send + Sync + 'static> {
    config: BulkIndexerConfig,
    ctx: Arc<FlushContext<C>>,
    workers: Arc<Semaphore>,
    flushes: JoinSet<()>,
    batch: Batch,
    next_seq: u64,
}

impl<C: Clone + Send + Sync + 'static> Dispatcher<C> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let every = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Item(item)) => {
                        self.batch.push(item);
                        if self.batch.is_full(&self.config) {
                            self.dispatch().await;
                        }
                    }
                    Some(Command::Flush(done)) => {
                        self.dispatch().await;
                        self.wait_in_flight().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => self.dispatch().await,
                Some(joined) = self.flushes.join_next(), if !self.flushes.is_empty() => {
                    if let Err(e) = joined {
                        error!("❌ Bulk flush worker failed: {}", e);
                    }
                }
            }
        }

        self.dispatch().await;
        self.wait_in_flight().await;
        debug!("Bulk dispatcher stopped");
    }

    async fn dispatch(&mut self) {
        if self.batch.items.is_empty() {
            return;
        }
        let items = self.batch.take();
        let seq = self.next_seq;
        self.next_seq += 1;

        let ctx = self.ctx.clone();
        match self.workers.clone().acquire_owned().await {
            Ok(permit) => {
                self.flushes.spawn(async move {
                    ctx.flush(seq, items).await;
                    drop(permit);
                });
            }
            Err(_) => ctx.flush(seq, items).await,
        }
    }

    async fn wait_in_flight(&mut self) {
        while let Some(joined) = self.flushes.join_next().await {
            if let Err(e) = joined {
                error!("❌ Bulk flush worker failed: {}", e);
            }
        }
    }
}

/// Batching writer over a [`ClientPool`]
///
/// # Example
/// ```no_run
/// use storm_core_resilience::bulk::{
///     BulkExecutor, BulkIndexer, BulkIndexerConfig, BulkItem, BulkItemOutcome, NoopListener,
/// };
/// use storm_core_resilience::{ClientPool, PoolConfig, PoolFactory, ResilienceError};
/// use std::sync::Arc;
///
/// #[derive(Clone)]
/// struct Conn;
/// struct Factory;
/// struct Executor;
///
/// #[async_trait::async_trait]
/// impl PoolFactory<Conn> for Factory {
///     async fn create(&self) -> Result<Conn, ResilienceError> { Ok(Conn) }
///     async fn validate(&self, _c: &Conn) -> bool { true }
/// }
///
/// #[async_trait::async_trait]
/// impl BulkExecutor<Conn> for Executor {
///     async fn execute(&self, _c: &Conn, items: &[BulkItem]) -> Result<Vec<BulkItemOutcome>, ResilienceError> {
///         Ok(items.iter().map(|_| BulkItemOutcome::ok(201)).collect())
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ClientPool::<Conn>::new(Arc::new(Factory), PoolConfig::default());
/// let indexer = BulkIndexer::new(pool, Arc::new(Executor), Arc::new(NoopListener), BulkIndexerConfig::default());
///
/// indexer.add(BulkItem::index("aqi-2024", None, r#"{"pm25":12}"#))?;
/// indexer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct BulkIndexer {
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    counters: Arc<BulkCounters>,
}

impl BulkIndexer {
    /// Create an indexer and spawn its dispatcher. Must be called within a tokio runtime.
    pub fn new<C: Clone + Send + Sync + 'static>(
        pool: Arc<ClientPool<C>>,
        executor: Arc<dyn BulkExecutor<C>>,
        listener: Arc<dyn BulkListener>,
        config: BulkIndexerConfig,
    ) -> Self {
        let counters = Arc::new(BulkCounters::default());
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            workers = config.num_workers,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            flush_bytes = config.flush_bytes,
            "📦 Bulk indexer started"
        );

        let dispatcher = Dispatcher {
            workers: Arc::new(Semaphore::new(config.num_workers.max(1))),
            ctx: Arc::new(FlushContext {
                pool,
                executor,
                listener,
                counters: counters.clone(),
                timeout: config.timeout,
            }),
            config,
            flushes: JoinSet::new(),
            batch: Batch::default(),
            next_seq: 1,
        };
        let handle = tokio::spawn(dispatcher.run(rx));

        Self {
            sender: Mutex::new(Some(tx)),
            dispatcher: tokio::sync::Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Queue an item for the next flush
    pub fn add(&self, item: BulkItem) -> Result<(), ResilienceError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = sender.as_ref().ok_or(ResilienceError::IndexerClosed)?;
        tx.send(Command::Item(item))
            .map_err(|_| ResilienceError::IndexerClosed)?;
        self.counters.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush the pending batch now and wait until every in-flight flush resolved
    pub async fn flush(&self) -> Result<(), ResilienceError> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let tx = sender.as_ref().ok_or(ResilienceError::IndexerClosed)?;
            tx.send(Command::Flush(done_tx))
                .map_err(|_| ResilienceError::IndexerClosed)?;
        }
        done_rx.await.map_err(|_| ResilienceError::IndexerClosed)
    }

    /// Stop accepting items, flush what is buffered and wait for all workers.
    ///
    /// Safe to call more than once; later calls wait for the first to finish.
    pub async fn close(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = dispatcher.take() {
            if let Err(e) = handle.await {
                error!("❌ Bulk dispatcher failed: {}", e);
            }
            let stats = self.stats();
            info!(
                added = stats.num_added,
                flushed = stats.num_flushed,
                failed = stats.num_failed,
                requests = stats.num_requests,
                "Bulk indexer closed"
            );
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn stats(&self) -> BulkStats {
        BulkStats {
            num_added: self.counters.added.load(Ordering::Relaxed),
            num_flushed: self.counters.flushed.load(Ordering::Relaxed),
            num_failed: self.counters.failed.load(Ordering::Relaxed),
            num_requests: self.counters.requests.load(Ordering::Relaxed),
        }
    }
}
