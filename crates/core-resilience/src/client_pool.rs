//! Generic client pool for reusable store clients
//!
//! Bounds the number of live clients, reuses idle ones, validates them on
//! create/borrow/return/idle according to [`PoolConfig`], evicts stale idle
//! clients on a background interval and reclaims clients whose borrower never
//! returned them.
//!
//! Clients are cheap handles (`T: Clone`). The pool keeps a copy of every
//! borrowed client so that an abandoned one can still be destroyed.

use super::error::ResilienceError;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for client pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of clients alive at once (idle + borrowed + being created)
    pub max_total: usize,
    /// Maximum number of idle clients kept; extra returned clients are destroyed
    pub max_idle: usize,
    /// Minimum number of idle clients the evictor tries to maintain
    pub min_idle: usize,
    /// Borrow the most recently returned client first
    pub lifo: bool,
    /// Validate freshly created clients
    pub test_on_create: bool,
    /// Validate idle clients before handing them out
    pub test_on_borrow: bool,
    /// Validate clients when they are returned
    pub test_on_return: bool,
    /// Validate idle clients during eviction runs
    pub test_while_idle: bool,
    /// Wait for a client when the pool is exhausted instead of failing
    pub block_when_exhausted: bool,
    /// Upper bound on a blocking borrow (None waits forever)
    pub max_wait: Option<Duration>,
    /// Interval of the background evictor (None disables it)
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle clients examined per eviction run (0 examines all)
    pub num_tests_per_eviction_run: usize,
    /// Idle time after which an idle client is evicted
    pub min_evictable_idle_time: Option<Duration>,
    /// Reclaim abandoned clients when a borrow finds the pool nearly exhausted
    pub remove_abandoned_on_borrow: bool,
    /// Reclaim abandoned clients on every eviction run
    pub remove_abandoned_on_maintenance: bool,
    /// Borrow duration after which a client is considered abandoned
    pub remove_abandoned_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            lifo: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            block_when_exhausted: true,
            max_wait: None,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
            remove_abandoned_on_borrow: false,
            remove_abandoned_on_maintenance: false,
            remove_abandoned_timeout: Duration::from_secs(300),
        }
    }
}

/// Factory trait for creating, validating and tearing down clients
#[async_trait::async_trait]
pub trait PoolFactory<T: Send + Sync + 'static>: Send + Sync {
    /// Open a new client
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Lightweight liveness probe; absence of liveness is `false`, never an error
    async fn validate(&self, client: &T) -> bool;

    /// Release resources held by the client. Must be idempotent.
    async fn destroy(&self, client: T) {
        drop(client);
    }

    /// Called right before a pooled client is handed to a borrower
    async fn activate(&self, _client: &T) -> Result<(), ResilienceError> {
        Ok(())
    }

    /// Called when a client comes back to the pool
    async fn passivate(&self, _client: &T) {}
}

/// A pooled client plus its bookkeeping
#[derive(Debug)]
struct PooledEntry<T> {
    id: u64,
    client: T,
    created_at: Instant,
    last_borrowed: Option<Instant>,
    last_used: Instant,
}

impl<T> PooledEntry<T> {
    fn new(id: u64, client: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            client,
            created_at: now,
            last_borrowed: None,
            last_used: now,
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn borrowed_for(&self) -> Duration {
        self.last_borrowed
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }
}

/// A client checked out of the pool.
///
/// Hand it back with [`ClientPool::release`].
#[derive(Debug)]
pub struct PooledClient<T> {
    id: u64,
    client: T,
}

impl<T> PooledClient<T> {
    /// Pool-assigned identifier of this client
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Deref for PooledClient<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.client
    }
}

struct PoolState<T> {
    idle: VecDeque<PooledEntry<T>>,
    borrowed: HashMap<u64, PooledEntry<T>>,
    /// Slots reserved by in-progress creates and validations
    pending: usize,
    closed: bool,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            borrowed: HashMap::new(),
            pending: 0,
            closed: false,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.borrowed.len() + self.pending
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    reclaimed: AtomicU64,
}

/// A generic, size-bounded pool of reusable clients
///
/// # Example
/// ```no_run
/// use storm_core_resilience::{ClientPool, PoolConfig, PoolFactory, ResilienceError};
/// use std::sync::Arc;
///
/// #[derive(Clone)]
/// struct MyClient;
/// struct MyFactory;
///
/// #[async_trait::async_trait]
/// impl PoolFactory<MyClient> for MyFactory {
///     async fn create(&self) -> Result<MyClient, ResilienceError> {
///         Ok(MyClient)
///     }
///
///     async fn validate(&self, _client: &MyClient) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ClientPool::<MyClient>::new(Arc::new(MyFactory), PoolConfig::default());
///
/// let client = pool.borrow().await?;
/// // Use client...
/// pool.release(client).await;
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ClientPool<T: Send + Sync + 'static> {
    config: Arc<PoolConfig>,
    factory: Arc<dyn PoolFactory<T>>,
    state: Mutex<PoolState<T>>,
    available: Notify,
    next_id: AtomicU64,
    counters: PoolCounters,
    evictor: CancellationToken,
}

impl<T: Clone + Send + Sync + 'static> ClientPool<T> {
    /// Create a new client pool.
    ///
    /// Spawns the background evictor when `time_between_eviction_runs` is set,
    /// so this must be called from within a tokio runtime in that case.
    pub fn new(factory: Arc<dyn PoolFactory<T>>, config: PoolConfig) -> Arc<Self> {
        let every = config.time_between_eviction_runs;
        let pool = Arc::new(Self {
            config: Arc::new(config),
            factory,
            state: Mutex::new(PoolState::new()),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
            evictor: CancellationToken::new(),
        });

        if let Some(every) = every.filter(|d| !d.is_zero()) {
            pool.spawn_evictor(every);
        }

        pool
    }

    /// Create a client pool with default configuration
    pub fn new_default(factory: Arc<dyn PoolFactory<T>>) -> Arc<Self> {
        Self::new(factory, PoolConfig::default())
    }

    /// The configuration this pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a client.
    ///
    /// Reuses an idle client when one passes activation (and validation if
    /// `test_on_borrow`), otherwise creates one while under `max_total`.
    /// At capacity it waits for a return when `block_when_exhausted` is set
    /// (bounded by `max_wait`), or fails with `PoolExhausted`.
    pub async fn borrow(&self) -> Result<PooledClient<T>, ResilienceError> {
        let deadline = self.config.max_wait.map(|wait| Instant::now() + wait);

        if self.config.remove_abandoned_on_borrow {
            self.reclaim_abandoned_if_starved().await;
        }

        loop {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(ResilienceError::PoolClosed);
            }

            let candidate = if self.config.lifo {
                state.idle.pop_back()
            } else {
                state.idle.pop_front()
            };

            if let Some(entry) = candidate {
                state.pending += 1;
                drop(state);

                match self.prepare_idle(entry).await {
                    Some(entry) => return self.check_out(entry).await,
                    None => {
                        self.release_slot().await;
                        continue;
                    }
                }
            }

            if state.total() < self.config.max_total {
                state.pending += 1;
                drop(state);

                return match self.create_for_borrow().await {
                    Ok(entry) => self.check_out(entry).await,
                    Err(e) => {
                        self.release_slot().await;
                        Err(e)
                    }
                };
            }

            if !self.config.block_when_exhausted {
                return Err(ResilienceError::PoolExhausted);
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ResilienceError::Timeout(
                            self.config.max_wait.unwrap_or_default(),
                        ));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Return a client to the pool.
    ///
    /// The client is passivated and kept idle unless it fails `test_on_return`,
    /// the idle set is already at `max_idle`, the pool is closed, or the client
    /// was reclaimed as abandoned in the meantime. In those cases it is destroyed.
    pub async fn release(&self, pooled: PooledClient<T>) {
        let PooledClient { id, client } = pooled;

        let healthy = !self.config.test_on_return || self.factory.validate(&client).await;
        if healthy {
            self.factory.passivate(&client).await;
        }

        let mut state = self.state.lock().await;
        let Some(mut entry) = state.borrowed.remove(&id) else {
            drop(state);
            debug!(client_id = id, "Returned client is no longer tracked, destroying");
            self.destroy(client).await;
            return;
        };

        if healthy && !state.closed && state.idle.len() < self.config.max_idle {
            entry.client = client;
            entry.last_used = Instant::now();
            state.idle.push_back(entry);
            drop(state);
        } else {
            drop(state);
            debug!(client_id = id, healthy, "Destroying returned client");
            self.destroy(client).await;
        }

        self.available.notify_one();
    }

    /// Borrow a client, run `op` with it and return the client afterwards,
    /// whether `op` succeeded or not.
    pub async fn with_client<F, Fut, R>(&self, op: F) -> Result<R, ResilienceError>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<R, ResilienceError>>,
    {
        let pooled = self.borrow().await?;
        let result = op(pooled.client.clone()).await;
        self.release(pooled).await;
        result
    }

    /// Run one eviction pass.
    ///
    /// Destroys idle clients past `min_evictable_idle_time` or failing
    /// validation (with `test_while_idle`), tops the idle set back up to
    /// `min_idle`, and reclaims abandoned clients when
    /// `remove_abandoned_on_maintenance` is set.
    pub async fn evict(&self) {
        let candidates: Vec<PooledEntry<T>> = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let n = match self.config.num_tests_per_eviction_run {
                0 => state.idle.len(),
                n => n.min(state.idle.len()),
            };
            let taken: Vec<_> = state.idle.drain(..n).collect();
            state.pending += taken.len();
            taken
        };

        let mut kept = Vec::with_capacity(candidates.len());
        let mut evicted = 0usize;
        for entry in candidates {
            let expired = self
                .config
                .min_evictable_idle_time
                .is_some_and(|limit| entry.idle_for() > limit);

            let valid = !expired
                && (!self.config.test_while_idle || self.check_idle(&entry.client).await);

            if valid {
                kept.push(entry);
            } else {
                evicted += 1;
                self.destroy(entry.client).await;
            }
        }

        let mut late = Vec::new();
        let mut returned = 0usize;
        {
            let mut state = self.state.lock().await;
            state.pending -= kept.len() + evicted;
            if state.closed {
                late = kept;
            } else {
                returned = kept.len();
                for entry in kept.into_iter().rev() {
                    state.idle.push_front(entry);
                }
            }
        }
        for entry in late {
            self.destroy(entry.client).await;
        }

        if evicted > 0 {
            debug!(evicted, "Evicted idle clients");
        }
        // borrowers may have parked while the candidates were out of the idle set
        if evicted > 0 || returned > 0 {
            self.available.notify_waiters();
        }

        self.ensure_min_idle().await;

        if self.config.remove_abandoned_on_maintenance {
            self.reclaim_abandoned().await;
        }
    }

    /// Create idle clients until `min_idle` is reached or the pool is full
    pub async fn ensure_min_idle(&self) {
        let target = self.config.min_idle.min(self.config.max_idle);
        loop {
            {
                let mut state = self.state.lock().await;
                if state.closed
                    || state.idle.len() >= target
                    || state.total() >= self.config.max_total
                {
                    return;
                }
                state.pending += 1;
            }

            match self.create_for_borrow().await {
                Ok(entry) => {
                    let mut state = self.state.lock().await;
                    state.pending -= 1;
                    if state.closed {
                        drop(state);
                        self.destroy(entry.client).await;
                        return;
                    }
                    state.idle.push_back(entry);
                    drop(state);
                    self.available.notify_one();
                }
                Err(e) => {
                    self.release_slot().await;
                    warn!("Failed to top up idle clients: {}", e);
                    return;
                }
            }
        }
    }

    /// Force-reclaim clients borrowed longer than `remove_abandoned_timeout`.
    ///
    /// Returns the number of reclaimed clients.
    pub async fn reclaim_abandoned(&self) -> usize {
        let timeout = self.config.remove_abandoned_timeout;
        let abandoned: Vec<PooledEntry<T>> = {
            let mut state = self.state.lock().await;
            let ids: Vec<u64> = state
                .borrowed
                .values()
                .filter(|entry| entry.borrowed_for() > timeout)
                .map(|entry| entry.id)
                .collect();
            ids.iter()
                .filter_map(|id| state.borrowed.remove(id))
                .collect()
        };

        let count = abandoned.len();
        for entry in abandoned {
            warn!(
                client_id = entry.id,
                borrowed_ms = entry.borrowed_for().as_millis() as u64,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                "Reclaiming abandoned client"
            );
            self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
            self.destroy(entry.client).await;
        }

        if count > 0 {
            self.available.notify_waiters();
        }
        count
    }

    /// Close the pool, destroying idle and borrowed clients.
    ///
    /// Safe to call more than once; later borrows fail with `PoolClosed` and
    /// later returns destroy the returned client.
    pub async fn close(&self) {
        let (idle, borrowed) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.borrowed),
            )
        };

        self.evictor.cancel();
        self.available.notify_waiters();

        let count = idle.len() + borrowed.len();
        for entry in idle.into_iter().chain(borrowed.into_values()) {
            self.destroy(entry.client).await;
        }

        info!(destroyed = count, "Client pool closed");
    }

    /// Whether [`close`](Self::close) has run
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Get current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            idle: state.idle.len(),
            borrowed: state.borrowed.len(),
            total: state.total(),
            max_total: self.config.max_total,
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
        }
    }

    async fn prepare_idle(&self, entry: PooledEntry<T>) -> Option<PooledEntry<T>> {
        if let Err(e) = self.factory.activate(&entry.client).await {
            debug!(client_id = entry.id, "Idle client failed activation: {}", e);
            self.destroy(entry.client).await;
            return None;
        }

        if self.config.test_on_borrow && !self.factory.validate(&entry.client).await {
            debug!(client_id = entry.id, "Idle client failed validation on borrow");
            self.destroy(entry.client).await;
            return None;
        }

        Some(entry)
    }

    async fn create_for_borrow(&self) -> Result<PooledEntry<T>, ResilienceError> {
        let client = self.factory.create().await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.factory.activate(&client).await {
            self.destroy(client).await;
            return Err(e);
        }

        if self.config.test_on_create && !self.factory.validate(&client).await {
            self.destroy(client).await;
            return Err(ResilienceError::Validation(
                "new client failed validation on create".to_string(),
            ));
        }

        debug!(client_id = id, "Created pooled client");
        Ok(PooledEntry::new(id, client))
    }

    async fn check_idle(&self, client: &T) -> bool {
        self.factory.activate(client).await.is_ok() && self.factory.validate(client).await
    }

    async fn check_out(&self, mut entry: PooledEntry<T>) -> Result<PooledClient<T>, ResilienceError> {
        let mut state = self.state.lock().await;
        state.pending -= 1;
        if state.closed {
            drop(state);
            self.destroy(entry.client).await;
            return Err(ResilienceError::PoolClosed);
        }

        entry.last_borrowed = Some(Instant::now());
        let pooled = PooledClient {
            id: entry.id,
            client: entry.client.clone(),
        };
        state.borrowed.insert(entry.id, entry);
        Ok(pooled)
    }

    async fn release_slot(&self) {
        let mut state = self.state.lock().await;
        state.pending -= 1;
        drop(state);
        self.available.notify_one();
    }

    async fn reclaim_abandoned_if_starved(&self) {
        let starved = {
            let state = self.state.lock().await;
            state.idle.len() < 2 && state.borrowed.len() > self.config.max_total.saturating_sub(3)
        };
        if starved {
            self.reclaim_abandoned().await;
        }
    }

    async fn destroy(&self, client: T) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.factory.destroy(client).await;
    }

    fn spawn_evictor(self: &Arc<Self>, every: Duration) {
        let pool = Arc::downgrade(self);
        let token = self.evictor.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.evict().await;
                    }
                }
            }
            debug!("Client pool evictor stopped");
        });
    }
}

impl<T: Send + Sync + 'static> Drop for ClientPool<T> {
    fn drop(&mut self) {
        self.evictor.cancel();
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of idle clients
    pub idle: usize,
    /// Number of clients currently borrowed
    pub borrowed: usize,
    /// Idle + borrowed + in-progress creates
    pub total: usize,
    /// Maximum pool size
    pub max_total: usize,
    /// Clients created since the pool was built
    pub created: u64,
    /// Clients destroyed since the pool was built
    pub destroyed: u64,
    /// Clients reclaimed as abandoned
    pub reclaimed: u64,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_total == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Debug, Clone)]
    struct TestClient {
        serial: usize,
        healthy: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct TestFactory {
        counter: AtomicUsize,
        destroyed: AtomicUsize,
        fail_create: AtomicBool,
        slow_validate: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PoolFactory<TestClient> for TestFactory {
        async fn create(&self) -> Result<TestClient, ResilienceError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ResilienceError::ConnectError("refused".to_string()));
            }
            let serial = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestClient {
                serial,
                healthy: Arc::new(AtomicBool::new(true)),
            })
        }

        async fn validate(&self, client: &TestClient) -> bool {
            if self.slow_validate.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            client.healthy.load(Ordering::SeqCst)
        }

        async fn destroy(&self, _client: TestClient) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_with(config: PoolConfig) -> (Arc<TestFactory>, Arc<ClientPool<TestClient>>) {
        let factory = Arc::new(TestFactory::default());
        let pool = ClientPool::new(factory.clone(), config);
        (factory, pool)
    }

    #[tokio::test]
    async fn test_pool_borrow_release() {
        let (_, pool) = pool_with(PoolConfig {
            max_total: 5,
            ..Default::default()
        });

        let client = pool.borrow().await.unwrap();
        assert_eq!(client.serial, 1);

        let stats = pool.stats().await;
        assert_eq!(stats.borrowed, 1);
        assert_eq!(stats.idle, 0);

        pool.release(client).await;

        let stats = pool.stats().await;
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_pool_reuse() {
        let (factory, pool) = pool_with(PoolConfig::default());

        let first = pool.borrow().await.unwrap();
        let serial = first.serial;
        pool.release(first).await;

        let second = pool.borrow().await.unwrap();
        assert_eq!(second.serial, serial);
        assert_eq!(factory.counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_borrowed_count_tracks_outstanding() {
        let (_, pool) = pool_with(PoolConfig::default());

        let mut held = Vec::new();
        for i in 1..=4 {
            held.push(pool.borrow().await.unwrap());
            assert_eq!(pool.stats().await.borrowed, i);
        }
        while let Some(client) = held.pop() {
            pool.release(client).await;
            assert_eq!(pool.stats().await.borrowed, held.len());
        }
    }

    #[tokio::test]
    async fn test_exhausted_without_blocking() {
        let (_, pool) = pool_with(PoolConfig {
            max_total: 2,
            block_when_exhausted: false,
            ..Default::default()
        });

        let (a, b, c) = tokio::join!(pool.borrow(), pool.borrow(), pool.borrow());
        let results = [a, b, c];

        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(ResilienceError::PoolExhausted)))
            .count();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(exhausted, 1);
        assert_eq!(ok, 2);
    }

    #[tokio::test]
    async fn test_blocking_borrow_times_out() {
        let (_, pool) = pool_with(PoolConfig {
            max_total: 1,
            max_wait: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let held = pool.borrow().await.unwrap();
        let result = pool.borrow().await;
        assert!(matches!(result, Err(ResilienceError::Timeout(_))));

        pool.release(held).await;
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_borrow_wakes_on_release() {
        let (_, pool) = pool_with(PoolConfig {
            max_total: 1,
            ..Default::default()
        });

        let held = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|c| c.serial) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held).await;

        let serial = waiter.await.unwrap().unwrap();
        assert_eq!(serial, 1);
    }

    #[tokio::test]
    async fn test_blocked_borrow_fails_when_closed() {
        let (_, pool) = pool_with(PoolConfig {
            max_total: 1,
            ..Default::default()
        });

        let _held = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|c| c.serial) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close().await;

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(ResilienceError::PoolClosed));
    }

    #[tokio::test]
    async fn test_release_beyond_max_idle_destroys() {
        let (factory, pool) = pool_with(PoolConfig {
            max_total: 4,
            max_idle: 1,
            ..Default::default()
        });

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_client_replaced_on_borrow() {
        let (factory, pool) = pool_with(PoolConfig {
            test_on_borrow: true,
            ..Default::default()
        });

        let client = pool.borrow().await.unwrap();
        client.healthy.store(false, Ordering::SeqCst);
        pool.release(client).await;

        let replacement = pool.borrow().await.unwrap();
        assert_eq!(replacement.serial, 2);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_client_destroyed_on_return() {
        let (factory, pool) = pool_with(PoolConfig {
            test_on_return: true,
            ..Default::default()
        });

        let client = pool.borrow().await.unwrap();
        client.healthy.store(false, Ordering::SeqCst);
        pool.release(client).await;

        assert_eq!(pool.stats().await.idle, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_failure_frees_slot() {
        let (factory, pool) = pool_with(PoolConfig {
            max_total: 1,
            block_when_exhausted: false,
            ..Default::default()
        });

        factory.fail_create.store(true, Ordering::SeqCst);
        let result = pool.borrow().await;
        assert!(matches!(result, Err(ResilienceError::ConnectError(_))));
        assert_eq!(pool.stats().await.total, 0);

        factory.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_with_client_returns_on_error() {
        let (_, pool) = pool_with(PoolConfig::default());

        let result: Result<(), _> = pool
            .with_client(|_client| async { Err(ResilienceError::NotFound) })
            .await;
        assert_eq!(result, Err(ResilienceError::NotFound));

        let stats = pool.stats().await;
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_evict_expired_and_refill_min_idle() {
        let (factory, pool) = pool_with(PoolConfig {
            min_idle: 1,
            num_tests_per_eviction_run: 0,
            min_evictable_idle_time: Some(Duration::from_millis(10)),
            ..Default::default()
        });

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.evict().await;

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(factory.counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_evict_unhealthy_while_idle() {
        let (factory, pool) = pool_with(PoolConfig {
            test_while_idle: true,
            ..Default::default()
        });

        let client = pool.borrow().await.unwrap();
        let healthy = client.healthy.clone();
        pool.release(client).await;

        healthy.store(false, Ordering::SeqCst);
        pool.evict().await;

        assert_eq!(pool.stats().await.idle, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_borrow_during_eviction_gets_kept_client() {
        let (factory, pool) = pool_with(PoolConfig {
            max_total: 1,
            test_while_idle: true,
            ..Default::default()
        });

        let client = pool.borrow().await.unwrap();
        pool.release(client).await;
        factory.slow_validate.store(true, Ordering::SeqCst);

        let evictor = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.evict().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let borrowed = tokio::time::timeout(Duration::from_secs(2), pool.borrow())
            .await
            .expect("borrower parked during eviction was not woken")
            .unwrap();
        assert_eq!(borrowed.serial, 1);

        evictor.await.unwrap();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);
        pool.release(borrowed).await;
    }

    #[tokio::test]
    async fn test_default_pool_utilization() {
        let factory = Arc::new(TestFactory::default());
        let pool = ClientPool::<TestClient>::new_default(factory);
        assert_eq!(pool.config().max_total, 8);
        assert_eq!(pool.stats().await.utilization(), 0.0);

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        assert_eq!(pool.stats().await.utilization(), 25.0);

        pool.release(a).await;
        pool.release(b).await;
        // idle clients still count toward the pool size
        assert_eq!(pool.stats().await.utilization(), 25.0);
    }

    #[tokio::test]
    async fn test_abandoned_client_reclaimed_on_maintenance() {
        let (factory, pool) = pool_with(PoolConfig {
            remove_abandoned_on_maintenance: true,
            remove_abandoned_timeout: Duration::from_millis(10),
            ..Default::default()
        });

        let leaked = pool.borrow().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.evict().await;

        let stats = pool.stats().await;
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.reclaimed, 1);

        // A late return of a reclaimed client must not re-enter the pool
        pool.release(leaked).await;
        assert_eq!(pool.stats().await.idle, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_client_reclaimed_on_borrow() {
        let (_, pool) = pool_with(PoolConfig {
            max_total: 1,
            max_wait: Some(Duration::from_millis(200)),
            remove_abandoned_on_borrow: true,
            remove_abandoned_timeout: Duration::from_millis(10),
            ..Default::default()
        });

        let _leaked = pool.borrow().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = pool.borrow().await.unwrap();
        assert_eq!(fresh.serial, 2);
    }

    #[tokio::test]
    async fn test_close_drains_everything() {
        let (factory, pool) = pool_with(PoolConfig::default());

        let idle = pool.borrow().await.unwrap();
        let _borrowed = pool.borrow().await.unwrap();
        pool.release(idle).await;

        pool.close().await;

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.borrowed, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);

        assert!(matches!(
            pool.borrow().await,
            Err(ResilienceError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_twice_is_harmless() {
        let (factory, pool) = pool_with(PoolConfig::default());

        let client = pool.borrow().await.unwrap();
        pool.release(client).await;

        pool.close().await;
        pool.close().await;

        assert!(pool.is_closed().await);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_evictor_runs() {
        let (factory, pool) = pool_with(PoolConfig {
            time_between_eviction_runs: Some(Duration::from_secs(1)),
            min_evictable_idle_time: Some(Duration::from_millis(500)),
            ..Default::default()
        });

        let client = pool.borrow().await.unwrap();
        pool.release(client).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(pool.stats().await.idle, 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        pool.close().await;
    }
}
