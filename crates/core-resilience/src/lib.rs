//! Storm Core Resilience: pooled clients and fault-tolerant bulk writes
//!
//! # Overview
//!
//! Store-agnostic building blocks for talking to a remote search store that
//! may disappear at any time:
//!
//! - **Client Pool**: bounded reuse of clients with validation, idle eviction
//!   and abandoned-client reclamation
//! - **Bulk Indexer**: batches single writes and flushes them on a timer or
//!   size threshold through pooled clients
//! - **Failure Queue**: holds writes that failed to commit until the store is
//!   reachable again
//! - **Connectivity**: two-state (healthy/degraded) tracker driven by a
//!   heartbeat, plus the shared reachability flag
//!
//! Nothing here knows about HTTP or a wire format. Callers plug those in via
//! [`PoolFactory`] and [`BulkExecutor`].
//!
//! # Architecture
//!
//! ```text
//!   submit ──▶ ┌──────────────┐  flush  ┌──────────────┐
//!              │ Bulk Indexer │ ──────▶ │ Client Pool  │ ──▶ store
//!              └──────┬───────┘         └──────▲───────┘
//!                     │ failed items           │ rebuild
//!                     ▼                        │
//!              ┌──────────────┐  drain  ┌──────┴───────┐
//!              │ Failure Queue│ ◀────── │ Connectivity │ ◀── heartbeat
//!              └──────────────┘         └──────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```
//! use storm_core_resilience::{ClientPool, PoolConfig, PoolFactory, ResilienceError};
//! use std::sync::Arc;
//!
//! # #[derive(Clone)]
//! # struct Conn;
//! struct ConnFactory;
//!
//! #[async_trait::async_trait]
//! impl PoolFactory<Conn> for ConnFactory {
//!     async fn create(&self) -> Result<Conn, ResilienceError> {
//! #       Ok(Conn)
//!     }
//!
//!     async fn validate(&self, _conn: &Conn) -> bool {
//!         true
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pool = ClientPool::<Conn>::new(Arc::new(ConnFactory), PoolConfig::default());
//!
//! let answer = pool.with_client(|_conn| async { Ok(42) }).await?;
//! assert_eq!(answer, 42);
//!
//! pool.close().await;
//! # Ok::<(), ResilienceError>(())
//! # }).unwrap();
//! ```

pub mod bulk;
pub mod client_pool;
pub mod connectivity;
pub mod error;
pub mod failure_queue;

// Re-export main types for convenience
pub use bulk::{
    BulkAction, BulkExecutor, BulkIndexer, BulkIndexerConfig, BulkItem, BulkItemOutcome,
    BulkListener, BulkStats, NoopListener,
};
pub use client_pool::{ClientPool, PoolConfig, PoolFactory, PoolStats, PooledClient};
pub use connectivity::{
    ConnectivityConfig, ConnectivityMonitor, ConnectivityState, ConnectivityStats, Reachability,
    Transition,
};
pub use error::ResilienceError;
pub use failure_queue::{FailureQueue, FailureQueueStats};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use storm_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::bulk::{BulkExecutor, BulkIndexer, BulkIndexerConfig, BulkItem, BulkListener};
    pub use super::client_pool::{ClientPool, PoolConfig, PoolFactory};
    pub use super::connectivity::{ConnectivityMonitor, ConnectivityState, Reachability, Transition};
    pub use super::error::ResilienceError;
    pub use super::failure_queue::FailureQueue;
}
