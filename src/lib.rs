/*!
 * Storm AQI - search store access layer
 *
 * Resilient access to the search store backing the AQI monitoring service:
 * - Bounded, validated client pool
 * - Connectivity heartbeat with automatic recovery
 * - Batched bulk writes with a retry queue for failed items
 * - Single-shot queries, scroll searches and index management
 */

pub mod config;
pub mod elastic;
pub mod error;
pub mod logging;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use config::{AppConfig, ElasticConfig, LogLevel};
pub use elastic::{connect, EsClient, EsPoolFactory, EsService};
pub use error::{Result, StormError};
pub use service::{ClientPoolService, ServiceSettings, ServiceStats};
pub use store::{StoreClient, StoreRequest, StoreResponse};
pub use storm_core_resilience::{BulkAction, BulkItem, ResilienceError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
