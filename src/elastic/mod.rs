//! Search-store binding over HTTP
//!
//! - [`client`]: reqwest-backed [`EsClient`]
//! - [`factory`]: [`EsPoolFactory`] handing those clients to the pool
//! - [`bulk`]: NDJSON bulk encoding and [`StoreBulkExecutor`]

pub mod bulk;
pub mod client;
pub mod factory;

pub use bulk::{encode_bulk, parse_bulk_response, validate_payload, StoreBulkExecutor};
pub use client::{EsClient, EsClientSettings};
pub use factory::EsPoolFactory;

use std::sync::Arc;
use storm_core_resilience::PoolFactory;

use crate::config::AppConfig;
use crate::error::Result;
use crate::service::{ClientPoolService, ServiceSettings};

/// The service bound to the HTTP store client
pub type EsService = ClientPoolService<EsClient>;

/// Build the store service described by `config`
pub async fn connect(config: &AppConfig) -> Result<Arc<EsService>> {
    let factory: Arc<dyn PoolFactory<EsClient>> = Arc::new(EsPoolFactory::new(&config.elastic)?);
    Ok(ClientPoolService::start(factory, ServiceSettings::from_config(config)).await)
}
