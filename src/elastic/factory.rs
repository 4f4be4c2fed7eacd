//! Pool factory producing [`EsClient`] handles

use storm_core_resilience::{PoolFactory, ResilienceError};
use tracing::debug;

use super::client::{EsClient, EsClientSettings};
use crate::config::ElasticConfig;
use crate::error::Result;
use crate::store::StoreClient;

/// Builds, probes and tears down store clients for the pool
#[derive(Debug, Clone)]
pub struct EsPoolFactory {
    settings: EsClientSettings,
}

impl EsPoolFactory {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        Ok(Self::from_settings(EsClientSettings::from_config(config)?))
    }

    pub fn from_settings(settings: EsClientSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EsClientSettings {
        &self.settings
    }
}

#[async_trait::async_trait]
impl PoolFactory<EsClient> for EsPoolFactory {
    async fn create(&self) -> std::result::Result<EsClient, ResilienceError> {
        let client = EsClient::new(self.settings.clone())
            .map_err(|e| ResilienceError::ConnectError(e.to_string()))?;
        debug!(endpoints = self.settings.endpoints.len(), "Store client created");
        Ok(client)
    }

    async fn validate(&self, client: &EsClient) -> bool {
        client.ping().await
    }

    async fn activate(&self, client: &EsClient) -> std::result::Result<(), ResilienceError> {
        if client.endpoints().is_empty() {
            return Err(ResilienceError::ConnectError(
                "client has no endpoints".to_string(),
            ));
        }
        Ok(())
    }
}
