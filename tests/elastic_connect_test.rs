//! Building the HTTP-backed service from configuration

use std::path::Path;
use storm_aqi::config::AppConfig;
use storm_aqi::service::ServiceSettings;
use storm_aqi::{elastic, BulkItem, ResilienceError};
use storm_core_resilience::ConnectivityState;

#[test]
fn test_sample_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("conf/conf.toml");
    let config = AppConfig::from_file(&path).unwrap();
    config.validate().unwrap();

    let settings = ServiceSettings::from_config(&config);
    assert_eq!(settings.pool.max_total, 8);
    assert!(settings.pool.remove_abandoned_on_maintenance);
    assert_eq!(
        settings.pool.time_between_eviction_runs,
        Some(std::time::Duration::from_secs(60))
    );
    assert_eq!(config.aqi.his_index, "aqi-history-$");
}

#[tokio::test]
async fn test_unreachable_store_starts_degraded() {
    storm_aqi::logging::init_test_logging();

    let mut config = AppConfig::default();
    config.elastic.uri = vec!["http://127.0.0.1:1".to_string()];
    config.elastic.max_retries = 0;
    config.elastic.request_timeout_secs = 1;

    let service = elastic::connect(&config).await.unwrap();
    assert!(!service.is_reachable());
    assert_eq!(service.connectivity_state(), ConnectivityState::Degraded);

    let item = BulkItem::index("aqi-realtime", None, r#"{"aqi":1}"#);
    assert_eq!(
        service.submit_for_bulk_write(item),
        Err(ResilienceError::NotReachable)
    );

    let query = service.get_document("aqi-station", "st-1").await;
    assert!(query.is_err());
    assert!(!query.unwrap_err().is_not_found());

    service.close().await;
    service.close().await;
}

#[tokio::test]
async fn test_connect_rejects_invalid_endpoint() {
    let mut config = AppConfig::default();
    config.elastic.uri = vec!["not a url".to_string()];
    assert!(elastic::connect(&config).await.is_err());
}
