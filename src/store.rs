//! Store request model and the client seam
//!
//! [`StoreRequest`] names the handful of document and index APIs the service
//! needs. A [`StoreClient`] turns one into a [`StoreResponse`]; the HTTP
//! implementation lives in [`crate::elastic`].

use serde_json::Value;
use std::time::Duration;
use storm_core_resilience::ResilienceError;

/// One call against the search store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRequest {
    /// Liveness probe
    Ping,
    /// Fetch one document by id
    Get { index: String, id: String },
    /// Search, optionally opening a scroll context
    Search {
        index: String,
        body: Value,
        scroll: Option<Duration>,
        timeout: Option<Duration>,
    },
    /// Next page of an open scroll
    Scroll { scroll_id: String, scroll: Duration },
    /// Release a scroll context
    ClearScroll { scroll_id: String },
    /// Newline-delimited bulk body
    Bulk {
        body: String,
        timeout: Option<Duration>,
    },
    IndexExists { index: String },
    IndexCreate { index: String, body: Value },
}

impl StoreRequest {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            StoreRequest::Ping => "ping",
            StoreRequest::Get { .. } => "get",
            StoreRequest::Search { .. } => "search",
            StoreRequest::Scroll { .. } => "scroll",
            StoreRequest::ClearScroll { .. } => "clear_scroll",
            StoreRequest::Bulk { .. } => "bulk",
            StoreRequest::IndexExists { .. } => "index_exists",
            StoreRequest::IndexCreate { .. } => "index_create",
        }
    }
}

/// Status and decoded body of a store response
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    pub status: u16,
    /// JSON body; `Null` when the response had none
    pub body: Value,
}

impl StoreResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body of a 2xx response; `NotFound` for 404, `RequestError` otherwise
    pub fn into_result(self) -> Result<Value, ResilienceError> {
        match ResilienceError::from_status(self.status) {
            None => Ok(self.body),
            Some(e) => Err(e),
        }
    }
}

/// Transport seam between the service and the store.
///
/// Transport failures come back as `Err`; any HTTP status, 2xx or not,
/// comes back as `Ok`.
#[async_trait::async_trait]
pub trait StoreClient: Clone + Send + Sync + 'static {
    async fn send(&self, request: &StoreRequest) -> Result<StoreResponse, ResilienceError>;

    /// `true` only for a 2xx answer to [`StoreRequest::Ping`]
    async fn ping(&self) -> bool {
        matches!(self.send(&StoreRequest::Ping).await, Ok(response) if response.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_result_maps_status() {
        let ok = StoreResponse::new(200, json!({"acknowledged": true}));
        assert_eq!(ok.into_result(), Ok(json!({"acknowledged": true})));

        let missing = StoreResponse::new(404, json!({"found": false}));
        assert_eq!(missing.into_result(), Err(ResilienceError::NotFound));

        let conflict = StoreResponse::new(409, Value::Null);
        assert_eq!(
            conflict.into_result(),
            Err(ResilienceError::RequestError { status_code: 409 })
        );
    }

    #[derive(Clone)]
    struct Fixed(Result<u16, ResilienceError>);

    #[async_trait::async_trait]
    impl StoreClient for Fixed {
        async fn send(&self, _request: &StoreRequest) -> Result<StoreResponse, ResilienceError> {
            self.0.clone().map(|status| StoreResponse::new(status, Value::Null))
        }
    }

    #[tokio::test]
    async fn test_ping_is_false_on_error_or_bad_status() {
        assert!(Fixed(Ok(200)).ping().await);
        assert!(!Fixed(Ok(503)).ping().await);
        assert!(!Fixed(Err(ResilienceError::ConnectError("refused".into()))).ping().await);
    }
}
