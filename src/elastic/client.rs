//! HTTP client for the search store
//!
//! A cheap, cloneable handle over a `reqwest::Client`. Requests rotate over
//! the configured endpoints and are retried on transport errors and on
//! 502/503/504 up to `max_retries` times.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storm_core_resilience::ResilienceError;
use tracing::{debug, warn};

use crate::config::ElasticConfig;
use crate::error::{Result, StormError};
use crate::store::{StoreClient, StoreRequest, StoreResponse};

/// Idle keep-alive of pooled HTTP connections
const HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
/// Idle HTTP connections kept per host
const HTTP_MAX_IDLE_PER_HOST: usize = 10;

/// Connection settings shared by every client the factory builds
#[derive(Debug, Clone)]
pub struct EsClientSettings {
    pub endpoints: Vec<Url>,
    pub credentials: Option<(String, String)>,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub debug_logging: bool,
}

impl EsClientSettings {
    /// Parse and check the endpoints of `config`
    pub fn from_config(config: &ElasticConfig) -> Result<Self> {
        let endpoints = config
            .uri
            .iter()
            .map(|uri| uri.trim())
            .filter(|uri| !uri.is_empty())
            .map(|uri| {
                Url::parse(uri)
                    .map_err(|e| StormError::Config(format!("Invalid store endpoint '{}': {}", uri, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        if endpoints.is_empty() {
            return Err(StormError::Config(
                "No store endpoints configured".to_string(),
            ));
        }

        Ok(Self {
            endpoints,
            credentials: config
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            max_retries: config.max_retries,
            request_timeout: config.request_timeout(),
            debug_logging: config.enable_debug_logger,
        })
    }
}

struct EsClientInner {
    http: reqwest::Client,
    settings: EsClientSettings,
    next_endpoint: AtomicUsize,
}

/// Search store client
#[derive(Clone)]
pub struct EsClient {
    inner: Arc<EsClientInner>,
}

impl std::fmt::Debug for EsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsClient")
            .field("endpoints", &self.inner.settings.endpoints)
            .finish()
    }
}

impl EsClient {
    /// Build a client. Does not touch the network.
    pub fn new(settings: EsClientSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .pool_idle_timeout(HTTP_IDLE_TIMEOUT)
            .pool_max_idle_per_host(HTTP_MAX_IDLE_PER_HOST)
            .build()?;

        Ok(Self {
            inner: Arc::new(EsClientInner {
                http,
                settings,
                next_endpoint: AtomicUsize::new(0),
            }),
        })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.inner.settings.endpoints
    }

    fn next_endpoint(&self) -> Option<&Url> {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return None;
        }
        let n = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        endpoints.get(n % endpoints.len())
    }

    fn transport_error(&self, err: &reqwest::Error) -> ResilienceError {
        if err.is_timeout() {
            ResilienceError::Timeout(self.inner.settings.request_timeout)
        } else {
            ResilienceError::ConnectError(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl StoreClient for EsClient {
    async fn send(&self, request: &StoreRequest) -> std::result::Result<StoreResponse, ResilienceError> {
        let route = Route::of(request);
        let attempts = self.inner.settings.max_retries + 1;
        let mut last_error = ResilienceError::ConnectError("no store endpoint".to_string());

        for attempt in 1..=attempts {
            let Some(base) = self.next_endpoint() else {
                break;
            };
            let url = route.url(base)?;
            let started = Instant::now();

            let mut builder = self.inner.http.request(route.method.clone(), url.clone());
            if let Some((user, pass)) = &self.inner.settings.credentials {
                builder = builder.basic_auth(user, Some(pass));
            }
            builder = match &route.body {
                RouteBody::Empty => builder,
                RouteBody::Json(value) => builder.json(value),
                RouteBody::NdJson(body) => builder
                    .header(CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone()),
            };

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!(request = request.name(), %url, attempt, "Store request failed: {}", e);
                    last_error = self.transport_error(&e);
                    continue;
                }
            };

            let status = response.status().as_u16();
            if matches!(status, 502..=504) && attempt < attempts {
                warn!(request = request.name(), %url, status, attempt, "Store unavailable, retrying");
                last_error = ResilienceError::RequestError { status_code: status };
                continue;
            }

            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    last_error = self.transport_error(&e);
                    continue;
                }
            };

            if self.inner.settings.debug_logging {
                debug!(
                    request = request.name(),
                    method = %route.method,
                    %url,
                    status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    bytes = bytes.len(),
                    "Store request"
                );
            }

            return Ok(StoreResponse::new(status, decode_body(&bytes)));
        }

        Err(last_error)
    }
}

/// JSON body, `Null` for an empty body, or the raw text if it is not JSON
fn decode_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Store duration syntax (`20s`, `1500ms`)
pub(crate) fn duration_param(duration: Duration) -> String {
    if duration.subsec_millis() == 0 && duration.as_secs() > 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RouteBody {
    Empty,
    Json(Value),
    NdJson(String),
}

/// HTTP shape of a [`StoreRequest`]
#[derive(Debug, Clone, PartialEq)]
struct Route {
    method: Method,
    segments: Vec<String>,
    query: Vec<(&'static str, String)>,
    body: RouteBody,
}

impl Route {
    fn new(method: Method, segments: &[&str]) -> Self {
        Self {
            method,
            segments: segments.iter().map(|s| s.to_string()).collect(),
            query: Vec::new(),
            body: RouteBody::Empty,
        }
    }

    fn query(mut self, key: &'static str, value: Option<Duration>) -> Self {
        if let Some(value) = value {
            self.query.push((key, duration_param(value)));
        }
        self
    }

    fn body(mut self, body: RouteBody) -> Self {
        self.body = body;
        self
    }

    fn of(request: &StoreRequest) -> Self {
        match request {
            StoreRequest::Ping => Route::new(Method::HEAD, &[]),
            StoreRequest::Get { index, id } => Route::new(Method::GET, &[index.as_str(), "_doc", id.as_str()]),
            StoreRequest::Search {
                index,
                body,
                scroll,
                timeout,
            } => Route::new(Method::POST, &[index.as_str(), "_search"])
                .query("scroll", *scroll)
                .query("timeout", *timeout)
                .body(RouteBody::Json(body.clone())),
            StoreRequest::Scroll { scroll_id, scroll } => {
                Route::new(Method::POST, &["_search", "scroll"]).body(RouteBody::Json(json!({
                    "scroll": duration_param(*scroll),
                    "scroll_id": scroll_id,
                })))
            }
            StoreRequest::ClearScroll { scroll_id } => {
                Route::new(Method::DELETE, &["_search", "scroll"])
                    .body(RouteBody::Json(json!({ "scroll_id": [scroll_id] })))
            }
            StoreRequest::Bulk { body, timeout } => Route::new(Method::POST, &["_bulk"])
                .query("timeout", *timeout)
                .body(RouteBody::NdJson(body.clone())),
            StoreRequest::IndexExists { index } => Route::new(Method::HEAD, &[index.as_str()]),
            StoreRequest::IndexCreate { index, body } => {
                Route::new(Method::PUT, &[index.as_str()]).body(RouteBody::Json(body.clone()))
            }
        }
    }

    fn url(&self, base: &Url) -> std::result::Result<Url, ResilienceError> {
        let mut url = base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ResilienceError::ConnectError(format!("Endpoint cannot be a base URL: {}", base))
            })?;
            path.pop_if_empty();
            path.extend(&self.segments);
        }
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }
}
