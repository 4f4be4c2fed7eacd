//! In-memory search store used by the integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storm_aqi::service::{ClientPoolService, ServiceSettings};
use storm_aqi::store::{StoreClient, StoreRequest, StoreResponse};
use storm_aqi::ResilienceError;
use storm_core_resilience::{ConnectivityConfig, PoolFactory};

/// Shared state behind every [`FakeClient`]
#[derive(Default)]
pub struct FakeStore {
    pings: Mutex<VecDeque<bool>>,
    docs: Mutex<HashMap<(String, String), Value>>,
    indices: Mutex<HashSet<String>>,
    scroll_pages: Mutex<Vec<Vec<Value>>>,
    scroll_cursor: AtomicUsize,
    cleared_scrolls: Mutex<Vec<String>>,
    bulk_down: AtomicBool,
    bulk_batches: Mutex<Vec<usize>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue probe answers; once used up every ping succeeds
    pub fn script_pings(&self, answers: &[bool]) {
        self.pings.lock().unwrap().extend(answers.iter().copied());
    }

    pub fn put_doc(&self, index: &str, id: &str, doc: Value) {
        self.docs
            .lock()
            .unwrap()
            .insert((index.to_string(), id.to_string()), doc);
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indices.lock().unwrap().contains(index)
    }

    pub fn set_scroll_pages(&self, pages: Vec<Vec<Value>>) {
        *self.scroll_pages.lock().unwrap() = pages;
    }

    pub fn cleared_scrolls(&self) -> Vec<String> {
        self.cleared_scrolls.lock().unwrap().clone()
    }

    /// Make every bulk request fail at the transport level
    pub fn set_bulk_down(&self, down: bool) {
        self.bulk_down.store(down, Ordering::SeqCst);
    }

    /// Item count of every bulk request that reached the store
    pub fn bulk_batches(&self) -> Vec<usize> {
        self.bulk_batches.lock().unwrap().clone()
    }

    fn ping(&self) -> Result<StoreResponse, ResilienceError> {
        let ok = self.pings.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(StoreResponse::new(200, Value::Null))
        } else {
            Err(ResilienceError::ConnectError("connection refused".into()))
        }
    }

    fn scroll_page(&self, page: usize) -> StoreResponse {
        let hits: Vec<Value> = self
            .scroll_pages
            .lock()
            .unwrap()
            .get(page)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|source| json!({ "_source": source }))
            .collect();
        StoreResponse::new(
            200,
            json!({
                "_scroll_id": format!("scroll-{}", page),
                "hits": { "total": { "value": hits.len() }, "hits": hits }
            }),
        )
    }

    fn bulk(&self, body: &str) -> Result<StoreResponse, ResilienceError> {
        if self.bulk_down.load(Ordering::SeqCst) {
            return Err(ResilienceError::ConnectError("connection reset".into()));
        }

        let mut items = Vec::new();
        let mut lines = body.lines();
        while let Some(line) = lines.next() {
            let action: Value = serde_json::from_str(line).unwrap();
            let (name, _) = action.as_object().unwrap().iter().next().unwrap();
            if name != "delete" {
                lines.next();
            }
            items.push(json!({ name.clone(): { "status": 201 } }));
        }

        self.bulk_batches.lock().unwrap().push(items.len());
        Ok(StoreResponse::new(200, json!({ "errors": false, "items": items })))
    }
}

#[derive(Clone)]
pub struct FakeClient {
    store: Arc<FakeStore>,
}

#[async_trait::async_trait]
impl StoreClient for FakeClient {
    async fn send(&self, request: &StoreRequest) -> Result<StoreResponse, ResilienceError> {
        let store = &self.store;
        match request {
            StoreRequest::Ping => store.ping(),
            StoreRequest::Get { index, id } => {
                let doc = store
                    .docs
                    .lock()
                    .unwrap()
                    .get(&(index.clone(), id.clone()))
                    .cloned();
                Ok(match doc {
                    Some(source) => StoreResponse::new(
                        200,
                        json!({ "_index": index, "_id": id, "found": true, "_source": source }),
                    ),
                    None => StoreResponse::new(404, json!({ "found": false })),
                })
            }
            StoreRequest::Search { .. } => {
                store.scroll_cursor.store(1, Ordering::SeqCst);
                Ok(store.scroll_page(0))
            }
            StoreRequest::Scroll { .. } => {
                let page = store.scroll_cursor.fetch_add(1, Ordering::SeqCst);
                Ok(store.scroll_page(page))
            }
            StoreRequest::ClearScroll { scroll_id } => {
                store.cleared_scrolls.lock().unwrap().push(scroll_id.clone());
                Ok(StoreResponse::new(200, json!({ "succeeded": true })))
            }
            StoreRequest::Bulk { body, .. } => store.bulk(body),
            StoreRequest::IndexExists { index } => {
                let status = if store.has_index(index) { 200 } else { 404 };
                Ok(StoreResponse::new(status, Value::Null))
            }
            StoreRequest::IndexCreate { index, .. } => {
                store.indices.lock().unwrap().insert(index.clone());
                Ok(StoreResponse::new(200, json!({ "acknowledged": true })))
            }
        }
    }
}

pub struct FakeFactory {
    store: Arc<FakeStore>,
}

#[async_trait::async_trait]
impl PoolFactory<FakeClient> for FakeFactory {
    async fn create(&self) -> Result<FakeClient, ResilienceError> {
        Ok(FakeClient {
            store: self.store.clone(),
        })
    }

    async fn validate(&self, client: &FakeClient) -> bool {
        client.ping().await
    }
}

/// Settings with the heartbeat task disabled; tests drive `heartbeat()` by hand
pub fn manual_settings() -> ServiceSettings {
    ServiceSettings {
        monitor: ConnectivityConfig {
            check_interval: Duration::ZERO,
        },
        ..ServiceSettings::default()
    }
}

pub async fn start_service(
    store: &Arc<FakeStore>,
    settings: ServiceSettings,
) -> Arc<ClientPoolService<FakeClient>> {
    storm_aqi::logging::init_test_logging();
    let factory: Arc<dyn PoolFactory<FakeClient>> = Arc::new(FakeFactory {
        store: store.clone(),
    });
    ClientPoolService::start(factory, settings).await
}
