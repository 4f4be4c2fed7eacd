//! Bulk wire format and the store-backed bulk executor
//!
//! A bulk body is newline-delimited JSON: one action line per item, followed
//! by a payload line for `index`, `create` and `update`. The response carries
//! one entry per item, in request order.

use serde_json::{json, Map, Value};
use std::time::Duration;
use storm_core_resilience::{BulkAction, BulkExecutor, BulkItem, BulkItemOutcome, ResilienceError};

use crate::store::{StoreClient, StoreRequest};

/// Encode items as an NDJSON bulk body (trailing newline included)
pub fn encode_bulk(items: &[BulkItem]) -> String {
    let mut body = String::with_capacity(items.iter().map(BulkItem::size_hint).sum());
    for item in items {
        let mut meta = Map::new();
        meta.insert("_index".to_string(), Value::String(item.index.clone()));
        if let Some(id) = &item.id {
            meta.insert("_id".to_string(), Value::String(id.clone()));
        }
        body.push_str(&json!({ item.action.as_str(): meta }).to_string());
        body.push('\n');

        if !item.action.has_payload() {
            continue;
        }
        let payload = item.payload.as_deref().unwrap_or("{}");
        match item.action {
            BulkAction::Update => body.push_str(&update_payload(payload)),
            _ => body.push_str(&single_line(payload)),
        }
        body.push('\n');
    }
    body
}

/// Wrap a partial document as `{"doc": ...}` unless it already is an update body
fn update_payload(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(obj)) if obj.contains_key("doc") || obj.contains_key("script") => {
            Value::Object(obj).to_string()
        }
        Ok(doc) => json!({ "doc": doc }).to_string(),
        Err(_) => format!("{{\"doc\":{}}}", single_line(payload)),
    }
}

/// NDJSON needs every payload on one line
fn single_line(payload: &str) -> String {
    if !payload.contains('\n') {
        return payload.to_string();
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => value.to_string(),
        Err(_) => payload.replace(['\r', '\n'], " "),
    }
}

/// Check that a payload is valid JSON before it is accepted for bulk write
pub fn validate_payload(item: &BulkItem) -> Result<(), ResilienceError> {
    match (&item.payload, item.action.has_payload()) {
        (Some(payload), true) => serde_json::from_str::<serde::de::IgnoredAny>(payload)
            .map(|_| ())
            .map_err(|e| ResilienceError::Validation(format!("bulk payload is not JSON: {}", e))),
        (None, true) => Err(ResilienceError::Validation(format!(
            "{} item without payload",
            item.action.as_str()
        ))),
        (_, false) => Ok(()),
    }
}

/// Per-item outcomes of a bulk response, in request order
pub fn parse_bulk_response(body: &Value) -> Result<Vec<BulkItemOutcome>, ResilienceError> {
    let entries = body
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| ResilienceError::FlushError("bulk response has no items".to_string()))?;

    Ok(entries
        .iter()
        .map(|entry| {
            let result = entry
                .as_object()
                .and_then(|obj| obj.values().next())
                .unwrap_or(&Value::Null);
            let status = result
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(500);

            match result.get("error") {
                Some(error) => BulkItemOutcome::rejected(status, describe_error(error)),
                None => BulkItemOutcome::ok(status),
            }
        })
        .collect())
}

fn describe_error(error: &Value) -> String {
    match (
        error.get("type").and_then(Value::as_str),
        error.get("reason").and_then(Value::as_str),
    ) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

/// Sends bulk batches through any [`StoreClient`]
#[derive(Debug, Clone, Default)]
pub struct StoreBulkExecutor {
    /// Server-side `timeout` of the bulk request
    pub timeout: Option<Duration>,
}

#[async_trait::async_trait]
impl<C: StoreClient> BulkExecutor<C> for StoreBulkExecutor {
    async fn execute(
        &self,
        client: &C,
        items: &[BulkItem],
    ) -> Result<Vec<BulkItemOutcome>, ResilienceError> {
        let request = StoreRequest::Bulk {
            body: encode_bulk(items),
            timeout: self.timeout,
        };
        let body = client.send(&request).await?.into_result()?;
        parse_bulk_response(&body)
    }
}
