//! HTTP batch source.
//!
//! Issues `GET <shard base>?batch_num=<id>` against the shard that owns the
//! batch and pulls the configured list field out of the JSON body. Only a
//! 200 counts as success; everything else becomes a retryable error and the
//! retry loop in [`super::retry`] decides what happens next.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{BatchSource, FetchError};
use crate::domain::{BatchId, Record};
use crate::shard::ShardMap;

/// Default JSON field holding the record list.
pub const DEFAULT_LIST_FIELD: &str = "data";

pub struct HttpBatchSource {
    client: reqwest::blocking::Client,
    shards: Arc<ShardMap>,
    list_field: String,
}

impl HttpBatchSource {
    pub fn new(
        shards: Arc<ShardMap>,
        timeout: Duration,
        list_field: impl Into<String>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("snapfeed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            shards,
            list_field: list_field.into(),
        })
    }

    pub fn shards(&self) -> &ShardMap {
        &self.shards
    }
}

impl BatchSource for HttpBatchSource {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch_once(&self, batch: BatchId) -> Result<Vec<Record>, FetchError> {
        let base = self.shards.resolve_endpoint(batch)?;

        let resp = self
            .client
            .get(base)
            .query(&[("batch_num", batch.get())])
            .send()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        let body = resp
            .text()
            .map_err(|e| FetchError::Transport(format!("failed to read body: {e}")))?;

        parse_records(&body, &self.list_field)
    }
}

/// Extract the record list from a response body.
///
/// A missing (or `null`) list field is an empty batch. A body that is not a
/// JSON object, or a list field that is not an array, is malformed.
pub fn parse_records(body: &str, list_field: &str) -> Result<Vec<Record>, FetchError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let Value::Object(mut map) = value else {
        return Err(FetchError::MalformedResponse(
            "response body is not a JSON object".into(),
        ));
    };

    match map.remove(list_field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.into_iter().map(Record::new).collect()),
        Some(other) => Err(FetchError::MalformedResponse(format!(
            "field '{list_field}' is not a list (found {})",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
