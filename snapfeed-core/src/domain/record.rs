use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One upstream record, carried verbatim.
///
/// The pipeline never interprets record fields; it only counts and aggregates
/// them, so the raw JSON value is kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Value);

impl Record {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Record {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
