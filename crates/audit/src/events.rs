use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single recorded event, with its free-form payload flattened to the
/// top level so the JSONL on disk reads the same as a direct `emit()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub channel_key: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, channel_key: impl Into<String>, data: Map<String, Value>) -> Self {
        Self { event_type: event_type.into(), ts: Utc::now(), channel_key: channel_key.into(), data }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}
