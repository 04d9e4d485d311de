//! Canonical event envelope stored for every accepted webhook.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type assigned when the body does not name one.
pub const DEFAULT_EVENT_TYPE: &str = "webhook.received";

/// Source assigned when the body does not name one.
pub const DEFAULT_SOURCE: &str = "external";

/// Normalized `{id, type, created, source, data: {object}}` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event identifier, taken from the body or generated.
    pub id: String,
    /// Event type such as `invoice.paid`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp in seconds.
    pub created: i64,
    /// Originating system.
    pub source: String,
    /// Wrapped payload.
    pub data: EnvelopeData,
    /// Optional string metadata carried from the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Payload holder inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    /// The business object of the event.
    pub object: Value,
}

impl EventEnvelope {
    /// Wraps an arbitrary JSON body.
    ///
    /// Top-level `id`, `type`, `created`, `source` and `metadata` fields are
    /// lifted into the envelope when present and well-typed; anything missing
    /// is defaulted. A body that already carries `data.object` keeps that
    /// object, otherwise the whole body becomes the object.
    pub fn wrap(body: Value, now: DateTime<Utc>) -> Self {
        let fields = body.as_object();
        let text = |name: &str| {
            fields
                .and_then(|f| f.get(name))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        let id = text("id").unwrap_or_else(|| format!("evt_{}", Uuid::new_v4().simple()));
        let event_type = text("type").unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_owned());
        let source = text("source").unwrap_or_else(|| DEFAULT_SOURCE.to_owned());
        let created = fields
            .and_then(|f| f.get("created"))
            .and_then(Value::as_i64)
            .unwrap_or_else(|| now.timestamp());
        let metadata = fields.and_then(|f| f.get("metadata")).and_then(string_map);

        let embedded = fields
            .and_then(|f| f.get("data"))
            .and_then(Value::as_object)
            .and_then(|data| data.get("object"))
            .cloned();
        let object = embedded.unwrap_or(body);

        Self { id, event_type, created, source, data: EnvelopeData { object }, metadata }
    }
}

fn string_map(value: &Value) -> Option<BTreeMap<String, String>> {
    let map = value.as_object()?;
    map.iter().map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned()))).collect()
}
