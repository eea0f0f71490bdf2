//! Inbound streaming-provider webhook events (new `object_*` format and legacy `payload`).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Events that mean "the media is ready" on their own.
pub const READY_EVENTS: [&str; 5] = [
    "completed",
    "ready",
    "video.ready",
    "recording.completed",
    "recording.ready",
];

/// Events that only mean "ready" when the embedded state is `finished`.
pub const UPDATE_EVENTS: [&str; 3] = ["updated", "video.updated", "recording.updated"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawWebhookEvent")]
pub struct WebhookEvent {
    /// `event` in the new format, `event_type` in the legacy one.
    #[serde(rename = "event")]
    pub event_type: String,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    /// New-format fields, e.g. `download_url`, `encodings`, `file_name`, `state`.
    pub object_data: Map<String, Value>,
    /// Legacy-format fields, e.g. `id`, `name`, `encodings`, `state`.
    #[serde(rename = "payload")]
    pub legacy_payload: Map<String, Value>,
}

/// Wire shape. Both event keys may be present; `event` wins.
#[derive(Deserialize)]
struct RawWebhookEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    object_type: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    object_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    object_data: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    payload: Map<String, Value>,
}

impl From<RawWebhookEvent> for WebhookEvent {
    fn from(raw: RawWebhookEvent) -> Self {
        let event_type = raw
            .event
            .filter(|e| !e.trim().is_empty())
            .or(raw.event_type)
            .unwrap_or_default();
        Self {
            event_type,
            object_type: raw.object_type,
            object_id: raw.object_id,
            object_data: raw.object_data,
            legacy_payload: raw.payload,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Non-empty trimmed string at `key`.
pub(crate) fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl WebhookEvent {
    /// Embedded processing state, new format first.
    pub fn state(&self) -> Option<&str> {
        str_field(&self.object_data, "state").or_else(|| str_field(&self.legacy_payload, "state"))
    }

    /// Readiness gate: only these events start the ingestion pipeline.
    pub fn is_ready(&self) -> bool {
        let event = self.event_type.trim().to_ascii_lowercase();
        if READY_EVENTS.contains(&event.as_str()) {
            return true;
        }
        UPDATE_EVENTS.contains(&event.as_str())
            && self
                .state()
                .is_some_and(|s| s.eq_ignore_ascii_case("finished"))
    }

    pub fn is_recording(&self) -> bool {
        self.object_type
            .as_deref()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("recording"))
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Name used in the notification subject and attachment.
    pub fn display_name(&self) -> String {
        str_field(&self.object_data, "file_name")
            .or_else(|| str_field(&self.legacy_payload, "name"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("video_{}", self.object_id().unwrap_or("unknown")))
    }
}
