//! Outbound telemetry records: impressions (one per flag evaluation) and
//! user-generated events. Both are created at evaluation time, queued in the
//! cache, and uploaded in bulk by the flush tasks. Records are immutable
//! once created.
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the timestamp format of the telemetry
/// bulk endpoints.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A record of one flag evaluation outcome.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub key_name: String,
    pub feature: String,
    pub treatment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    /// Change number of the split at the time of evaluation.
    pub change_number: i64,
}

/// A user-generated analytics event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub key: String,
    pub traffic_type_name: String,
    pub event_type_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
}
