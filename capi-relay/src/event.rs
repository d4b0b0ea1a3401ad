use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::RelayError;
use crate::client_ip::ClientContext;

/// Request body posted by the browser: `{ "data": [event, ...] }`.
/// Members are kept as raw JSON until every one of them has been validated.
#[derive(Debug, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub data: Option<Vec<Value>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(default)]
    pub event_name: Option<String>,
    pub event_id: String,
    #[serde(default)]
    pub event_time: Option<i64>,
    #[serde(default)]
    pub event_source_url: Option<String>,
    #[serde(default)]
    pub action_source: Option<String>,
    #[serde(default)]
    pub custom_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub user_data: Option<RawUserData>,
}

/// User data as sent by the client. Anything not listed here, including any
/// client supplied address or user agent, is ignored.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct RawUserData {
    #[serde(default)]
    pub external_id: Option<Value>,
    #[serde(default)]
    pub fbp: Option<String>,
    #[serde(default)]
    pub fbc: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// An event as forwarded to the Conversions API.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerEvent {
    pub event_name: String,
    pub event_id: String,
    pub event_time: i64,
    pub event_source_url: String,
    pub action_source: String,
    pub custom_data: Map<String, Value>,
    pub user_data: ServerUserData,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ServerUserData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<Value>,
    pub client_ip_address: String,
    pub client_user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// What the relay knows about the caller, taken from the request rather than
/// from the payload.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client: ClientContext,
    pub user_agent: String,
    pub origin: String,
}

/// Outbound payload, a single batched call.
#[derive(Debug, Serialize)]
pub struct ServerBatch<'a> {
    pub data: &'a [ServerEvent],
}

impl RawBatch {
    /// Decodes and validates a whole batch. Any invalid member fails the whole
    /// batch, before any event gets to the dedup cache.
    pub fn from_bytes(bytes: &[u8]) -> Result<Vec<RawEvent>, RelayError> {
        tracing::debug!(len = bytes.len(), "decoding event batch");

        let batch: RawBatch = serde_json::from_slice(bytes)?;
        let members = batch.data.ok_or(RelayError::MissingData)?;
        if members.is_empty() {
            return Err(RelayError::EmptyBatch);
        }

        // Check every id first, a missing id is the error the client most needs to see
        if !members.iter().all(has_event_id) {
            return Err(RelayError::MissingEventId);
        }

        members
            .into_iter()
            .enumerate()
            .map(|(index, member)| {
                serde_json::from_value::<RawEvent>(member).map_err(|e| RelayError::InvalidEvent {
                    index,
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

fn has_event_id(member: &Value) -> bool {
    member
        .get("event_id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty())
}

/// Empty strings count as absent, like unset fields.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
