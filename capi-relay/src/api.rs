use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::client_ip::ClientContext;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("payload must hold a data array")]
    MissingData,
    #[error("request holds no event")]
    EmptyBatch,
    #[error("event_id is required on every event for browser and server deduplication")]
    MissingEventId,
    #[error("invalid event at index {index}: {reason}")]
    InvalidEvent { index: usize, reason: String },

    #[error("rate limited")]
    RateLimited,

    #[error("timed out waiting for the conversions API")]
    UpstreamTimeout,
    #[error("conversions API returned status {status}")]
    Upstream { status: u16, details: Value },
    #[error("conversions API could not be reached")]
    UpstreamUnavailable,
    #[error("invalid event batch could not be encoded")]
    NonRetryableSinkError,

    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("internal error")]
    Internal,
}

impl RelayError {
    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            RelayError::RequestParsingError(_) => "req_parsing",
            RelayError::MissingData => "missing_data",
            RelayError::EmptyBatch => "empty_batch",
            RelayError::MissingEventId => "missing_event_id",
            RelayError::InvalidEvent { .. } => "invalid_event",
            RelayError::RateLimited => "rate_limited",
            RelayError::UpstreamTimeout => "upstream_timeout",
            RelayError::Upstream { .. } => "upstream_error",
            RelayError::UpstreamUnavailable => "upstream_unavailable",
            RelayError::NonRetryableSinkError => "sink_non_retryable",
            RelayError::MethodNotAllowed => "method_not_allowed",
            RelayError::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::RequestParsingError(_)
            | RelayError::MissingData
            | RelayError::EmptyBatch
            | RelayError::MissingEventId
            | RelayError::InvalidEvent { .. } => StatusCode::BAD_REQUEST,

            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,

            RelayError::UpstreamTimeout => StatusCode::REQUEST_TIMEOUT,
            RelayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,

            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,

            RelayError::NonRetryableSinkError | RelayError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            RelayError::Upstream { details, .. } => json!({
                "error": "conversions API error",
                "details": details,
            }),
            err => json!({ "error": err.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeduplicationSummary {
    pub original: usize,
    pub processed: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpInfo {
    pub ip: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&ClientContext> for IpInfo {
    fn from(client: &ClientContext) -> Self {
        IpInfo {
            ip: client.address.clone(),
            kind: client.family.as_str().to_string(),
        }
    }
}

/// What the relay did with a request that passed the rate limiter and validation.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Every event of the batch was already admitted, nothing was sent upstream.
    AllDuplicates { blocked: usize, cache_size: usize },
    Forwarded {
        response: Value,
        deduplication: DeduplicationSummary,
        ip_info: IpInfo,
    },
}

impl IntoResponse for RelayOutcome {
    fn into_response(self) -> Response {
        let body = match self {
            RelayOutcome::AllDuplicates {
                blocked,
                cache_size,
            } => json!({
                "message": "all events were duplicates",
                "blocked": blocked,
                "cache": cache_size,
            }),
            RelayOutcome::Forwarded {
                response,
                deduplication,
                ip_info,
            } => {
                // The upstream body is passed back as is, with our summaries next to it
                let mut body = match response {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => Map::from_iter([("response".to_string(), other)]),
                };
                body.insert("deduplication".to_string(), json!(deduplication));
                body.insert("ip_info".to_string(), json!(ip_info));
                Value::Object(body)
            }
        };

        (StatusCode::OK, Json(body)).into_response()
    }
}
