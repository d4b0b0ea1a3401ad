#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use time::macros::datetime;
use time::OffsetDateTime;
use tower::ServiceExt;

use capi_relay::api::RelayError;
use capi_relay::dedup::DeduplicationCache;
use capi_relay::event::ServerEvent;
use capi_relay::limiters::RateLimiter;
use capi_relay::pipeline::{AdmissionPipeline, EventDefaults};
use capi_relay::router::router;
use capi_relay::sinks::{self, SinkResponse};
use capi_relay::time::TimeSource;

pub const ALLOWED_ORIGIN: &str = "https://shop.example";
pub const START: OffsetDateTime = datetime!(2024-03-01 12:00:00 UTC);

#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(START)),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl TimeSource for ManualClock {
    fn current_time(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

#[derive(Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Vec<ServerEvent>>>>,
}

impl MemorySink {
    pub fn batches(&self) -> Vec<Vec<ServerEvent>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl sinks::Event for MemorySink {
    async fn send_batch(&self, events: Vec<ServerEvent>) -> Result<SinkResponse, RelayError> {
        let count = events.len();
        self.batches.lock().unwrap().push(events);
        Ok(json!({ "events_received": count, "fbtrace_id": "trace" }))
    }
}

/// Rejects every batch the way the Conversions API does for a bad token.
pub struct RejectingSink;

#[async_trait]
impl sinks::Event for RejectingSink {
    async fn send_batch(&self, _: Vec<ServerEvent>) -> Result<SinkResponse, RelayError> {
        Err(RelayError::Upstream {
            status: 400,
            details: json!({ "error": { "message": "Invalid OAuth access token", "code": 190 } }),
        })
    }
}

pub fn setup_router<S>(clock: ManualClock, sink: S) -> Router
where
    S: sinks::Event + Send + Sync + 'static,
{
    let pipeline = AdmissionPipeline::new(
        clock,
        sink,
        DeduplicationCache::default(),
        RateLimiter::default(),
        EventDefaults::default(),
    );

    router(pipeline, &[ALLOWED_ORIGIN.to_string()], 1024 * 1024, false)
}

pub fn post_request(body: &Value, client_ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/events")
        .header("content-type", "application/json")
        .header("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")
        .header("origin", ALLOWED_ORIGIN)
        .header("x-forwarded-for", client_ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();

    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}
