use async_trait::async_trait;

use metrics::{counter, histogram};
use serde_json::json;
use tracing::info;

use crate::api::RelayError;
use crate::event::ServerEvent;
use crate::sinks::{Event, SinkResponse};

/// Logs batches instead of sending them, for local debugging.
pub struct PrintSink {}

#[async_trait]
impl Event for PrintSink {
    async fn send_batch(&self, events: Vec<ServerEvent>) -> Result<SinkResponse, RelayError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        histogram!("relay_event_batch_size").record(events.len() as f64);
        counter!("relay_events_printed_total").increment(events.len() as u64);
        for event in &events {
            info!("event: {event:?}");
        }

        Ok(json!({ "events_received": events.len() }))
    }
}
