use async_trait::async_trait;
use serde_json::Value;

use crate::api::RelayError;
use crate::event::ServerEvent;

pub mod graph;
pub mod print;

/// JSON body returned by the Conversions API, passed back to the caller.
pub type SinkResponse = Value;

#[async_trait]
pub trait Event {
    /// Delivers a whole batch in a single outbound call.
    async fn send_batch(&self, events: Vec<ServerEvent>) -> Result<SinkResponse, RelayError>;
}
