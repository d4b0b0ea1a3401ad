use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::{counter, histogram};
use reqwest::header;
use serde_json::Value;
use tracing::{error, instrument, warn};

use crate::api::RelayError;
use crate::config::GraphConfig;
use crate::event::{ServerBatch, ServerEvent};
use crate::sinks::{Event, SinkResponse};

/// Sends event batches to the Conversions API `/{pixel_id}/events` endpoint.
pub struct GraphSink {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
    compression_threshold: usize,
}

impl GraphSink {
    pub fn new(config: &GraphConfig) -> anyhow::Result<GraphSink> {
        let pixel_id = config
            .pixel_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("PIXEL_ID is required to forward events"))?;
        let access_token = config
            .access_token
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow!("ACCESS_TOKEN is required to forward events"))?;

        let endpoint = format!(
            "{}/{}/{}/events",
            config.graph_api_url.trim_end_matches('/'),
            config.graph_api_version,
            pixel_id
        );

        GraphSink::with_endpoint(
            endpoint,
            access_token,
            config.request_timeout_ms.0,
            config.compression_threshold_bytes,
        )
    }

    pub fn with_endpoint(
        endpoint: String,
        access_token: String,
        request_timeout: Duration,
        compression_threshold: usize,
    ) -> anyhow::Result<GraphSink> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .context("failed to construct reqwest client for the conversions API")?;

        Ok(GraphSink {
            client,
            endpoint,
            access_token,
            compression_threshold,
        })
    }

    /// Serializes the batch, gzipping it once it grows past the threshold.
    /// Returns the body and whether it was compressed.
    fn encode(&self, events: &[ServerEvent]) -> Result<(Vec<u8>, bool), RelayError> {
        let body = serde_json::to_vec(&ServerBatch { data: events }).map_err(|err| {
            error!("failed to serialize event batch: {}", err);
            RelayError::NonRetryableSinkError
        })?;

        if body.len() <= self.compression_threshold {
            return Ok((body, false));
        }

        let compressed = gzip(&body).map_err(|err| {
            error!("failed to compress event batch: {}", err);
            RelayError::Internal
        })?;
        Ok((compressed, true))
    }
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

fn map_transport_error(err: reqwest::Error) -> RelayError {
    // The access token travels in the query string, keep it out of the logs
    let err = err.without_url();
    if err.is_timeout() {
        warn!("conversions API timed out: {}", err);
        RelayError::UpstreamTimeout
    } else {
        error!("conversions API request failed: {}", err);
        RelayError::UpstreamUnavailable
    }
}

#[async_trait]
impl Event for GraphSink {
    #[instrument(skip_all, fields(batch_size = events.len()))]
    async fn send_batch(&self, events: Vec<ServerEvent>) -> Result<SinkResponse, RelayError> {
        let (body, compressed) = self.encode(&events)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .query(&[("access_token", self.access_token.as_str())]);
        if compressed {
            request = request.header(header::CONTENT_ENCODING, "gzip");
            counter!("relay_upstream_compressed_total").increment(1);
        }

        let start = Instant::now();
        let response = request.body(body).send().await.map_err(map_transport_error)?;
        let status = response.status();
        let payload = response.bytes().await.map_err(map_transport_error)?;
        histogram!("relay_upstream_duration_seconds").record(start.elapsed().as_secs_f64());

        let details: Option<Value> = serde_json::from_slice(&payload).ok();

        if !status.is_success() {
            warn!(status = status.as_u16(), "conversions API rejected the batch");
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                details: details
                    .unwrap_or_else(|| Value::String(String::from_utf8_lossy(&payload).into())),
            });
        }

        details.ok_or_else(|| {
            error!("conversions API returned an unreadable body");
            RelayError::UpstreamUnavailable
        })
    }
}
