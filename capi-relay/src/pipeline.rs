//! Admission of an event batch, from the raw request body to the outbound call.
//!
//! Stages always run in this order: rate limit, structural validation, dedup,
//! enrichment, dispatch. A batch is validated as a whole before any of its ids
//! reaches the dedup cache, so a rejected request never burns an event id.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{DeduplicationSummary, IpInfo, RelayError, RelayOutcome};
use crate::dedup::DeduplicationCache;
use crate::event::{non_empty, RawBatch, RawEvent, RequestContext, ServerEvent, ServerUserData};
use crate::fbc;
use crate::limiters::RateLimiter;
use crate::prometheus::{report_dropped_events, report_internal_error_metrics};
use crate::sinks;
use crate::time::TimeSource;

pub const DEFAULT_EVENT_NAME: &str = "Lead";
pub const DEFAULT_ACTION_SOURCE: &str = "website";

/// Values filled in when the client leaves a field unset or empty.
#[derive(Debug, Clone)]
pub struct EventDefaults {
    pub event_name: String,
    pub action_source: String,
}

impl Default for EventDefaults {
    fn default() -> Self {
        Self {
            event_name: DEFAULT_EVENT_NAME.to_string(),
            action_source: DEFAULT_ACTION_SOURCE.to_string(),
        }
    }
}

/// Result of the dedup and enrichment stages for one batch.
#[derive(Debug)]
pub struct Admission {
    pub forwarded: Vec<ServerEvent>,
    pub blocked: usize,
    pub original_count: usize,
}

impl Admission {
    pub fn summary(&self) -> DeduplicationSummary {
        DeduplicationSummary {
            original: self.original_count,
            processed: self.forwarded.len(),
            blocked: self.blocked,
        }
    }
}

#[derive(Clone)]
pub struct AdmissionPipeline {
    pub dedup: DeduplicationCache,
    pub limiter: RateLimiter,
    pub defaults: EventDefaults,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    sink: Arc<dyn sinks::Event + Send + Sync>,
}

impl AdmissionPipeline {
    pub fn new<TZ, S>(
        timesource: TZ,
        sink: S,
        dedup: DeduplicationCache,
        limiter: RateLimiter,
        defaults: EventDefaults,
    ) -> Self
    where
        TZ: TimeSource + Send + Sync + 'static,
        S: sinks::Event + Send + Sync + 'static,
    {
        Self {
            dedup,
            limiter,
            defaults,
            timesource: Arc::new(timesource),
            sink: Arc::new(sink),
        }
    }

    /// Runs the whole pipeline for one request body.
    pub async fn handle(
        &self,
        body: &[u8],
        context: &RequestContext,
    ) -> Result<RelayOutcome, RelayError> {
        if let Err(err) = self.check_rate(context) {
            report_dropped_events("rate_limited", 1);
            return Err(err);
        }

        let events = RawBatch::from_bytes(body).map_err(|err| {
            warn!("rejected invalid event batch: {}", err);
            report_internal_error_metrics(err.to_metric_tag(), "parsing");
            err
        })?;
        counter!("relay_events_received_total").increment(events.len() as u64);

        let admission = self.admit(events, context);
        if admission.blocked > 0 {
            counter!("relay_events_deduplicated_total").increment(admission.blocked as u64);
        }

        if admission.forwarded.is_empty() {
            debug!(
                blocked = admission.blocked,
                "every event of the batch was a duplicate"
            );
            return Ok(RelayOutcome::AllDuplicates {
                blocked: admission.blocked,
                cache_size: self.dedup.len(),
            });
        }

        let deduplication = admission.summary();
        let forwarded = admission.forwarded.len() as u64;

        // Admitted ids stay in the cache even if this call fails
        let response = self
            .sink
            .send_batch(admission.forwarded)
            .await
            .map_err(|err| {
                report_dropped_events(err.to_metric_tag(), forwarded);
                report_internal_error_metrics(err.to_metric_tag(), "dispatch");
                err
            })?;
        counter!("relay_events_forwarded_total").increment(forwarded);

        Ok(RelayOutcome::Forwarded {
            response,
            deduplication,
            ip_info: IpInfo::from(&context.client),
        })
    }

    pub fn check_rate(&self, context: &RequestContext) -> Result<(), RelayError> {
        let now = self.timesource.current_time();
        if self.limiter.allow(&context.client.address, now) {
            Ok(())
        } else {
            warn!(client_ip = %context.client.address, "rate limit exceeded");
            Err(RelayError::RateLimited)
        }
    }

    /// Drops the events already seen, keeping the batch order, and enriches
    /// the survivors. Repeats inside the batch only survive once.
    pub fn admit(&self, events: Vec<RawEvent>, context: &RequestContext) -> Admission {
        let original_count = events.len();
        let now = self.timesource.current_time();
        let now_secs = now.unix_timestamp();

        let forwarded: Vec<ServerEvent> = events
            .into_iter()
            .filter(|event| !self.dedup.is_duplicate(&event.event_id, now))
            .map(|event| self.enrich(event, context, now_secs))
            .collect();

        Admission {
            blocked: original_count - forwarded.len(),
            original_count,
            forwarded,
        }
    }

    pub fn enrich(&self, event: RawEvent, context: &RequestContext, now: i64) -> ServerEvent {
        let user_data = event.user_data.unwrap_or_default();

        let fbc = user_data
            .fbc
            .as_deref()
            .and_then(|raw| fbc::normalize(raw, now));
        if user_data.fbc.as_deref().is_some_and(|raw| !raw.is_empty()) && fbc.is_none() {
            debug!(event_id = %event.event_id, "dropped unusable fbc value");
        }

        ServerEvent {
            event_name: non_empty(event.event_name.as_deref())
                .unwrap_or(&self.defaults.event_name)
                .to_string(),
            event_time: event.event_time.filter(|t| *t != 0).unwrap_or(now),
            event_source_url: non_empty(event.event_source_url.as_deref())
                .unwrap_or(&context.origin)
                .to_string(),
            action_source: non_empty(event.action_source.as_deref())
                .unwrap_or(&self.defaults.action_source)
                .to_string(),
            custom_data: event.custom_data.unwrap_or_default(),
            user_data: ServerUserData {
                external_id: user_data.external_id.filter(is_truthy),
                client_ip_address: context.client.address.clone(),
                client_user_agent: context.user_agent.clone(),
                fbp: user_data.fbp.filter(|v| !v.is_empty()),
                fbc,
                country: user_data
                    .country
                    .filter(|v| !v.is_empty())
                    .map(|v| v.to_lowercase()),
            },
            event_id: event.event_id,
        }
    }
}

/// Identifiers such as `external_id` may be strings, numbers or arrays. Null,
/// false, zero and the empty string are treated as unset.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
