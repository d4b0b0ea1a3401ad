use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use tracing::{error, instrument, Span};

use crate::api::{RelayError, RelayOutcome};
use crate::client_ip;
use crate::event::RequestContext;
use crate::router;

#[instrument(
    skip_all,
    fields(batch_size, user_agent, client_ip, ip_type)
)]
pub async fn event(
    state: State<router::State>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<RelayOutcome, RelayError> {
    let context = request_context(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    Span::current().record("user_agent", context.user_agent.as_str());
    Span::current().record("client_ip", context.client.address.as_str());
    Span::current().record("ip_type", context.client.family.as_str());

    match state.pipeline.handle(&body, &context).await {
        Ok(outcome) => {
            let batch_size = match &outcome {
                RelayOutcome::AllDuplicates { blocked, .. } => *blocked,
                RelayOutcome::Forwarded { deduplication, .. } => deduplication.original,
            };
            Span::current().record("batch_size", batch_size);
            Ok(outcome)
        }
        Err(err) => {
            if err.status().is_server_error() {
                error!("event: failed to relay batch: {:?}", err);
            }
            Err(err)
        }
    }
}

pub async fn method_not_allowed() -> RelayError {
    RelayError::MethodNotAllowed
}

pub fn request_context(headers: &HeaderMap, remote: Option<SocketAddr>) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    RequestContext {
        client: client_ip::resolve(headers, remote),
        user_agent: header("user-agent"),
        origin: header("origin"),
    }
}
