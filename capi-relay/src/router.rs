use std::future::ready;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::{
    routing::{get, post, MethodRouter},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::endpoint;
use crate::pipeline::AdmissionPipeline;
use crate::prometheus::{setup_metrics_recorder, track_metrics};

#[derive(Clone)]
pub struct State {
    pub pipeline: AdmissionPipeline,
}

async fn index() -> &'static str {
    "capi-relay"
}

fn events_route() -> MethodRouter<State> {
    // OPTIONS never gets here, the CORS layer answers every pre-flight
    post(endpoint::event).fallback(endpoint::method_not_allowed)
}

/// Only browsers on the listed origins may post events. Their origin is
/// mirrored back, other origins get no CORS headers at all.
fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
        .allow_origin(AllowOrigin::list(origins))
}

pub fn router(
    pipeline: AdmissionPipeline,
    allowed_origins: &[String],
    max_body_bytes: usize,
    metrics: bool,
) -> Router {
    let state = State { pipeline };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/api/events", events_route())
        .route("/api/events/", events_route())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors(allowed_origins))
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when the relay is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
