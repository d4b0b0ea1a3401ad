use assert_json_diff::assert_json_eq;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

mod common;
use common::*;

fn three_events() -> serde_json::Value {
    json!({
        "data": [
            {
                "event_name": "Lead",
                "event_id": "lead-1",
                "event_time": 1709294000,
                "user_data": { "fbc": "abc123", "fbp": "fb.1.1709294000.42", "country": "BR" },
                "custom_data": { "value": 900, "currency": "BRL" }
            },
            { "event_id": "lead-2", "event_name": "Contact" },
            { "event_id": "lead-3", "user_data": { "client_ip_address": "1.1.1.1" } }
        ]
    })
}

#[tokio::test]
async fn batch_without_event_id_is_rejected() {
    let sink = MemorySink::default();
    let app = setup_router(ManualClock::new(), sink.clone());

    let body = json!({ "data": [{ "event_id": "lead-1" }, { "event_name": "Lead" }] });
    let (status, response) = send(&app, post_request(&body, "203.0.113.5")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        response,
        json!({ "error": "event_id is required on every event for browser and server deduplication" })
    );
    assert!(sink.batches().is_empty());
}

#[tokio::test]
async fn malformed_bodies_are_rejected() {
    let app = setup_router(ManualClock::new(), MemorySink::default());

    for body in [json!({}), json!({ "data": [] }), json!({ "data": "lead" })] {
        let (status, _) = send(&app, post_request(&body, "203.0.113.5")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    }

    let request = Request::builder()
        .method("POST")
        .uri("/api/events")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forwards_and_then_deduplicates_a_batch() {
    let sink = MemorySink::default();
    let app = setup_router(ManualClock::new(), sink.clone());

    let (status, response) = send(&app, post_request(&three_events(), "2001:db8::1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        response,
        json!({
            "events_received": 3,
            "fbtrace_id": "trace",
            "deduplication": { "original": 3, "processed": 3, "blocked": 0 },
            "ip_info": { "ip": "2001:db8::1", "type": "IPv6" }
        })
    );

    let (status, response) = send(&app, post_request(&three_events(), "2001:db8::1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        response,
        json!({ "message": "all events were duplicates", "blocked": 3, "cache": 3 })
    );

    // The second request never reached the sink
    assert_eq!(sink.batches().len(), 1);
}

#[tokio::test]
async fn forwarded_events_are_enriched() {
    let sink = MemorySink::default();
    let app = setup_router(ManualClock::new(), sink.clone());

    let (status, _) = send(&app, post_request(&three_events(), "198.51.100.20")).await;
    assert_eq!(status, StatusCode::OK);

    let batches = sink.batches();
    let events = serde_json::to_value(&batches[0]).unwrap();
    let now = START.unix_timestamp();
    assert_json_eq!(
        events,
        json!([
            {
                "event_name": "Lead",
                "event_id": "lead-1",
                "event_time": 1709294000,
                "event_source_url": ALLOWED_ORIGIN,
                "action_source": "website",
                "custom_data": { "value": 900, "currency": "BRL" },
                "user_data": {
                    "client_ip_address": "198.51.100.20",
                    "client_user_agent": "Mozilla/5.0 (X11; Linux x86_64)",
                    "fbp": "fb.1.1709294000.42",
                    "fbc": format!("fb.1.{now}.abc123"),
                    "country": "br"
                }
            },
            {
                "event_name": "Contact",
                "event_id": "lead-2",
                "event_time": now,
                "event_source_url": ALLOWED_ORIGIN,
                "action_source": "website",
                "custom_data": {},
                "user_data": {
                    "client_ip_address": "198.51.100.20",
                    "client_user_agent": "Mozilla/5.0 (X11; Linux x86_64)"
                }
            },
            {
                "event_name": "Lead",
                "event_id": "lead-3",
                "event_time": now,
                "event_source_url": ALLOWED_ORIGIN,
                "action_source": "website",
                "custom_data": {},
                "user_data": {
                    "client_ip_address": "198.51.100.20",
                    "client_user_agent": "Mozilla/5.0 (X11; Linux x86_64)"
                }
            }
        ])
    );
}

#[tokio::test]
async fn partially_duplicated_batch_forwards_the_rest() {
    let sink = MemorySink::default();
    let app = setup_router(ManualClock::new(), sink.clone());

    let first = json!({ "data": [{ "event_id": "a" }] });
    let (status, _) = send(&app, post_request(&first, "203.0.113.5")).await;
    assert_eq!(status, StatusCode::OK);

    let second = json!({ "data": [{ "event_id": "a" }, { "event_id": "b" }, { "event_id": "b" }] });
    let (status, response) = send(&app, post_request(&second, "203.0.113.5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        response["deduplication"],
        json!({ "original": 3, "processed": 1, "blocked": 2 })
    );
    assert_eq!(sink.batches()[1].len(), 1);
    assert_eq!(sink.batches()[1][0].event_id, "b");
}

#[tokio::test]
async fn event_ids_expire_after_five_minutes() {
    let clock = ManualClock::new();
    let sink = MemorySink::default();
    let app = setup_router(clock.clone(), sink.clone());
    let body = json!({ "data": [{ "event_id": "lead-1" }] });

    let (_, response) = send(&app, post_request(&body, "203.0.113.5")).await;
    assert_eq!(response["deduplication"]["processed"], 1);

    clock.advance(time::Duration::seconds(300));
    let (_, response) = send(&app, post_request(&body, "203.0.113.5")).await;
    assert_eq!(response["message"], "all events were duplicates");

    clock.advance(time::Duration::seconds(1));
    let (_, response) = send(&app, post_request(&body, "203.0.113.5")).await;
    assert_eq!(response["deduplication"]["processed"], 1);
    assert_eq!(sink.batches().len(), 2);
}

#[tokio::test]
async fn thirty_first_request_in_a_minute_is_rate_limited() {
    let clock = ManualClock::new();
    let app = setup_router(clock.clone(), MemorySink::default());

    for i in 0..30 {
        let body = json!({ "data": [{ "event_id": format!("lead-{i}") }] });
        let (status, _) = send(&app, post_request(&body, "203.0.113.5")).await;
        assert_eq!(status, StatusCode::OK, "request {i}");
    }

    let body = json!({ "data": [{ "event_id": "lead-30" }] });
    let (status, response) = send(&app, post_request(&body, "203.0.113.5")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_json_eq!(response, json!({ "error": "rate limited" }));

    // Other clients are not affected
    let (status, _) = send(&app, post_request(&body, "203.0.113.6")).await;
    assert_eq!(status, StatusCode::OK);

    clock.advance(time::Duration::seconds(60));
    let body = json!({ "data": [{ "event_id": "lead-31" }] });
    let (status, _) = send(&app, post_request(&body, "203.0.113.5")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn upstream_errors_are_passed_through() {
    let app = setup_router(ManualClock::new(), RejectingSink);

    let (status, response) = send(&app, post_request(&three_events(), "203.0.113.5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_eq!(
        response,
        json!({
            "error": "conversions API error",
            "details": { "error": { "message": "Invalid OAuth access token", "code": 190 } }
        })
    );
}

#[tokio::test]
async fn other_methods_are_not_allowed() {
    let app = setup_router(ManualClock::new(), MemorySink::default());

    for method in ["GET", "PUT", "DELETE"] {
        let request = Request::builder()
            .method(method)
            .uri("/api/events")
            .body(Body::empty())
            .unwrap();
        let (status, response) = send(&app, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_json_eq!(response, json!({ "error": "method not allowed" }));
    }
}

#[tokio::test]
async fn preflight_is_answered_for_allowed_origins() {
    let app = setup_router(ManualClock::new(), MemorySink::default());

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/events")
        .header("origin", ALLOWED_ORIGIN)
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        ALLOWED_ORIGIN
    );
    assert_eq!(
        response.headers()["access-control-allow-credentials"],
        "true"
    );
}

#[tokio::test]
async fn unknown_origins_get_no_cors_headers() {
    let app = setup_router(ManualClock::new(), MemorySink::default());

    let request = Request::builder()
        .method("POST")
        .uri("/api/events/")
        .header("content-type", "application/json")
        .header("origin", "https://evil.example")
        .body(Body::from(json!({ "data": [{ "event_id": "x" }] }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}

#[tokio::test]
async fn health_routes() {
    let app = setup_router(ManualClock::new(), MemorySink::default());

    for uri in ["/", "/_readiness", "/_liveness"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
    }
}
