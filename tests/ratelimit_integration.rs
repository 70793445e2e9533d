mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use common::{gateway_router, parse_json, pod, pool, post_json};
use infergate::crd::{RateLimitScope, RateLimitSpec, RateLimitUnit};
use infergate::datastore::Datastore;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ══════════════════════════════════════════════════════════════════
// Rate-limit integration tests (no cluster required)
//
// Drives the full request path with a mock backend: admission-time
// input budgets, post-hoc output accounting and the 429 surface.
// ══════════════════════════════════════════════════════════════════

async fn upstream_with_usage(completion_tokens: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}],
            "usage": {
                "prompt_tokens": 4,
                "completion_tokens": completion_tokens,
                "total_tokens": 4 + completion_tokens,
            },
        })))
        .mount(&server)
        .await;
    server
}

fn limited_store(port: u16, spec: RateLimitSpec) -> Arc<Datastore> {
    let store = Arc::new(Datastore::new());
    let mut server = pool("a", port);
    server.rate_limit = Some(spec);
    store
        .add_or_update_model_server("default", "pool-a", server)
        .unwrap();
    store
        .add_or_update_model_route("default", "m1", common::route_to("m1", "pool-a"))
        .unwrap();
    store.add_or_update_pod(pod("a-0", "127.0.0.1", &[("app", "a")]));
    store
}

#[tokio::test]
async fn test_input_budget_allows_two_then_rejects() {
    let upstream = upstream_with_usage(2).await;
    let store = limited_store(
        upstream.address().port(),
        RateLimitSpec {
            unit: RateLimitUnit::Second,
            input_tokens: Some(10),
            output_tokens: None,
            scope: RateLimitScope::Local,
        },
    );
    let app = gateway_router(store);

    // 14 characters estimate to ceil(14/4) = 4 tokens per request.
    let body = json!({
        "model": "m1",
        "messages": [{"role": "user", "content": "fourteen chars"}],
    });

    let (first, _) = post_json(app.clone(), "/v1/chat/completions", body.clone()).await;
    let (second, _) = post_json(app.clone(), "/v1/chat/completions", body.clone()).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);

    let request = axum::http::Request::post("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = tower::ServiceExt::oneshot(app, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));

    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let error = parse_json(&bytes);
    assert_eq!(error["error"]["type"], "rate_limit_exceeded");
}

#[tokio::test]
async fn test_output_accounting_feeds_lookahead() {
    // Budget of 100 output tokens per hour; the backend reports 150 per
    // completion, so one request drives the bucket into debt.
    let upstream = upstream_with_usage(150).await;
    let store = limited_store(
        upstream.address().port(),
        RateLimitSpec {
            unit: RateLimitUnit::Hour,
            input_tokens: None,
            output_tokens: Some(100),
            scope: RateLimitScope::Local,
        },
    );
    let app = gateway_router(store);
    let body = json!({
        "model": "m1",
        "messages": [{"role": "user", "content": "hello"}],
    });

    let (first, bytes) = post_json(app.clone(), "/v1/chat/completions", body.clone()).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(parse_json(&bytes)["usage"]["completion_tokens"], 150);

    // Buffered responses account before returning, so the debt is visible
    // immediately.
    let (second, bytes) = post_json(app, "/v1/chat/completions", body).await;
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(parse_json(&bytes)["error"]["type"], "rate_limit_exceeded");
}

#[tokio::test]
async fn test_unlimited_server_never_rejects() {
    let upstream = upstream_with_usage(5).await;
    let store = Arc::new(Datastore::new());
    store
        .add_or_update_model_server("default", "pool-a", pool("a", upstream.address().port()))
        .unwrap();
    store
        .add_or_update_model_route("default", "m1", common::route_to("m1", "pool-a"))
        .unwrap();
    store.add_or_update_pod(pod("a-0", "127.0.0.1", &[("app", "a")]));
    let app = gateway_router(store);

    let body = json!({
        "model": "m1",
        "messages": [{"role": "user", "content": "no limits configured here"}],
    });
    for _ in 0..5 {
        let (status, _) = post_json(app.clone(), "/v1/chat/completions", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }
}
