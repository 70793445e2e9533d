#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use infergate::auth::{DEFAULT_JWKS_TTL, JwksCache};
use infergate::config::{PrefixCacheConfig, SchedulerConfig};
use infergate::crd::{Destination, ModelRouteSpec, ModelServerSpec, RouteRule};
use infergate::datastore::{Datastore, PodSeed};
use infergate::ratelimit::RateLimiter;
use infergate::scheduler::{PrefixCacheStore, Scheduler};
use infergate::server::{AppState, build_router};

/// A route sending one model straight to one server.
pub fn route_to(model: &str, server: &str) -> ModelRouteSpec {
    ModelRouteSpec {
        model_name: model.to_string(),
        lora_adapters: None,
        rules: vec![RouteRule {
            matches: None,
            destinations: vec![Destination {
                model_server: server.to_string(),
                weight: None,
            }],
        }],
    }
}

/// A plain vLLM pool selecting `app=<name>` pods on `port`.
pub fn pool(name: &str, port: u16) -> ModelServerSpec {
    ModelServerSpec {
        selector: BTreeMap::from([("app".to_string(), name.to_string())]),
        port,
        ..Default::default()
    }
}

pub fn pod(name: &str, ip: &str, labels: &[(&str, &str)]) -> PodSeed {
    PodSeed {
        namespace: "default".to_string(),
        name: name.to_string(),
        ip: ip.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        models: vec![],
    }
}

/// App state over a prepared datastore with default scheduler config and a
/// process-local rate limiter.
pub fn gateway_state(store: Arc<Datastore>) -> Arc<AppState> {
    let prefix = Arc::new(PrefixCacheStore::new(PrefixCacheConfig::default()));
    let scheduler = Arc::new(Scheduler::from_config(&SchedulerConfig::default(), prefix).unwrap());
    let limiter = Arc::new(RateLimiter::local());
    let jwks = Arc::new(JwksCache::new(DEFAULT_JWKS_TTL));
    AppState::new(store, scheduler, limiter, jwks)
}

pub fn gateway_router(store: Arc<Datastore>) -> Router {
    build_router(gateway_state(store))
}

/// POST a JSON body and return status plus collected body bytes.
pub async fn post_json(app: Router, path: &str, body: Value) -> (StatusCode, Vec<u8>) {
    post_json_with_headers(app, path, body, &[]).await
}

pub async fn post_json_with_headers(
    app: Router,
    path: &str,
    body: Value,
    headers: &[(&str, &str)],
) -> (StatusCode, Vec<u8>) {
    let mut request = Request::post(path).header("content-type", "application/json");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let request = request
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

pub fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}
