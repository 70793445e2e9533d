//! OpenAI-compatible HTTP front-end.
//!
//! Request flow: parse body, resolve the model's route to a ModelServer,
//! validate JWT when the server demands it, pass rate-limit admission,
//! take an admission-queue slot when configured, schedule a pod (or a
//! prefill/decode pair), proxy, and relay the response with output-token
//! accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parking_lot::Mutex;
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use rand::Rng;
use serde_json::{Value, json};
use tracing::info;

use crate::auth::JwksCache;
use crate::crd::AdmissionSpec;
use crate::datastore::Datastore;
use crate::errors::GatewayError;
use crate::proxy::{self, JsonBody, ProxyTarget, ResolvedPolicy, connector_for};
use crate::queue::{AdmissionPermit, AdmissionQueue};
use crate::ratelimit::{RateLimiter, estimate_tokens};
use crate::scheduler::{Scheduler, SchedulingContext, SchedulingDecision};

pub const PRIORITY_HEADER: &str = "x-request-priority";
const REQUEST_ID_HEADER: &str = "x-request-id";

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("infergate_requests_total", "Requests by model and outcome"),
        &["model", "outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static REQUEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "infergate_request_duration_seconds",
        "Wall-clock duration of proxied requests",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

static RATELIMIT_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "infergate_ratelimit_rejections_total",
            "Rate-limit rejections by model and bucket",
        ),
        &["model", "bucket"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub fn force_metrics() {
    LazyLock::force(&REQUESTS_TOTAL);
    LazyLock::force(&REQUEST_DURATION);
    LazyLock::force(&RATELIMIT_REJECTIONS);
}

/* ============================= STATE ============================= */

pub struct AppState {
    pub store: Arc<Datastore>,
    pub scheduler: Arc<Scheduler>,
    pub limiter: Arc<RateLimiter>,
    pub jwks: Arc<JwksCache>,
    pub http: reqwest::Client,
    queues: Mutex<HashMap<String, (AdmissionSpec, Arc<AdmissionQueue>)>>,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(
        store: Arc<Datastore>,
        scheduler: Arc<Scheduler>,
        limiter: Arc<RateLimiter>,
        jwks: Arc<JwksCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            limiter,
            jwks,
            http: reqwest::Client::new(),
            queues: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        })
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    /// The admission queue for a server, rebuilt when its spec changes.
    fn queue_for(&self, server_key: &str, spec: &AdmissionSpec, model: &str) -> Arc<AdmissionQueue> {
        let mut queues = self.queues.lock();
        match queues.get(server_key) {
            Some((existing, queue)) if existing == spec => queue.clone(),
            _ => {
                let queue =
                    AdmissionQueue::new(model, spec.max_concurrent_requests, spec.queue_depth);
                queues.insert(server_key.to_string(), (spec.clone(), queue.clone()));
                queue
            }
        }
    }
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get(|State(state): State<Arc<AppState>>| async move {
                if state.ready.load(Ordering::Relaxed) {
                    (StatusCode::OK, "READY")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
                }
            }),
        )
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    handle_inference(state, headers, "/v1/chat/completions", body).await
}

async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    handle_inference(state, headers, "/v1/completions", body).await
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let data: Vec<Value> = state
        .store
        .list_models()
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "infergate"}))
        .collect();
    axum::Json(json!({"object": "list", "data": data})).into_response()
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body).into_response(),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error",
            )
                .into_response(),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error",
        )
            .into_response(),
    }
}

/* ============================= REQUEST FLOW ============================= */

/// Flags requests whose handler future was dropped before completing.
///
/// Hyper drops the future exactly when the client goes away, which also
/// cancels the in-flight upstream leg(s); the guard is the only code that
/// still runs at that point, so it owns the disconnect bookkeeping.
struct DisconnectGuard {
    model: String,
    started: Instant,
    armed: bool,
}

impl DisconnectGuard {
    fn new(model: &str, started: Instant) -> Self {
        Self {
            model: model.to_string(),
            started,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let error = GatewayError::ClientCancelled;
        // A disconnect is accounted under its own outcome, never as a
        // gateway or upstream failure.
        REQUESTS_TOTAL
            .with_label_values(&[&self.model, "cancelled"])
            .inc();
        info!(
            model = %self.model,
            status = error.status_code().as_u16(),
            duration_ms = self.started.elapsed().as_millis() as u64,
            error = %error,
            "request_cancelled_by_client"
        );
    }
}

async fn handle_inference(
    state: Arc<AppState>,
    headers: HeaderMap,
    path: &'static str,
    body: Value,
) -> Response {
    let started = Instant::now();
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let mut guard = DisconnectGuard::new(&model, started);
    let result = proxy_request(&state, &headers, path, &body).await;
    guard.disarm();
    let elapsed = started.elapsed();
    REQUEST_DURATION.observe(elapsed.as_secs_f64());

    match result {
        Ok((mut response, served_by)) => {
            REQUESTS_TOTAL.with_label_values(&[&model, "ok"]).inc();
            info!(
                model = %model,
                served_by = %served_by,
                status = response.status().as_u16(),
                duration_ms = elapsed.as_millis() as u64,
                "request_completed"
            );
            attach_request_id(&headers, &mut response);
            response
        }
        Err(error) => {
            count_failure(&model, &error);
            info!(
                model = %model,
                status = error.status_code().as_u16(),
                error = %error,
                duration_ms = elapsed.as_millis() as u64,
                "request_failed"
            );
            let mut response = error.into_response();
            attach_request_id(&headers, &mut response);
            response
        }
    }
}

fn count_failure(model: &str, error: &GatewayError) {
    let outcome = match error {
        GatewayError::InputRateLimit { .. } => {
            RATELIMIT_REJECTIONS
                .with_label_values(&[model, "input"])
                .inc();
            "rate_limited"
        }
        GatewayError::OutputRateLimit { .. } => {
            RATELIMIT_REJECTIONS
                .with_label_values(&[model, "output"])
                .inc();
            "rate_limited"
        }
        GatewayError::QueueFull(_) => "queue_full",
        GatewayError::Auth(_) => "unauthorized",
        GatewayError::Route(_) | GatewayError::BadRequest(_) => "rejected",
        GatewayError::Scheduling(_) => "unschedulable",
        GatewayError::ClientCancelled => "cancelled",
        _ => "upstream_error",
    };
    REQUESTS_TOTAL.with_label_values(&[model, outcome]).inc();
}

/// The proxied request proper; returns the response and a label describing
/// which pod(s) served it.
async fn proxy_request(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    path: &'static str,
    body: &Value,
) -> Result<(Response, String), GatewayError> {
    let body: &JsonBody = body
        .as_object()
        .ok_or_else(|| GatewayError::BadRequest("request body must be a JSON object".into()))?;
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::BadRequest("missing model".into()))?;

    // Route resolution, then the per-server policies in order: auth first,
    // rate limiting second, admission control last.
    let (server_key, is_lora) = state.store.match_model_server(model, headers, path)?;
    let server = state
        .store
        .get_model_server(&server_key)
        .ok_or_else(|| GatewayError::Route(model.to_string()))?;

    if let Some(jwt) = &server.spec.jwt {
        state.jwks.validate(jwt, headers).await?;
    }

    let prompt = extract_prompt(body);
    if let Some(rate_limit) = &server.spec.rate_limit {
        let estimated = estimate_tokens(&prompt);
        state.limiter.admit(model, rate_limit, estimated).await?;
    }

    let permit: Option<AdmissionPermit> = match &server.spec.admission {
        Some(admission) => {
            let queue = state.queue_for(&server_key, admission, model);
            Some(queue.acquire(request_priority(headers)).await?)
        }
        None => None,
    };

    // Scheduling: a PD server yields a prefill/decode pair, anything else a
    // single pod.
    let mut ctx = SchedulingContext::new(model, &prompt, is_lora);
    let decision = if server.spec.pd_group.is_some() {
        let groups = state.store.pd_pods_by_group(&server_key);
        state.scheduler.select_pd(&mut ctx, &groups)?
    } else {
        let pods = state.store.pods_by_model_server(&server_key);
        SchedulingDecision::Single(state.scheduler.select(&ctx, pods)?)
    };

    let (target, served_by) = match &decision {
        SchedulingDecision::Single(pod) => (ProxyTarget::single(pod.address()), pod.key.clone()),
        SchedulingDecision::PrefillDecode {
            prefill, decode, ..
        } => (
            ProxyTarget::pd(prefill.address(), decode.address()),
            format!("{}+{}", prefill.key, decode.key),
        ),
    };

    let connector = connector_for(server.spec.kv_connector, server.spec.pd_group.is_some());
    let policy = ResolvedPolicy::from_spec(server.spec.traffic_policy.as_ref());

    let mut response = proxy::execute(
        &state.http,
        connector,
        &target,
        path,
        body,
        policy,
        state.limiter.clone(),
        model,
    )
    .await?;

    // The concurrency slot stays occupied until the response (body included)
    // has been written out, not just until the headers are ready.
    if let Some(permit) = permit {
        response.extensions_mut().insert(Arc::new(permit));
    }

    Ok((response, served_by))
}

/* ============================= HELPERS ============================= */

/// Flatten the request into prompt text for token estimation and prefix
/// hashing. Chat bodies concatenate message contents; completion bodies use
/// `prompt` directly (string or array of strings).
pub fn extract_prompt(body: &JsonBody) -> String {
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        let mut parts = Vec::new();
        for message in messages {
            match message.get("content") {
                Some(Value::String(text)) => parts.push(text.clone()),
                Some(Value::Array(chunks)) => {
                    for chunk in chunks {
                        if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        return parts.join("\n");
    }

    match body.get("prompt") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn request_priority(headers: &HeaderMap) -> i32 {
    headers
        .get(PRIORITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Propagate the caller's request id, or mint one.
fn attach_request_id(request_headers: &HeaderMap, response: &mut Response) {
    let id = request_headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:032x}", rand::rng().random::<u128>()));
    if let Ok(value) = id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

/* ============================= TESTS ============================= */
