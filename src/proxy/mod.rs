//! Connector-driven proxying.
//!
//! After scheduling, a request becomes either a single upstream call or a
//! prefill -> decode sequence. Body rewriting always happens on deep copies;
//! the caller's parsed body is never mutated.

pub mod connectors;
pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::crd::{KvConnector, TrafficPolicy};
use crate::errors::GatewayError;
use crate::ratelimit::RateLimiter;

pub use connectors::{Connector, ProxyTarget};

pub type JsonBody = Map<String, Value>;

/* ============================= BODY REWRITING ============================= */

/// Build the prefill leg's body: the call only exists to produce the
/// KV-cache, so one output token is enough and streaming is pointless.
pub fn prepare_prefill_body(body: &JsonBody) -> JsonBody {
    let mut prefill = body.clone();
    prefill.remove("stream");
    prefill.remove("stream_options");
    prefill.insert("max_tokens".to_string(), json!(1));
    if prefill.contains_key("max_completion_tokens") {
        prefill.insert("max_completion_tokens".to_string(), json!(1));
    }
    prefill
}

/// The decode leg's body plus what the response relay needs to know.
#[derive(Debug)]
pub struct DecodeBody {
    pub body: JsonBody,
    pub stream: bool,
    /// The usage frame was injected by the gateway, not requested by the
    /// client, so it must not reach the client.
    pub suppress_usage_frame: bool,
}

/// Build the decode (or single-call) body: client values are preserved and
/// token usage reporting is forced on so output tokens can be accounted.
pub fn prepare_decode_body(body: &JsonBody) -> DecodeBody {
    let mut decode = body.clone();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let mut suppress_usage_frame = false;

    if stream {
        let requested = body
            .get("stream_options")
            .and_then(|o| o.get("include_usage"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !requested {
            match decode.get_mut("stream_options") {
                Some(Value::Object(options)) => {
                    options.insert("include_usage".to_string(), json!(true));
                }
                _ => {
                    decode.insert("stream_options".to_string(), json!({"include_usage": true}));
                }
            }
            suppress_usage_frame = true;
        }
    } else {
        decode.insert("include_usage".to_string(), json!(true));
    }

    DecodeBody {
        body: decode,
        stream,
        suppress_usage_frame,
    }
}

/// Ask the prefill engine to hand its KV-cache to a remote decoder.
pub fn add_prefill_kv_transfer(prefill: &mut JsonBody) {
    prefill.insert(
        "kv_transfer_params".to_string(),
        json!({"do_remote_decode": true, "do_remote_prefill": false}),
    );
}

/// Thread the prefill response's opaque `kv_transfer_params` into the
/// decode body, unchanged. A missing handle is a warning, not an error:
/// some engines transfer out of band.
pub fn thread_kv_transfer(decode: &mut JsonBody, prefill_response: &Value) {
    match prefill_response.get("kv_transfer_params") {
        Some(params) if !params.is_null() => {
            decode.insert("kv_transfer_params".to_string(), params.clone());
        }
        _ => warn!("prefill response carried no kv_transfer_params"),
    }
}

/* ============================= TRAFFIC POLICY ============================= */

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Traffic policy with defaults applied. `attempts` counts retries beyond
/// the first try.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub retry_interval: Duration,
}

impl ResolvedPolicy {
    pub fn from_spec(policy: Option<&TrafficPolicy>) -> Self {
        let timeout = policy
            .and_then(|p| p.timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let (attempts, retry_interval) = policy
            .and_then(|p| p.retries.as_ref())
            .map(|r| (r.attempts, Duration::from_secs(r.retry_interval_seconds)))
            .unwrap_or((0, Duration::ZERO));
        Self {
            timeout,
            attempts,
            retry_interval,
        }
    }
}

/* ============================= EXECUTION ============================= */

/// Run one proxied request to completion of the upstream headers, retrying
/// whole attempts within the policy's overall timeout budget, then hand the
/// final-leg response to the streaming relay.
#[allow(clippy::too_many_arguments)]
pub async fn execute(
    client: &reqwest::Client,
    connector: Connector,
    target: &ProxyTarget,
    path: &str,
    body: &JsonBody,
    policy: ResolvedPolicy,
    limiter: Arc<RateLimiter>,
    model: &str,
) -> Result<axum::response::Response, GatewayError> {
    let prefill_body = target.prefill.is_some().then(|| prepare_prefill_body(body));
    let decode = prepare_decode_body(body);
    let deadline = Instant::now() + policy.timeout;

    let mut attempt = 0u32;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(GatewayError::UpstreamTimeout(policy.timeout))?;

        match connector
            .proxy(
                client,
                target,
                path,
                prefill_body.as_ref(),
                &decode.body,
                remaining,
            )
            .await
        {
            Ok(upstream) => {
                return streaming::relay_response(
                    upstream,
                    decode.suppress_usage_frame,
                    limiter.clone(),
                    model,
                )
                .await;
            }
            Err(error) if attempt < policy.attempts && error_is_retryable(&error) => {
                attempt += 1;
                warn!(
                    model = %model,
                    attempt,
                    error = %error,
                    "upstream_attempt_failed_retrying"
                );
                if !policy.retry_interval.is_zero() {
                    tokio::time::sleep(policy.retry_interval.min(remaining)).await;
                }
            }
            Err(error) => {
                debug!(model = %model, error = %error, "upstream_request_failed");
                return Err(error);
            }
        }
    }
}

fn error_is_retryable(error: &GatewayError) -> bool {
    matches!(
        error,
        GatewayError::Upstream(_) | GatewayError::UpstreamStatus(_)
    )
}

/// Connector kind for a ModelServer: PD servers use their configured
/// KV connector (`http` covers lmcache and mooncake, which transfer the
/// cache themselves), everything else is a single direct call.
pub fn connector_for(kv: Option<KvConnector>, pd_enabled: bool) -> Connector {
    if !pd_enabled {
        return Connector::Direct;
    }
    match kv.unwrap_or_default() {
        KvConnector::Http | KvConnector::Lmcache | KvConnector::Mooncake => Connector::Http,
        KvConnector::Nixl => Connector::Nixl,
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn body(value: Value) -> JsonBody {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_prefill_body_forces_one_token() {
        let original = body(json!({
            "model": "m1",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": 100,
        }));
        let prefill = prepare_prefill_body(&original);

        assert_eq!(prefill.get("max_tokens"), Some(&json!(1)));
        assert!(!prefill.contains_key("stream"));
        assert!(!prefill.contains_key("stream_options"));
        // Only present keys are forced.
        assert!(!prefill.contains_key("max_completion_tokens"));
        // The caller's map is untouched.
        assert_eq!(original.get("max_tokens"), Some(&json!(100)));
        assert_eq!(original.get("stream"), Some(&json!(true)));
    }

    #[test]
    fn test_prefill_body_forces_max_completion_tokens_when_present() {
        let original = body(json!({"model": "m1", "max_completion_tokens": 50}));
        let prefill = prepare_prefill_body(&original);
        assert_eq!(prefill.get("max_completion_tokens"), Some(&json!(1)));
        assert_eq!(prefill.get("max_tokens"), Some(&json!(1)));
    }

    #[test]
    fn test_decode_body_preserves_client_limits() {
        let original = body(json!({
            "model": "m1",
            "max_tokens": 50,
            "max_completion_tokens": 80,
        }));
        let decode = prepare_decode_body(&original);
        assert_eq!(decode.body.get("max_tokens"), Some(&json!(50)));
        assert_eq!(decode.body.get("max_completion_tokens"), Some(&json!(80)));
        assert!(!decode.stream);
        assert!(!decode.suppress_usage_frame);
        assert_eq!(decode.body.get("include_usage"), Some(&json!(true)));
    }

    #[test]
    fn test_decode_body_injects_usage_for_streams() {
        let original = body(json!({"model": "m1", "stream": true}));
        let decode = prepare_decode_body(&original);
        assert_eq!(
            decode.body.get("stream_options"),
            Some(&json!({"include_usage": true}))
        );
        assert!(decode.stream);
        assert!(decode.suppress_usage_frame);
        // No top-level include_usage on streaming bodies.
        assert!(!decode.body.contains_key("include_usage"));
    }

    #[test]
    fn test_decode_body_keeps_other_stream_options() {
        let original = body(json!({
            "model": "m1",
            "stream": true,
            "stream_options": {"chunk_size": 8},
        }));
        let decode = prepare_decode_body(&original);
        let options = decode.body.get("stream_options").unwrap();
        assert_eq!(options.get("chunk_size"), Some(&json!(8)));
        assert_eq!(options.get("include_usage"), Some(&json!(true)));
        assert!(decode.suppress_usage_frame);
    }

    #[test]
    fn test_decode_body_respects_client_requested_usage() {
        let original = body(json!({
            "model": "m1",
            "stream": true,
            "stream_options": {"include_usage": true},
        }));
        let decode = prepare_decode_body(&original);
        // The client asked for the frame; it must be forwarded.
        assert!(!decode.suppress_usage_frame);
    }

    #[test]
    fn test_kv_transfer_threading() {
        let mut decode = body(json!({"model": "m1"}));
        let prefill_response = json!({
            "choices": [],
            "kv_transfer_params": {"engine_id": "X", "block_ids": [1, 2]},
        });
        thread_kv_transfer(&mut decode, &prefill_response);
        assert_eq!(
            decode.get("kv_transfer_params"),
            Some(&json!({"engine_id": "X", "block_ids": [1, 2]}))
        );
    }

    #[test]
    fn test_missing_kv_transfer_is_soft() {
        let mut decode = body(json!({"model": "m1"}));
        thread_kv_transfer(&mut decode, &json!({"choices": []}));
        assert!(!decode.contains_key("kv_transfer_params"));
    }

    #[test]
    fn test_prefill_kv_transfer_flags() {
        let mut prefill = body(json!({"model": "m1"}));
        add_prefill_kv_transfer(&mut prefill);
        assert_eq!(
            prefill.get("kv_transfer_params"),
            Some(&json!({"do_remote_decode": true, "do_remote_prefill": false}))
        );
    }

    #[test]
    fn test_policy_defaults() {
        let policy = ResolvedPolicy::from_spec(None);
        assert_eq!(policy.timeout, DEFAULT_TIMEOUT);
        assert_eq!(policy.attempts, 0);

        let policy = ResolvedPolicy::from_spec(Some(&TrafficPolicy {
            timeout_seconds: Some(30),
            retries: Some(crate::crd::RetryPolicy {
                attempts: 2,
                retry_interval_seconds: 1,
            }),
        }));
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.attempts, 2);
        assert_eq!(policy.retry_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_connector_selection() {
        assert!(matches!(connector_for(None, false), Connector::Direct));
        assert!(matches!(
            connector_for(Some(KvConnector::Nixl), false),
            Connector::Direct
        ));
        assert!(matches!(connector_for(None, true), Connector::Http));
        assert!(matches!(
            connector_for(Some(KvConnector::Lmcache), true),
            Connector::Http
        ));
        assert!(matches!(
            connector_for(Some(KvConnector::Mooncake), true),
            Connector::Http
        ));
        assert!(matches!(
            connector_for(Some(KvConnector::Nixl), true),
            Connector::Nixl
        ));
    }
}
