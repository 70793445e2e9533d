//! Response relay.
//!
//! Streaming upstream responses (`text/event-stream`, `application/x-ndjson`)
//! are copied line-by-line in receipt order; every line is inspected for an
//! OpenAI-style `usage` object so completion tokens can be accounted against
//! the output bucket. A usage frame the gateway injected itself is parsed
//! but not forwarded. Buffered responses are relayed unchanged and parsed
//! once.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::ratelimit::RateLimiter;

/* ============================= ENTRY ============================= */

pub async fn relay_response(
    upstream: reqwest::Response,
    suppress_usage_frame: bool,
    limiter: Arc<RateLimiter>,
    model: &str,
) -> Result<Response, GatewayError> {
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let streaming = content_type.starts_with("text/event-stream")
        || content_type.starts_with("application/x-ndjson");

    if streaming {
        relay_streaming(upstream, suppress_usage_frame, limiter, model.to_string()).await
    } else {
        relay_buffered(upstream, limiter, model).await
    }
}

/* ============================= BUFFERED ============================= */

async fn relay_buffered(
    upstream: reqwest::Response,
    limiter: Arc<RateLimiter>,
    model: &str,
) -> Result<Response, GatewayError> {
    let mut builder = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        if name == CONNECTION || name == TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::Upstream(format!("reading upstream body: {e}")))?;

    if let Ok(value) = serde_json::from_slice::<Value>(&bytes)
        && let Some(tokens) = extract_completion_tokens(&value)
    {
        limiter.record_output_tokens(model, tokens).await;
    }

    builder
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::Upstream(format!("building response: {e}")))
}

/* ============================= STREAMING ============================= */

async fn relay_streaming(
    upstream: reqwest::Response,
    suppress_usage_frame: bool,
    limiter: Arc<RateLimiter>,
    model: String,
) -> Result<Response, GatewayError> {
    let mut builder = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        // Suppression may change the body length, and the relay re-chunks.
        if name == CONNECTION || name == TRANSFER_ENCODING || name == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, std::io::Error>>();

    tokio::spawn(async move {
        let mut relay = LineRelay::new(suppress_usage_frame);
        let mut stream = upstream.bytes_stream();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    let (forward, tokens) = relay.feed(&bytes);
                    for count in tokens {
                        limiter.record_output_tokens(&model, count).await;
                    }
                    if !forward.is_empty()
                        && tx.unbounded_send(Ok(Bytes::from(forward))).is_err()
                    {
                        debug!(model = %model, "client_disconnected_mid_stream");
                        return;
                    }
                }
                Err(e) => {
                    // Headers are flushed; the only way to signal failure is
                    // a final error frame before closing the stream.
                    warn!(model = %model, error = %e, "upstream_stream_failed");
                    let frame = format!(
                        "data: {}\n\n",
                        serde_json::json!({
                            "error": {"message": e.to_string(), "type": "upstream_error"}
                        })
                    );
                    let _ = tx.unbounded_send(Ok(Bytes::from(frame)));
                    return;
                }
            }
        }

        let tail = relay.finish();
        if !tail.is_empty() {
            let _ = tx.unbounded_send(Ok(Bytes::from(tail)));
        }
    });

    builder
        .body(Body::from_stream(rx))
        .map_err(|e| GatewayError::Upstream(format!("building response: {e}")))
}

/* ============================= LINE RELAY ============================= */

/// Splits a byte stream into lines, deciding per line whether to forward it
/// and extracting completion-token counts from usage payloads.
struct LineRelay {
    suppress_synthetic: bool,
    buffer: Vec<u8>,
    skip_next_blank: bool,
}

impl LineRelay {
    fn new(suppress_synthetic: bool) -> Self {
        Self {
            suppress_synthetic,
            buffer: Vec::new(),
            skip_next_blank: false,
        }
    }

    /// Feed one chunk; returns the bytes to forward and any token counts
    /// found in complete lines.
    fn feed(&mut self, chunk: &[u8]) -> (Vec<u8>, Vec<u64>) {
        self.buffer.extend_from_slice(chunk);

        let mut forward = Vec::new();
        let mut tokens = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = std::str::from_utf8(&line)
                .unwrap_or_default()
                .trim_end_matches(['\n', '\r']);

            // Applies only to the line directly after a suppressed frame.
            let swallow_blank = std::mem::take(&mut self.skip_next_blank);

            if text.is_empty() {
                if !swallow_blank {
                    forward.extend_from_slice(&line);
                }
                continue;
            }

            let (keep, count) = self.inspect(text);
            if let Some(count) = count {
                tokens.push(count);
            }
            if keep {
                forward.extend_from_slice(&line);
            } else {
                // A suppressed data line swallows its frame-ending blank.
                self.skip_next_blank = true;
            }
        }

        (forward, tokens)
    }

    /// Flush whatever trails the final newline.
    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn inspect(&self, text: &str) -> (bool, Option<u64>) {
        let payload = text
            .strip_prefix("data:")
            .map(str::trim_start)
            .unwrap_or(text);
        if payload.is_empty() || payload == "[DONE]" {
            return (true, None);
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return (true, None);
        };

        let tokens = extract_completion_tokens(&value);
        let suppress =
            tokens.is_some() && self.suppress_synthetic && is_usage_only_frame(&value);
        (!suppress, tokens)
    }
}

fn extract_completion_tokens(value: &Value) -> Option<u64> {
    value.get("usage")?.get("completion_tokens")?.as_u64()
}

/// The synthetic usage frame carries no content: `choices` is empty (or
/// absent) and only `usage` matters.
fn is_usage_only_frame(value: &Value) -> bool {
    match value.get("choices") {
        Some(Value::Array(choices)) => choices.is_empty(),
        Some(Value::Null) | None => true,
        Some(_) => false,
    }
}

/* ============================= TESTS ============================= */
