//! Connector implementations.
//!
//! Every connector executes one attempt: issue the leg(s) and return the
//! final-leg response for the relay. A prefill failure short-circuits; the
//! decode leg is only issued after the prefill returned 2xx and its body
//! was fully read.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::errors::GatewayError;

use super::{JsonBody, add_prefill_kv_transfer, thread_kv_transfer};

/// Addresses produced by scheduling: `prefill` is set only for PD servers.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub prefill: Option<String>,
    pub decode: String,
}

impl ProxyTarget {
    pub fn single(address: String) -> Self {
        Self {
            prefill: None,
            decode: address,
        }
    }

    pub fn pd(prefill: String, decode: String) -> Self {
        Self {
            prefill: Some(prefill),
            decode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// No PD: one upstream call.
    Direct,
    /// PD over plain HTTP; the engines move the KV-cache themselves
    /// (also used for lmcache and mooncake setups).
    Http,
    /// PD with explicit KV-transfer handles threaded from the prefill
    /// response into the decode request.
    Nixl,
}

impl Connector {
    pub async fn proxy(
        &self,
        client: &reqwest::Client,
        target: &ProxyTarget,
        path: &str,
        prefill_body: Option<&JsonBody>,
        decode_body: &JsonBody,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        match self {
            Connector::Direct => post(client, &target.decode, path, decode_body, timeout).await,
            Connector::Http => {
                let prefill_addr = target.prefill.as_deref().ok_or_else(|| {
                    GatewayError::Scheduling("PD connector without a prefill pod".into())
                })?;
                let prefill_body = prefill_body.ok_or_else(|| {
                    GatewayError::Scheduling("PD connector without a prefill body".into())
                })?;

                let response = post(client, prefill_addr, path, prefill_body, timeout).await?;
                // Fully read (and discard) the prefill response before the
                // decode leg starts; the KV-cache is complete only then.
                response
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::Upstream(format!("prefill body: {e}")))?;
                debug!(prefill = %prefill_addr, decode = %target.decode, "prefill_complete");

                post(client, &target.decode, path, decode_body, timeout).await
            }
            Connector::Nixl => {
                let prefill_addr = target.prefill.as_deref().ok_or_else(|| {
                    GatewayError::Scheduling("PD connector without a prefill pod".into())
                })?;
                let prefill_body = prefill_body.ok_or_else(|| {
                    GatewayError::Scheduling("PD connector without a prefill body".into())
                })?;

                let mut prefill = prefill_body.clone();
                add_prefill_kv_transfer(&mut prefill);

                let response = post(client, prefill_addr, path, &prefill, timeout).await?;
                let prefill_json: Value = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Upstream(format!("prefill body: {e}")))?;
                debug!(prefill = %prefill_addr, decode = %target.decode, "prefill_complete");

                let mut decode = decode_body.clone();
                thread_kv_transfer(&mut decode, &prefill_json);

                post(client, &target.decode, path, &decode, timeout).await
            }
        }
    }
}

async fn post(
    client: &reqwest::Client,
    address: &str,
    path: &str,
    body: &JsonBody,
    timeout: Duration,
) -> Result<reqwest::Response, GatewayError> {
    let url = format!("http://{address}{path}");
    let response = client
        .post(&url)
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::UpstreamTimeout(timeout)
            } else {
                GatewayError::Upstream(format!("{url}: {e}"))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(GatewayError::UpstreamStatus(status.as_u16()));
    }
    Ok(response)
}
