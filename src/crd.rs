use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/* ============================= ROUTE TYPES ============================= */

/// One way of matching a string value: exactly one of the three fields
/// must be set. Checked by [`validate_model_route`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StringMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Anchored automatically; `foo` matches only the full string `foo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl StringMatch {
    fn variant_count(&self) -> usize {
        [
            self.exact.is_some(),
            self.prefix.is_some(),
            self.regex.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count()
    }
}

/// Matches one HTTP request header against a string matcher.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatch {
    /// Header name, compared case-insensitively.
    pub name: String,

    #[serde(flatten)]
    pub value: StringMatch,
}

/// One match condition of a route rule. All listed headers must match, and
/// the URI matcher (when present) must match, for the condition to hold.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderMatch>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,
}

/// A weighted reference to a ModelServer in the same namespace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub model_server: String,

    /// Weights must be specified on all destinations of a rule or on none;
    /// when none carry a weight, every destination weighs 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// A routing rule: when any of `matches` holds (or `matches` is empty), one
/// destination is picked by weighted random choice. Rules are evaluated in
/// order, first match wins.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<RouteMatch>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<Destination>,
}

/// ModelRoute maps a user-visible model name (and optional LoRA adapter
/// names) to one or more ModelServers.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "gateway.infergate.dev",
    version = "v1alpha1",
    kind = "ModelRoute",
    plural = "modelroutes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModelRouteSpec {
    /// The model name clients send in the request body.
    pub model_name: String,

    /// LoRA adapter names served under this route. Requests naming an
    /// adapter resolve here and are flagged as LoRA requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_adapters: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RouteRule>,
}

/* ============================= SERVER TYPES ============================= */

/// Inference engine running on the backend replicas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum Engine {
    #[default]
    #[serde(rename = "vLLM")]
    Vllm,
    #[serde(rename = "SGLang")]
    Sglang,
}

/// Partition of a server's pods into prefill and decode roles.
///
/// Pods matching `prefill_selector` handle prefill, pods matching
/// `decode_selector` handle decode; a prefill pod and a decode pod belong to
/// the same group when they share the same value for the `key` label.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PdGroup {
    pub key: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prefill_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub decode_selector: BTreeMap<String, String>,
}

/// Timeout and retry policy applied to the whole proxied request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPolicy {
    /// Budget for the entire request including all retries, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: u32,

    #[serde(default)]
    pub retry_interval_seconds: u64,
}

/// Token-bucket rate limit for one model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub unit: RateLimitUnit,

    /// Input-token budget per unit; admission-time enforcement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,

    /// Output-token budget per unit; accounted after the response streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,

    /// `local` buckets live in-process; `global` buckets live in Redis and
    /// are shared across gateway instances.
    #[serde(default)]
    pub scope: RateLimitScope,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitUnit {
    #[default]
    Second,
    Minute,
    Hour,
    Day,
    /// Thirty days.
    Month,
}

impl RateLimitUnit {
    pub fn seconds(&self) -> u64 {
        match self {
            RateLimitUnit::Second => 1,
            RateLimitUnit::Minute => 60,
            RateLimitUnit::Hour => 3600,
            RateLimitUnit::Day => 86_400,
            RateLimitUnit::Month => 30 * 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitScope {
    #[default]
    Local,
    Global,
}

/// JWT validation rules for requests resolving to this server.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JwtSpec {
    pub issuer: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,

    pub jwks_uri: String,
}

/// KV-cache transfer mechanism between prefill and decode replicas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum KvConnector {
    #[default]
    Http,
    Lmcache,
    Mooncake,
    Nixl,
}

/// Per-model admission control: bound concurrency and queue excess requests
/// by priority instead of failing fast.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionSpec {
    pub max_concurrent_requests: usize,

    /// Requests held beyond the concurrency bound. Zero disables queueing
    /// (over-limit requests fail fast with 429).
    #[serde(default)]
    pub queue_depth: usize,
}

/// ModelServer names a group of backend replicas running one inference
/// engine, addressed by a label selector.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "gateway.infergate.dev",
    version = "v1alpha1",
    kind = "ModelServer",
    plural = "modelservers",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModelServerSpec {
    #[serde(default)]
    pub engine: Engine,

    /// Label selector matching this server's pods.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Inference port on each pod.
    pub port: u16,

    /// Prometheus scrape port; defaults to `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pd_group: Option<PdGroup>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<TrafficPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kv_connector: Option<KvConnector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionSpec>,
}

impl ModelServerSpec {
    pub fn metrics_port(&self) -> u16 {
        self.metrics_port.unwrap_or(self.port)
    }
}

/* ============================= VALIDATION ============================= */

/// Validate a ModelRoute spec before it is applied to the datastore.
///
/// A failed validation is a `ConfigError`: the resource is not applied and
/// the reconciler re-queues it.
pub fn validate_model_route(spec: &ModelRouteSpec) -> Result<(), GatewayError> {
    if spec.model_name.trim().is_empty() {
        return Err(GatewayError::Config("modelName must not be empty".into()));
    }

    if let Some(adapters) = &spec.lora_adapters
        && adapters.iter().any(|a| a.trim().is_empty())
    {
        return Err(GatewayError::Config(
            "loraAdapters must not contain empty names".into(),
        ));
    }

    if spec.rules.is_empty() {
        return Err(GatewayError::Config(
            "a ModelRoute needs at least one rule".into(),
        ));
    }

    for (i, rule) in spec.rules.iter().enumerate() {
        if rule.destinations.is_empty() {
            return Err(GatewayError::Config(format!(
                "rule {i} has no destinations"
            )));
        }

        let weighted = rule
            .destinations
            .iter()
            .filter(|d| d.weight.is_some())
            .count();
        if weighted != 0 && weighted != rule.destinations.len() {
            return Err(GatewayError::Config(format!(
                "rule {i}: weights must be set on all destinations or on none"
            )));
        }
        if rule.destinations.iter().any(|d| d.weight == Some(0)) {
            return Err(GatewayError::Config(format!(
                "rule {i}: destination weights must be positive"
            )));
        }
        if rule
            .destinations
            .iter()
            .any(|d| d.model_server.trim().is_empty())
        {
            return Err(GatewayError::Config(format!(
                "rule {i}: destination modelServer must not be empty"
            )));
        }

        for m in rule.matches.iter().flatten() {
            for h in m.headers.iter().flatten() {
                validate_string_match(&h.value, &format!("rule {i} header {:?}", h.name))?;
            }
            if let Some(uri) = &m.uri {
                validate_string_match(uri, &format!("rule {i} uri"))?;
            }
        }
    }

    Ok(())
}

fn validate_string_match(m: &StringMatch, what: &str) -> Result<(), GatewayError> {
    if m.variant_count() != 1 {
        return Err(GatewayError::Config(format!(
            "{what}: exactly one of exact, prefix, regex must be set"
        )));
    }
    if let Some(re) = &m.regex {
        regex::Regex::new(re)
            .map_err(|e| GatewayError::Config(format!("{what}: invalid regex: {e}")))?;
    }
    Ok(())
}

/// Validate a ModelServer spec before it is applied to the datastore.
pub fn validate_model_server(spec: &ModelServerSpec) -> Result<(), GatewayError> {
    if spec.selector.is_empty() {
        return Err(GatewayError::Config("selector must not be empty".into()));
    }
    if spec.port == 0 {
        return Err(GatewayError::Config("port must be non-zero".into()));
    }

    if let Some(pd) = &spec.pd_group {
        if pd.key.trim().is_empty() {
            return Err(GatewayError::Config("pdGroup.key must not be empty".into()));
        }
        if pd.prefill_selector.is_empty() || pd.decode_selector.is_empty() {
            return Err(GatewayError::Config(
                "pdGroup needs both prefillSelector and decodeSelector".into(),
            ));
        }
    }

    if let Some(rl) = &spec.rate_limit
        && rl.input_tokens.is_none()
        && rl.output_tokens.is_none()
    {
        return Err(GatewayError::Config(
            "rateLimit needs inputTokens or outputTokens".into(),
        ));
    }

    if let Some(jwt) = &spec.jwt {
        if jwt.issuer.trim().is_empty() {
            return Err(GatewayError::Config("jwt.issuer must not be empty".into()));
        }
        if jwt.jwks_uri.trim().is_empty() {
            return Err(GatewayError::Config("jwt.jwksUri must not be empty".into()));
        }
    }

    if let Some(adm) = &spec.admission
        && adm.max_concurrent_requests == 0
    {
        return Err(GatewayError::Config(
            "admission.maxConcurrentRequests must be positive".into(),
        ));
    }

    Ok(())
}

/* ============================= TESTS ============================= */
