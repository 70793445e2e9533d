use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/* ============================= GATEWAY CONFIG ============================= */

/// Static gateway configuration, loaded once at startup from YAML.
///
/// Everything dynamic (routes, servers, pods) comes from the control plane;
/// this file only configures the scheduling pipeline and the rate-limiter
/// backend, which cannot change without a restart.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitBackendConfig,
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("Failed to read config file {path}"))?;
        let config: GatewayConfig =
            serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {path}"))?;
        Ok(config)
    }
}

/* ============================= SCHEDULER ============================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Enabled plugins in declared order. Filters run in this order; score
    /// weights multiply each plugin's 0-100 score before summing.
    pub plugins: Vec<PluginConfig>,

    /// Pods with at least this many queued requests are filtered out.
    pub max_waiting_requests: u64,

    /// Blend factor for the latency score: `w * TTFT + (1 - w) * TPOT`.
    pub latency_blend_weight: f64,

    pub prefix_cache: PrefixCacheConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            plugins: vec![
                PluginConfig::new("least-request", 1),
                PluginConfig::new("prefix-cache", 1),
                PluginConfig::new("least-latency", 1),
            ],
            max_waiting_requests: 128,
            latency_blend_weight: 0.5,
            prefix_cache: PrefixCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl PluginConfig {
    pub fn new(name: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrefixCacheConfig {
    /// Prompt characters per hash block.
    pub block_size: usize,

    /// Longest prefix (in blocks) considered when scoring a pod.
    pub max_blocks_to_match: usize,

    /// Block hashes retained per (model, pod) before LRU eviction.
    pub max_hashes_per_pod: usize,
}

impl Default for PrefixCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            max_blocks_to_match: 128,
            max_hashes_per_pod: 4096,
        }
    }
}

/* ============================= RATE LIMITER ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitBackendConfig {
    /// When set, token buckets live in Redis and are shared across gateway
    /// instances. When unset, buckets are process-local.
    pub redis_url: Option<String>,

    pub key_prefix: String,

    /// What to do with a request when Redis cannot be reached.
    pub on_redis_error: RedisFailurePolicy,
}

impl RateLimitBackendConfig {
    pub fn key_prefix_or_default(&self) -> &str {
        if self.key_prefix.is_empty() {
            "infergate"
        } else {
            &self.key_prefix
        }
    }
}

/// Deployment policy for Redis outages: fail closed (reject) or open (allow).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RedisFailurePolicy {
    #[default]
    Reject,
    Allow,
}

/* ============================= TESTS ============================= */
