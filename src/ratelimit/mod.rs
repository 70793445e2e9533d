//! Token-based rate limiting.
//!
//! Each rate-limited model carries up to two buckets: an input bucket
//! checked at admission against a prompt-length token estimate, and an
//! output bucket accounted after the upstream reports real usage. Buckets
//! are process-local or Redis-backed per the ModelServer's scope.

pub mod local;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::{RateLimitBackendConfig, RedisFailurePolicy};
use crate::crd::{RateLimitScope, RateLimitSpec};
use crate::errors::GatewayError;
use self::local::LocalBucket;
use self::redis::RedisBucket;

/* ============================= ESTIMATION ============================= */

/// Best-effort input-token estimate when no tokenizer is wired in:
/// one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/* ============================= BUCKETS ============================= */

enum Bucket {
    Local(LocalBucket),
    Global(RedisBucket),
}

impl Bucket {
    async fn try_consume(&self, tokens: f64) -> Result<bool, GatewayError> {
        match self {
            Bucket::Local(b) => Ok(b.try_consume(tokens)),
            Bucket::Global(b) => b.try_consume(tokens).await,
        }
    }

    async fn deduct(&self, tokens: f64) -> Result<(), GatewayError> {
        match self {
            Bucket::Local(b) => {
                b.deduct(tokens);
                Ok(())
            }
            Bucket::Global(b) => b.deduct(tokens).await,
        }
    }

    async fn available(&self) -> Result<f64, GatewayError> {
        match self {
            Bucket::Local(b) => Ok(b.available()),
            Bucket::Global(b) => b.available().await,
        }
    }

    async fn time_until(&self, tokens: f64) -> Duration {
        match self {
            Bucket::Local(b) => b.time_until(tokens),
            Bucket::Global(b) => {
                let available = b.available().await.unwrap_or(0.0);
                b.time_until(tokens, available)
            }
        }
    }
}

struct ModelBuckets {
    spec: RateLimitSpec,
    input: Option<Bucket>,
    output: Option<Bucket>,
}

/* ============================= LIMITER ============================= */

pub struct RateLimiter {
    backend: RateLimitBackendConfig,
    conn: Option<::redis::aio::ConnectionManager>,
    models: RwLock<HashMap<String, Arc<ModelBuckets>>>,
}

impl RateLimiter {
    /// Connect the limiter; opens the Redis connection when the backend
    /// config names one.
    pub async fn connect(backend: RateLimitBackendConfig) -> anyhow::Result<Self> {
        let conn = match &backend.redis_url {
            Some(url) => {
                let client = ::redis::Client::open(url.as_str())?;
                Some(::redis::aio::ConnectionManager::new(client).await?)
            }
            None => None,
        };
        Ok(Self {
            backend,
            conn,
            models: RwLock::new(HashMap::new()),
        })
    }

    /// Process-local limiter with no Redis backend.
    pub fn local() -> Self {
        Self {
            backend: RateLimitBackendConfig::default(),
            conn: None,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Drop cached buckets so the next admission rebuilds them from the
    /// current spec. Registered as a ModelServer change callback.
    pub fn invalidate(&self) {
        self.models.write().clear();
    }

    /// Admission check for one request.
    ///
    /// Consumes the estimated input tokens from the input bucket, and
    /// rejects up front when the output bucket is already exhausted: some
    /// output will certainly be produced, so a request that cannot finish
    /// within budget should not start.
    pub async fn admit(
        &self,
        model: &str,
        spec: &RateLimitSpec,
        estimated_input: u64,
    ) -> Result<(), GatewayError> {
        let buckets = self.buckets_for(model, spec);

        if let Some(input) = &buckets.input {
            let granted = match input.try_consume(estimated_input as f64).await {
                Ok(granted) => granted,
                Err(e) => return self.on_redis_error(model, e),
            };
            if !granted {
                return Err(GatewayError::InputRateLimit {
                    model: model.to_string(),
                    retry_after: input.time_until(estimated_input as f64).await,
                });
            }
        }

        if let Some(output) = &buckets.output {
            let available = match output.available().await {
                Ok(available) => available,
                Err(e) => return self.on_redis_error(model, e),
            };
            if available < 1.0 {
                return Err(GatewayError::OutputRateLimit {
                    model: model.to_string(),
                    retry_after: output.time_until(1.0).await,
                });
            }
        }

        Ok(())
    }

    /// Post-hoc output accounting; never blocks admission and never fails
    /// the request that produced the tokens.
    pub async fn record_output_tokens(&self, model: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let buckets = { self.models.read().get(model).cloned() };
        let Some(buckets) = buckets else { return };
        let Some(output) = &buckets.output else { return };
        if let Err(e) = output.deduct(tokens as f64).await {
            warn!(model = %model, error = %e, "output_token_accounting_failed");
        }
    }

    fn on_redis_error(&self, model: &str, error: GatewayError) -> Result<(), GatewayError> {
        match self.backend.on_redis_error {
            RedisFailurePolicy::Allow => {
                warn!(model = %model, error = %error, "rate_limiter_unreachable_allowing");
                Ok(())
            }
            RedisFailurePolicy::Reject => {
                warn!(model = %model, error = %error, "rate_limiter_unreachable_rejecting");
                Err(GatewayError::Scheduling(
                    "rate limiter backend unavailable".to_string(),
                ))
            }
        }
    }

    /// Buckets for a model, rebuilt whenever the effective spec changes.
    fn buckets_for(&self, model: &str, spec: &RateLimitSpec) -> Arc<ModelBuckets> {
        if let Some(existing) = self.models.read().get(model)
            && existing.spec == *spec
        {
            return existing.clone();
        }

        let mut models = self.models.write();
        // Re-check under the write lock; another thread may have rebuilt.
        if let Some(existing) = models.get(model)
            && existing.spec == *spec
        {
            return existing.clone();
        }

        let built = Arc::new(ModelBuckets {
            spec: spec.clone(),
            input: spec
                .input_tokens
                .map(|limit| self.build_bucket(model, "input", limit, spec)),
            output: spec
                .output_tokens
                .map(|limit| self.build_bucket(model, "output", limit, spec)),
        });
        models.insert(model.to_string(), built.clone());
        built
    }

    fn build_bucket(&self, model: &str, kind: &str, limit: u64, spec: &RateLimitSpec) -> Bucket {
        let unit_seconds = spec.unit.seconds();
        match (spec.scope, &self.conn) {
            (RateLimitScope::Global, Some(conn)) => {
                let key = format!(
                    "{}:{model}:{kind}",
                    self.backend.key_prefix_or_default()
                );
                Bucket::Global(RedisBucket::new(conn.clone(), key, limit, unit_seconds))
            }
            (RateLimitScope::Global, None) => {
                warn!(
                    model = %model,
                    "global rate limit requested without a redis backend, using local bucket"
                );
                Bucket::Local(LocalBucket::new(limit, unit_seconds))
            }
            (RateLimitScope::Local, _) => Bucket::Local(LocalBucket::new(limit, unit_seconds)),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RateLimitUnit;

    fn input_spec(limit: u64) -> RateLimitSpec {
        RateLimitSpec {
            unit: RateLimitUnit::Second,
            input_tokens: Some(limit),
            output_tokens: None,
            scope: RateLimitScope::Local,
        }
    }

    #[test]
    fn test_token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(16)), 4);
    }

    #[tokio::test]
    async fn test_input_budget_enforced() {
        let limiter = RateLimiter::local();
        let spec = input_spec(10);

        // 4 + 4 fit in a budget of 10; the third request does not.
        assert!(limiter.admit("m1", &spec, 4).await.is_ok());
        assert!(limiter.admit("m1", &spec, 4).await.is_ok());
        let err = limiter.admit("m1", &spec, 4).await.unwrap_err();
        assert!(matches!(err, GatewayError::InputRateLimit { .. }));
    }

    #[tokio::test]
    async fn test_models_have_independent_buckets() {
        let limiter = RateLimiter::local();
        let spec = input_spec(4);
        assert!(limiter.admit("m1", &spec, 4).await.is_ok());
        assert!(limiter.admit("m2", &spec, 4).await.is_ok());
        assert!(limiter.admit("m1", &spec, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_output_lookahead_rejects_when_exhausted() {
        let limiter = RateLimiter::local();
        let spec = RateLimitSpec {
            unit: RateLimitUnit::Hour,
            input_tokens: None,
            output_tokens: Some(100),
            scope: RateLimitScope::Local,
        };

        assert!(limiter.admit("m1", &spec, 5).await.is_ok());
        limiter.record_output_tokens("m1", 150).await;

        let err = limiter.admit("m1", &spec, 5).await.unwrap_err();
        match err {
            GatewayError::OutputRateLimit { retry_after, .. } => {
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected output rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recorded_output_matches_deduction() {
        let limiter = RateLimiter::local();
        let spec = RateLimitSpec {
            unit: RateLimitUnit::Hour,
            input_tokens: None,
            output_tokens: Some(1000),
            scope: RateLimitScope::Local,
        };
        limiter.admit("m1", &spec, 1).await.unwrap();
        limiter.record_output_tokens("m1", 42).await;

        let buckets = limiter.models.read().get("m1").cloned().unwrap();
        let available = match buckets.output.as_ref().unwrap() {
            Bucket::Local(b) => b.available(),
            Bucket::Global(_) => unreachable!(),
        };
        // Hour-long refill adds well under one token during the test.
        assert!((1000.0 - available - 42.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_unknown_model_output_recording_is_noop() {
        let limiter = RateLimiter::local();
        limiter.record_output_tokens("never-admitted", 10).await;
    }

    #[tokio::test]
    async fn test_spec_change_rebuilds_buckets() {
        let limiter = RateLimiter::local();
        assert!(limiter.admit("m1", &input_spec(4), 4).await.is_ok());
        assert!(limiter.admit("m1", &input_spec(4), 4).await.is_err());

        // A raised budget takes effect immediately.
        assert!(limiter.admit("m1", &input_spec(100), 4).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_clears_cached_buckets() {
        let limiter = RateLimiter::local();
        assert!(limiter.admit("m1", &input_spec(4), 4).await.is_ok());
        limiter.invalidate();
        assert!(limiter.models.read().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_hint_present() {
        let limiter = RateLimiter::local();
        let spec = RateLimitSpec {
            unit: RateLimitUnit::Minute,
            input_tokens: Some(10),
            output_tokens: None,
            scope: RateLimitScope::Local,
        };
        limiter.admit("m1", &spec, 10).await.unwrap();
        match limiter.admit("m1", &spec, 10).await.unwrap_err() {
            GatewayError::InputRateLimit { retry_after, .. } => {
                assert!(retry_after > Duration::from_secs(30));
            }
            other => panic!("expected input rate limit, got {other:?}"),
        }
    }
}
