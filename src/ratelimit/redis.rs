//! Redis-backed token bucket.
//!
//! The bucket state is a hash of `tokens` and `last_update`; refill and
//! consumption run inside one Lua script, so concurrent gateway instances
//! see a single atomic token-bucket. Time comes from `TIME` on the Redis
//! server, never from gateway clocks.

use std::sync::LazyLock;
use std::time::Duration;

use redis::Script;
use redis::aio::ConnectionManager;

use crate::errors::GatewayError;

/// KEYS[1]: bucket hash. ARGV: capacity, refill per second, requested
/// tokens, expiry seconds, allow-debt flag. Returns `{granted, tokens}`
/// with tokens serialized as a string to keep the fraction.
const TOKEN_BUCKET_SRC: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local expiry = tonumber(ARGV[4])
local allow_debt = tonumber(ARGV[5])

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_update')
local tokens = tonumber(state[1])
local last_update = tonumber(state[2])
if tokens == nil or last_update == nil then
  tokens = capacity
  last_update = now
end

tokens = math.min(capacity, tokens + (now - last_update) * rate)

local granted = 0
if requested > 0 then
  if allow_debt == 1 then
    tokens = tokens - requested
    granted = 1
  elseif tokens >= requested then
    tokens = tokens - requested
    granted = 1
  end
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_update', now)
redis.call('EXPIRE', KEYS[1], expiry)
return {granted, tostring(tokens)}
"#;

static TOKEN_BUCKET: LazyLock<Script> = LazyLock::new(|| Script::new(TOKEN_BUCKET_SRC));

pub struct RedisBucket {
    conn: ConnectionManager,
    key: String,
    capacity: f64,
    refill_per_sec: f64,
    expiry_seconds: u64,
}

impl RedisBucket {
    pub fn new(conn: ConnectionManager, key: String, limit: u64, unit_seconds: u64) -> Self {
        let capacity = limit as f64;
        Self {
            conn,
            key,
            capacity,
            refill_per_sec: capacity / unit_seconds.max(1) as f64,
            // Buckets for retired models disappear on their own: expiry is
            // three refill periods, clamped to [10 minutes, 90 days].
            expiry_seconds: (3 * unit_seconds).clamp(600, 90 * 86_400),
        }
    }

    async fn invoke(&self, requested: f64, allow_debt: bool) -> Result<(bool, f64), GatewayError> {
        let mut conn = self.conn.clone();
        let (granted, tokens): (i64, String) = TOKEN_BUCKET
            .key(&self.key)
            .arg(self.capacity)
            .arg(self.refill_per_sec)
            .arg(requested)
            .arg(self.expiry_seconds)
            .arg(allow_debt as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Upstream(format!("redis: {e}")))?;
        let tokens: f64 = tokens
            .parse()
            .map_err(|_| GatewayError::Upstream(format!("redis: bad token count {tokens:?}")))?;
        Ok((granted == 1, tokens))
    }

    /// Consume `tokens` if available.
    pub async fn try_consume(&self, tokens: f64) -> Result<bool, GatewayError> {
        let (granted, _) = self.invoke(tokens, false).await?;
        Ok(granted)
    }

    /// Consume unconditionally; the bucket may go into debt.
    pub async fn deduct(&self, tokens: f64) -> Result<(), GatewayError> {
        self.invoke(tokens, true).await?;
        Ok(())
    }

    /// Tokens currently available (refreshes refill as a side effect).
    pub async fn available(&self) -> Result<f64, GatewayError> {
        let (_, tokens) = self.invoke(0.0, false).await?;
        Ok(tokens)
    }

    /// How long until `tokens` will be available, given `available`.
    pub fn time_until(&self, tokens: f64, available: f64) -> Duration {
        let missing = tokens - available;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing / self.refill_per_sec)
    }
}

/* ============================= TESTS ============================= */
