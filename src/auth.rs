//! JWT validation against per-server JWKS endpoints.
//!
//! Key sets are cached per `jwks_uri` with a fixed TTL, refreshed by a
//! background task and re-fetched once when validation fails against a
//! stale cache (key rotation shows up as exactly that failure).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header::AUTHORIZATION;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::crd::JwtSpec;
use crate::errors::GatewayError;

pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(3600);

/* ============================= CACHE ============================= */

struct CachedKeySet {
    keys: JwkSet,
    fetched_at: Instant,
}

pub struct JwksCache {
    http: reqwest::Client,
    ttl: Duration,
    entries: RwLock<HashMap<String, Arc<CachedKeySet>>>,
}

impl JwksCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a key set without fetching. Also the test seam.
    pub fn prime(&self, jwks_uri: &str, keys: JwkSet) {
        self.entries.write().insert(
            jwks_uri.to_string(),
            Arc::new(CachedKeySet {
                keys,
                fetched_at: Instant::now(),
            }),
        );
    }

    async fn fetch(&self, jwks_uri: &str) -> Result<Arc<CachedKeySet>, GatewayError> {
        let keys: JwkSet = self
            .http
            .get(jwks_uri)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| GatewayError::Auth(format!("jwks fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::Auth(format!("jwks fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::Auth(format!("jwks parse failed: {e}")))?;

        let entry = Arc::new(CachedKeySet {
            keys,
            fetched_at: Instant::now(),
        });
        self.entries
            .write()
            .insert(jwks_uri.to_string(), entry.clone());
        debug!(jwks_uri = %jwks_uri, "jwks_refreshed");
        Ok(entry)
    }

    async fn key_set(&self, jwks_uri: &str) -> Result<Arc<CachedKeySet>, GatewayError> {
        if let Some(entry) = self.entries.read().get(jwks_uri) {
            return Ok(entry.clone());
        }
        self.fetch(jwks_uri).await
    }

    /// Validate the request's bearer token against the server's JWT rules.
    pub async fn validate(&self, spec: &JwtSpec, headers: &HeaderMap) -> Result<(), GatewayError> {
        let token = bearer_token(headers)?;
        let entry = self.key_set(&spec.jwks_uri).await?;

        match validate_token(&entry.keys, spec, token) {
            Ok(()) => Ok(()),
            Err(error) => {
                // A rotated key looks like a validation failure against an
                // expired cache: refresh once and retry before rejecting.
                if entry.fetched_at.elapsed() > self.ttl {
                    let fresh = self.fetch(&spec.jwks_uri).await?;
                    return validate_token(&fresh.keys, spec, token);
                }
                Err(error)
            }
        }
    }

    /// Refresh every cached key set past its TTL.
    pub async fn refresh_expired(&self) {
        let stale: Vec<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(_, e)| e.fetched_at.elapsed() > self.ttl)
                .map(|(uri, _)| uri.clone())
                .collect()
        };
        for uri in stale {
            if let Err(e) = self.fetch(&uri).await {
                warn!(jwks_uri = %uri, error = %e, "jwks_refresh_failed");
            }
        }
    }
}

/// Periodic JWKS refresh, spawned at startup.
pub async fn run_jwks_refresher(cache: Arc<JwksCache>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        cache.refresh_expired().await;
    }
}

/* ============================= VALIDATION ============================= */

fn bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| GatewayError::Auth("missing authorization header".into()))?
        .to_str()
        .map_err(|_| GatewayError::Auth("malformed authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GatewayError::Auth("authorization header is not a bearer token".into()))
}

fn validate_token(keys: &JwkSet, spec: &JwtSpec, token: &str) -> Result<(), GatewayError> {
    let header =
        decode_header(token).map_err(|e| GatewayError::Auth(format!("malformed token: {e}")))?;

    let candidates: Vec<&Jwk> = match &header.kid {
        Some(kid) => keys.find(kid).into_iter().collect(),
        None => keys.keys.iter().collect(),
    };
    if candidates.is_empty() {
        return Err(GatewayError::Auth("no matching signing key".into()));
    }

    let mut validation = Validation::new(header.alg);
    validation.set_issuer(&[&spec.issuer]);
    if spec.audiences.is_empty() {
        validation.validate_aud = false;
    } else {
        validation.set_audience(&spec.audiences);
    }

    let mut last_error = GatewayError::Auth("no matching signing key".into());
    for jwk in candidates {
        let key = match DecodingKey::from_jwk(jwk) {
            Ok(key) => key,
            Err(e) => {
                last_error = GatewayError::Auth(format!("unusable signing key: {e}"));
                continue;
            }
        };
        match decode::<serde_json::Value>(token, &key, &validation) {
            Ok(_) => return Ok(()),
            Err(e) => last_error = GatewayError::Auth(format!("token rejected: {e}")),
        }
    }
    Err(last_error)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &[u8] = b"gateway-test-secret";

    fn symmetric_jwks(kid: &str) -> JwkSet {
        serde_json::from_value(json!({
            "keys": [{
                "kty": "oct",
                "kid": kid,
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(SECRET),
            }]
        }))
        .unwrap()
    }

    fn jwt_spec() -> JwtSpec {
        JwtSpec {
            issuer: "https://issuer.test".to_string(),
            audiences: vec!["infergate".to_string()],
            jwks_uri: "https://issuer.test/jwks.json".to_string(),
        }
    }

    fn sign_token(claims: serde_json::Value, kid: &str) -> String {
        let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
        header.kid = Some(kid.to_string());
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn future_exp() -> i64 {
        (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600) as i64
    }

    fn auth_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[tokio::test]
    async fn test_valid_token_accepted() {
        let cache = JwksCache::new(DEFAULT_JWKS_TTL);
        let spec = jwt_spec();
        cache.prime(&spec.jwks_uri, symmetric_jwks("k1"));

        let token = sign_token(
            json!({"iss": "https://issuer.test", "aud": "infergate", "exp": future_exp()}),
            "k1",
        );
        assert!(cache.validate(&spec, &auth_headers(&token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let cache = JwksCache::new(DEFAULT_JWKS_TTL);
        let spec = jwt_spec();
        cache.prime(&spec.jwks_uri, symmetric_jwks("k1"));

        let token = sign_token(
            json!({"iss": "https://issuer.test", "aud": "infergate", "exp": 1000}),
            "k1",
        );
        let err = cache.validate(&spec, &auth_headers(&token)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[tokio::test]
    async fn test_audience_mismatch_rejected() {
        let cache = JwksCache::new(DEFAULT_JWKS_TTL);
        let spec = jwt_spec();
        cache.prime(&spec.jwks_uri, symmetric_jwks("k1"));

        let token = sign_token(
            json!({"iss": "https://issuer.test", "aud": "someone-else", "exp": future_exp()}),
            "k1",
        );
        assert!(cache.validate(&spec, &auth_headers(&token)).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_issuer_rejected() {
        let cache = JwksCache::new(DEFAULT_JWKS_TTL);
        let spec = jwt_spec();
        cache.prime(&spec.jwks_uri, symmetric_jwks("k1"));

        let token = sign_token(
            json!({"iss": "https://evil.test", "aud": "infergate", "exp": future_exp()}),
            "k1",
        );
        assert!(cache.validate(&spec, &auth_headers(&token)).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_kid_rejected() {
        let cache = JwksCache::new(DEFAULT_JWKS_TTL);
        let spec = jwt_spec();
        cache.prime(&spec.jwks_uri, symmetric_jwks("k1"));

        let token = sign_token(
            json!({"iss": "https://issuer.test", "aud": "infergate", "exp": future_exp()}),
            "other-key",
        );
        assert!(cache.validate(&spec, &auth_headers(&token)).await.is_err());
    }

    #[tokio::test]
    async fn test_no_audiences_skips_aud_check() {
        let cache = JwksCache::new(DEFAULT_JWKS_TTL);
        let mut spec = jwt_spec();
        spec.audiences = vec![];
        cache.prime(&spec.jwks_uri, symmetric_jwks("k1"));

        let token = sign_token(
            json!({"iss": "https://issuer.test", "exp": future_exp()}),
            "k1",
        );
        assert!(cache.validate(&spec, &auth_headers(&token)).await.is_ok());
    }
}
