//! Control-plane reconcilers.
//!
//! The two custom resources run through `kube::runtime::controller`
//! loops: each reconcile resolves the object, mirrors it into the
//! datastore, and a cleanup finalizer turns deletion into an explicit
//! datastore delete before the object disappears. Failed reconciles are
//! re-queued with exponential backoff; once a key exhausts its retry
//! budget it is dropped with a warning until a new event arrives.
//!
//! Pods are not ours to put finalizers on, so the pod mirror is a plain
//! watch loop that applies `Applied`/`Deleted` events in arrival order.

pub mod model_route;
pub mod model_server;
pub mod pod;

use std::collections::HashMap;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::errors::GatewayError;

pub(crate) const FINALIZER: &str = "gateway.infergate.dev/cleanup";
pub(crate) const MAX_RETRIES: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/* ============================= RETRY BUDGET ============================= */

fn backoff_for(attempt: u32) -> Duration {
    // 0.5s, 1s, 2s, 4s, 8s.
    BASE_BACKOFF * 2u32.saturating_pow(attempt.min(6))
}

/// Consecutive-failure counter per key, shared by a controller's
/// reconcile and error policy.
#[derive(Default)]
pub(crate) struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    /// Returns the next backoff, or `None` once the budget is spent (the
    /// counter resets so a later event starts a fresh budget).
    fn next_backoff(&self, key: &str) -> Option<Duration> {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        if *count >= MAX_RETRIES {
            attempts.remove(key);
            return None;
        }
        *count += 1;
        Some(backoff_for(*count - 1))
    }

    pub(crate) fn reset(&self, key: &str) {
        self.attempts.lock().remove(key);
    }
}

/// Shared error policy body: requeue with backoff, or drop the key with a
/// warning once its retries are exhausted.
pub(crate) fn requeue_or_drop(
    retries: &RetryTracker,
    kind: &'static str,
    key: &str,
    error: &ReconcileError,
) -> Action {
    match retries.next_backoff(key) {
        Some(delay) => {
            warn!(kind, key = %key, error = %error, "reconcile_failed_requeueing");
            Action::requeue(delay)
        }
        None => {
            warn!(
                kind,
                key = %key,
                error = %error,
                retries = MAX_RETRIES,
                "reconcile_retries_exhausted_dropping"
            );
            Action::await_change()
        }
    }
}

/* ============================= FINALIZER ============================= */

pub(crate) fn has_finalizer(finalizers: Option<&[String]>) -> bool {
    finalizers.is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

pub(crate) async fn set_finalizer<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });
    api.patch(name, &PatchParams::apply("infergate"), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

pub(crate) async fn clear_finalizer<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": []
        }
    });
    api.patch(name, &PatchParams::apply("infergate"), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/* ============================= TESTS ============================= */
