use std::sync::Arc;

use crate::datastore::PodInfo;

use super::{FilterPlugin, MAX_PLUGIN_SCORE, SchedulingContext, ScorePlugin};

/// Prefers pods with the least outstanding work.
///
/// As a filter, rejects pods whose queue has reached `max_waiting_requests`.
/// As a scorer, ranks by `running + 100 * waiting`: the magnifier makes any
/// queued request dominate differences in running load.
pub struct LeastRequest {
    max_waiting_requests: u64,
}

impl LeastRequest {
    pub fn new(max_waiting_requests: u64) -> Self {
        Self {
            max_waiting_requests,
        }
    }

    fn base_load(pod: &PodInfo) -> u64 {
        let metrics = pod.metrics_snapshot();
        metrics.running_requests + 100 * metrics.waiting_requests
    }
}

impl FilterPlugin for LeastRequest {
    fn name(&self) -> &'static str {
        "least-request"
    }

    fn filter(&self, _ctx: &SchedulingContext, pods: Vec<Arc<PodInfo>>) -> Vec<Arc<PodInfo>> {
        pods.into_iter()
            .filter(|pod| pod.metrics_snapshot().waiting_requests < self.max_waiting_requests)
            .collect()
    }
}

impl ScorePlugin for LeastRequest {
    fn name(&self) -> &'static str {
        "least-request"
    }

    fn score(&self, _ctx: &SchedulingContext, pods: &[Arc<PodInfo>]) -> Vec<u32> {
        let bases: Vec<u64> = pods.iter().map(|p| Self::base_load(p)).collect();
        let max_base = bases.iter().copied().max().unwrap_or(0);
        if max_base == 0 {
            return vec![MAX_PLUGIN_SCORE; pods.len()];
        }
        bases
            .iter()
            .map(|base| (((max_base - base) as f64 / max_base as f64) * 100.0) as u32)
            .collect()
    }
}

/* ============================= TESTS ============================= */
