use std::sync::Arc;

use crate::datastore::PodInfo;

use super::{MAX_PLUGIN_SCORE, SchedulingContext, ScorePlugin};

/// Prefers pods with the best recent latency.
///
/// Blends the two canonical serving latencies into
/// `w * TTFT + (1 - w) * TPOT` and scores inversely, normalized against the
/// worst candidate. Pods without observations blend to zero and score full.
pub struct LeastLatency {
    blend_weight: f64,
}

impl LeastLatency {
    pub fn new(blend_weight: f64) -> Self {
        Self {
            blend_weight: blend_weight.clamp(0.0, 1.0),
        }
    }

    fn blended(&self, pod: &PodInfo) -> f64 {
        let metrics = pod.metrics_snapshot();
        self.blend_weight * metrics.time_to_first_token
            + (1.0 - self.blend_weight) * metrics.time_per_output_token
    }
}

impl ScorePlugin for LeastLatency {
    fn name(&self) -> &'static str {
        "least-latency"
    }

    fn score(&self, _ctx: &SchedulingContext, pods: &[Arc<PodInfo>]) -> Vec<u32> {
        let blends: Vec<f64> = pods.iter().map(|p| self.blended(p)).collect();
        let max = blends.iter().copied().fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return vec![MAX_PLUGIN_SCORE; pods.len()];
        }
        blends
            .iter()
            .map(|blend| (((max - blend) / max) * 100.0) as u32)
            .collect()
    }
}

/* ============================= TESTS ============================= */
