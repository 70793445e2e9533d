use std::sync::Arc;

use rand::Rng;

use crate::datastore::PodInfo;

use super::{SchedulingContext, ScorePlugin};

/// Uniform random scoring. Mutually exclusive with every other score
/// plugin; the config loader enforces that.
pub struct Random;

impl ScorePlugin for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn score(&self, _ctx: &SchedulingContext, pods: &[Arc<PodInfo>]) -> Vec<u32> {
        let mut rng = rand::rng();
        pods.iter().map(|_| rng.random_range(0..=100)).collect()
    }
}

/* ============================= TESTS ============================= */
