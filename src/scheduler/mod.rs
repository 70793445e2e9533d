//! The scheduling pipeline: filter, score, select, notify.
//!
//! One request flows through every enabled Filter plugin in declared order,
//! then each survivor is scored 0-100 by every enabled Score plugin. Scores
//! are multiplied by the plugin's configured weight and summed; the pod with
//! the maximum aggregate wins, ties broken by pod name. PostSchedule hooks
//! run with the winner (fire-and-forget side effects).

pub mod least_latency;
pub mod least_request;
pub mod prefix_cache;
pub mod random;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::datastore::{PdGroupPods, PodInfo};
use crate::errors::GatewayError;

pub use prefix_cache::PrefixCacheStore;

pub const MAX_PLUGIN_SCORE: u32 = 100;

/* ============================= CONTEXT ============================= */

/// Everything a plugin may inspect for one scheduling decision.
pub struct SchedulingContext {
    pub model: String,
    pub prompt: String,
    pub is_lora: bool,
    /// Set once a PD group has been chosen.
    pub group_value: Option<String>,
    /// Prompt block hashes, computed lazily by the prefix-cache plugin and
    /// shared between its score and post-schedule passes.
    pub block_hashes: OnceLock<Vec<u64>>,
}

impl SchedulingContext {
    pub fn new(model: &str, prompt: &str, is_lora: bool) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            is_lora,
            group_value: None,
            block_hashes: OnceLock::new(),
        }
    }
}

/* ============================= PLUGIN TRAITS ============================= */

/// Rejects pods that are disqualified from serving the request.
pub trait FilterPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter(&self, ctx: &SchedulingContext, pods: Vec<Arc<PodInfo>>) -> Vec<Arc<PodInfo>>;
}

/// Scores each candidate 0-100; one call per candidate list so plugins can
/// normalize against the observed extremes.
pub trait ScorePlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, ctx: &SchedulingContext, pods: &[Arc<PodInfo>]) -> Vec<u32>;
}

/// Fire-and-forget side effects with the winning pod.
pub trait PostSchedulePlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn post_schedule(&self, ctx: &SchedulingContext, chosen: &Arc<PodInfo>);
}

/* ============================= SCHEDULER ============================= */

pub struct Scheduler {
    filters: Vec<Arc<dyn FilterPlugin>>,
    scorers: Vec<(Arc<dyn ScorePlugin>, u32)>,
    post_schedule: Vec<Arc<dyn PostSchedulePlugin>>,
}

/// A scheduling decision: either one pod, or a prefill/decode pair from the
/// same PD group.
#[derive(Debug, Clone)]
pub enum SchedulingDecision {
    Single(Arc<PodInfo>),
    PrefillDecode {
        group_value: String,
        prefill: Arc<PodInfo>,
        decode: Arc<PodInfo>,
    },
}

impl Scheduler {
    /// Build the pipeline from declarative config.
    ///
    /// `random` is mutually exclusive with every other score plugin; when
    /// configured together it is dropped with a warning rather than failing
    /// the whole config.
    pub fn from_config(
        config: &SchedulerConfig,
        prefix_cache: Arc<PrefixCacheStore>,
    ) -> Result<Self, GatewayError> {
        let mut enabled = config.plugins.clone();
        let has_other_scorer = enabled
            .iter()
            .any(|p| matches!(p.name.as_str(), "least-request" | "least-latency" | "prefix-cache"));
        if has_other_scorer && enabled.iter().any(|p| p.name == "random") {
            warn!("random score plugin conflicts with configured score plugins, dropping it");
            enabled.retain(|p| p.name != "random");
        }

        let mut scheduler = Scheduler {
            filters: Vec::new(),
            scorers: Vec::new(),
            post_schedule: Vec::new(),
        };

        for plugin in &enabled {
            match plugin.name.as_str() {
                "least-request" => {
                    let p = Arc::new(least_request::LeastRequest::new(
                        config.max_waiting_requests,
                    ));
                    scheduler.filters.push(p.clone());
                    scheduler.scorers.push((p, plugin.weight));
                }
                "least-latency" => {
                    let p = Arc::new(least_latency::LeastLatency::new(
                        config.latency_blend_weight,
                    ));
                    scheduler.scorers.push((p, plugin.weight));
                }
                "prefix-cache" => {
                    let p = Arc::new(prefix_cache::PrefixCachePlugin::new(prefix_cache.clone()));
                    scheduler.scorers.push((p.clone(), plugin.weight));
                    scheduler.post_schedule.push(p);
                }
                "random" => {
                    let p = Arc::new(random::Random);
                    scheduler.scorers.push((p, plugin.weight));
                }
                other => {
                    return Err(GatewayError::Config(format!(
                        "unknown scheduler plugin {other:?}"
                    )));
                }
            }
        }

        Ok(scheduler)
    }

    /// Run the full pipeline and fire post-schedule hooks with the winner.
    pub fn select(
        &self,
        ctx: &SchedulingContext,
        pods: Vec<Arc<PodInfo>>,
    ) -> Result<Arc<PodInfo>, GatewayError> {
        let (winner, score) = self.evaluate(ctx, pods)?;
        debug!(model = %ctx.model, pod = %winner.key, score, "pod_selected");
        for hook in &self.post_schedule {
            hook.post_schedule(ctx, &winner);
        }
        Ok(winner)
    }

    /// Pick a PD group, then a prefill pod and a decode pod from it, scoring
    /// each half independently. The group whose best prefill + best decode
    /// aggregate is highest wins; ties break on group value.
    pub fn select_pd(
        &self,
        ctx: &mut SchedulingContext,
        groups: &HashMap<String, PdGroupPods>,
    ) -> Result<SchedulingDecision, GatewayError> {
        let mut group_values: Vec<&String> = groups.keys().collect();
        group_values.sort();

        let mut best: Option<(u64, &String, (Arc<PodInfo>, u64), (Arc<PodInfo>, u64))> = None;
        for value in group_values {
            let group = &groups[value];
            if group.prefill.is_empty() || group.decode.is_empty() {
                continue;
            }
            let Ok(prefill) = self.evaluate(ctx, group.prefill.clone()) else {
                continue;
            };
            let Ok(decode) = self.evaluate(ctx, group.decode.clone()) else {
                continue;
            };
            let aggregate = prefill.1 + decode.1;
            if best.as_ref().is_none_or(|(top, ..)| aggregate > *top) {
                best = Some((aggregate, value, prefill, decode));
            }
        }

        let Some((_, value, (prefill, _), (decode, _))) = best else {
            return Err(GatewayError::Scheduling(format!(
                "no PD group has both prefill and decode candidates for model {:?}",
                ctx.model
            )));
        };

        ctx.group_value = Some(value.clone());
        debug!(
            model = %ctx.model,
            group = %value,
            prefill = %prefill.key,
            decode = %decode.key,
            "pd_pair_selected"
        );
        // Prefix affinity binds to the prefill half: that is where the
        // KV-cache for the prompt is produced.
        for hook in &self.post_schedule {
            hook.post_schedule(ctx, &prefill);
        }
        Ok(SchedulingDecision::PrefillDecode {
            group_value: value.clone(),
            prefill,
            decode,
        })
    }

    /// Filter, score and pick the winner with its aggregate score.
    fn evaluate(
        &self,
        ctx: &SchedulingContext,
        mut pods: Vec<Arc<PodInfo>>,
    ) -> Result<(Arc<PodInfo>, u64), GatewayError> {
        if pods.is_empty() {
            return Err(GatewayError::Scheduling(format!(
                "no ready pods for model {:?}",
                ctx.model
            )));
        }
        pods.sort_by(|a, b| a.key.cmp(&b.key));

        for filter in &self.filters {
            pods = filter.filter(ctx, pods);
            if pods.is_empty() {
                return Err(GatewayError::Scheduling(format!(
                    "all candidates rejected by filter {:?} for model {:?}",
                    filter.name(),
                    ctx.model
                )));
            }
        }

        let mut aggregates = vec![0u64; pods.len()];
        for (scorer, weight) in &self.scorers {
            let scores = scorer.score(ctx, &pods);
            debug_assert_eq!(scores.len(), pods.len());
            for (aggregate, score) in aggregates.iter_mut().zip(&scores) {
                *aggregate += u64::from((*score).min(MAX_PLUGIN_SCORE)) * u64::from(*weight);
            }
        }

        // Candidates are name-sorted, so a strict comparison makes the
        // lowest-named pod win ties deterministically.
        let mut winner = 0;
        for (i, aggregate) in aggregates.iter().enumerate() {
            if *aggregate > aggregates[winner] {
                winner = i;
            }
        }
        Ok((pods[winner].clone(), aggregates[winner]))
    }
}

/* ============================= TESTS ============================= */
