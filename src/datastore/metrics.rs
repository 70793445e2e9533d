//! Backend metrics scraping.
//!
//! Each engine exposes Prometheus text; the poller extracts the handful of
//! series the scheduler scores on. Counters and gauges are taken directly,
//! histograms as delta-averages between consecutive scrapes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Datastore, PodInfo};
use crate::crd::Engine;
use crate::errors::GatewayError;

/* ============================= METRIC NAMES ============================= */

struct EngineMetricNames {
    gpu_cache_usage: &'static str,
    waiting_requests: &'static str,
    running_requests: &'static str,
    ttft_histogram: &'static str,
    tpot_histogram: &'static str,
}

const VLLM_METRICS: EngineMetricNames = EngineMetricNames {
    gpu_cache_usage: "vllm:gpu_cache_usage_perc",
    waiting_requests: "vllm:num_request_waiting",
    running_requests: "vllm:num_requests_running",
    ttft_histogram: "vllm:time_to_first_token_seconds",
    tpot_histogram: "vllm:time_per_output_token_seconds",
};

const SGLANG_METRICS: EngineMetricNames = EngineMetricNames {
    gpu_cache_usage: "sglang:token_usage",
    waiting_requests: "sglang:num_queue_reqs",
    running_requests: "sglang:num_running_reqs",
    ttft_histogram: "sglang:time_to_first_token_seconds",
    tpot_histogram: "sglang:time_per_output_token_seconds",
};

fn names_for(engine: Engine) -> &'static EngineMetricNames {
    match engine {
        Engine::Vllm => &VLLM_METRICS,
        Engine::Sglang => &SGLANG_METRICS,
    }
}

/* ============================= TEXT PARSING ============================= */

/// Values extracted from one scrape. Histogram sums/counts are aggregated
/// across label sets.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScrapedMetrics {
    pub gpu_cache_usage: Option<f64>,
    pub waiting_requests: Option<f64>,
    pub running_requests: Option<f64>,
    pub ttft_sum: Option<f64>,
    pub ttft_count: Option<f64>,
    pub tpot_sum: Option<f64>,
    pub tpot_count: Option<f64>,
}

/// Parse Prometheus text exposition, keeping only the series relevant to
/// `engine`. Unknown families, comments and malformed lines are skipped.
pub fn parse_metrics(text: &str, engine: Engine) -> ScrapedMetrics {
    let names = names_for(engine);
    let mut scraped = ScrapedMetrics::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((series, value)) = split_sample(line) else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        let family = series.split('{').next().unwrap_or(series);

        if family == names.gpu_cache_usage {
            scraped.gpu_cache_usage = Some(value);
        } else if family == names.waiting_requests {
            add(&mut scraped.waiting_requests, value);
        } else if family == names.running_requests {
            add(&mut scraped.running_requests, value);
        } else if let Some(kind) = family.strip_prefix(names.ttft_histogram) {
            match kind {
                "_sum" => add(&mut scraped.ttft_sum, value),
                "_count" => add(&mut scraped.ttft_count, value),
                _ => {}
            }
        } else if let Some(kind) = family.strip_prefix(names.tpot_histogram) {
            match kind {
                "_sum" => add(&mut scraped.tpot_sum, value),
                "_count" => add(&mut scraped.tpot_count, value),
                _ => {}
            }
        }
    }

    scraped
}

/// A sample line is `name{labels} value [timestamp]` or `name value`.
/// Labels may contain spaces inside quoted values, so split after the
/// closing brace when one is present.
fn split_sample(line: &str) -> Option<(&str, &str)> {
    let (series, rest) = if let Some(brace) = line.find('}') {
        (&line[..=brace], line[brace + 1..].trim_start())
    } else {
        let space = line.find(char::is_whitespace)?;
        (&line[..space], line[space + 1..].trim_start())
    };
    let value = rest.split_whitespace().next()?;
    Some((series, value))
}

fn add(slot: &mut Option<f64>, value: f64) {
    *slot = Some(slot.unwrap_or(0.0) + value);
}

/* ============================= SNAPSHOT UPDATE ============================= */

/// Fold a scrape into the pod's rolling snapshot.
///
/// Histogram averages use `(sum_now - sum_prev) / (count_now - count_prev)`;
/// when the count did not advance (or went backwards after an engine
/// restart) the previous average is retained.
pub fn apply_scrape(pod: &PodInfo, scraped: &ScrapedMetrics) {
    let mut snapshot = pod.metrics.write();

    if let Some(v) = scraped.gpu_cache_usage {
        snapshot.gpu_cache_usage = v;
    }
    if let Some(v) = scraped.waiting_requests {
        snapshot.waiting_requests = v.max(0.0) as u64;
    }
    if let Some(v) = scraped.running_requests {
        snapshot.running_requests = v.max(0.0) as u64;
    }

    if let (Some(sum), Some(count)) = (scraped.ttft_sum, scraped.ttft_count) {
        let count = count.max(0.0) as u64;
        if count > snapshot.ttft_count {
            let delta = (count - snapshot.ttft_count) as f64;
            snapshot.time_to_first_token = (sum - snapshot.ttft_sum) / delta;
        }
        snapshot.ttft_sum = sum;
        snapshot.ttft_count = count;
    }
    if let (Some(sum), Some(count)) = (scraped.tpot_sum, scraped.tpot_count) {
        let count = count.max(0.0) as u64;
        if count > snapshot.tpot_count {
            let delta = (count - snapshot.tpot_count) as f64;
            snapshot.time_per_output_token = (sum - snapshot.tpot_sum) / delta;
        }
        snapshot.tpot_sum = sum;
        snapshot.tpot_count = count;
    }
}

/* ============================= SCRAPING ============================= */

impl Datastore {
    /// Scrape one pod's `/metrics` endpoint and refresh its snapshot.
    ///
    /// On failure the snapshot is left stale: the last-observed values stay
    /// usable for scoring, and only a control-plane event removes the pod.
    pub async fn update_pod_metrics(&self, pod: &PodInfo) -> Result<(), GatewayError> {
        let url = pod.metrics_url();
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("scrape {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamStatus(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Upstream(format!("scrape {url}: {e}")))?;

        apply_scrape(pod, &parse_metrics(&body, pod.engine));
        Ok(())
    }
}

/// Periodic scrape over all known pods. The period is seconds-granular, so
/// scraping load is O(pods / period) and independent of request rate.
pub async fn run_metrics_poller(store: Arc<Datastore>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let pods = store.list_pods();
        debug!(pods = pods.len(), "metrics_poll_cycle");

        let scrapes = pods.iter().map(|pod| {
            let store = store.clone();
            let pod = pod.clone();
            async move {
                if let Err(e) = store.update_pod_metrics(&pod).await {
                    warn!(pod = %pod.key, error = %e, "metrics_scrape_failed");
                }
            }
        });
        futures::future::join_all(scrapes).await;
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{PodSeed, object_key};
    use parking_lot::RwLock;
    use std::collections::BTreeMap;

    fn test_pod(engine: Engine) -> PodInfo {
        let seed = PodSeed {
            namespace: "default".into(),
            name: "p-0".into(),
            ip: "10.0.0.1".into(),
            labels: BTreeMap::new(),
            models: vec![],
        };
        PodInfo {
            key: object_key(&seed.namespace, &seed.name),
            namespace: seed.namespace,
            name: seed.name,
            ip: seed.ip,
            port: 8000,
            metrics_port: 8000,
            engine,
            labels: seed.labels,
            models: seed.models,
            metrics: RwLock::new(Default::default()),
        }
    }

    const VLLM_SAMPLE: &str = r#"
# HELP vllm:gpu_cache_usage_perc GPU KV-cache usage.
# TYPE vllm:gpu_cache_usage_perc gauge
vllm:gpu_cache_usage_perc{model_name="m1"} 0.42
vllm:num_request_waiting{model_name="m1"} 3
vllm:num_requests_running{model_name="m1"} 5
vllm:time_to_first_token_seconds_bucket{le="0.1",model_name="m1"} 90
vllm:time_to_first_token_seconds_sum{model_name="m1"} 12.0
vllm:time_to_first_token_seconds_count{model_name="m1"} 100
vllm:time_per_output_token_seconds_sum{model_name="m1"} 4.0
vllm:time_per_output_token_seconds_count{model_name="m1"} 200
"#;

    #[test]
    fn test_parse_vllm_text() {
        let scraped = parse_metrics(VLLM_SAMPLE, Engine::Vllm);
        assert_eq!(scraped.gpu_cache_usage, Some(0.42));
        assert_eq!(scraped.waiting_requests, Some(3.0));
        assert_eq!(scraped.running_requests, Some(5.0));
        assert_eq!(scraped.ttft_sum, Some(12.0));
        assert_eq!(scraped.ttft_count, Some(100.0));
        assert_eq!(scraped.tpot_sum, Some(4.0));
        assert_eq!(scraped.tpot_count, Some(200.0));
    }

    #[test]
    fn test_parse_sglang_text() {
        let text = r#"
sglang:token_usage 0.8
sglang:num_queue_reqs 2
sglang:num_running_reqs 4
sglang:time_to_first_token_seconds_sum 6.0
sglang:time_to_first_token_seconds_count 10
"#;
        let scraped = parse_metrics(text, Engine::Sglang);
        assert_eq!(scraped.gpu_cache_usage, Some(0.8));
        assert_eq!(scraped.waiting_requests, Some(2.0));
        assert_eq!(scraped.ttft_count, Some(10.0));
        // vLLM families are invisible to an SGLang scrape.
        assert_eq!(parse_metrics(text, Engine::Vllm), ScrapedMetrics::default());
    }

    #[test]
    fn test_histogram_sums_aggregate_across_label_sets() {
        let text = r#"
vllm:time_per_output_token_seconds_sum{model_name="a"} 1.5
vllm:time_per_output_token_seconds_sum{model_name="b"} 2.5
vllm:time_per_output_token_seconds_count{model_name="a"} 10
vllm:time_per_output_token_seconds_count{model_name="b"} 30
vllm:num_request_waiting{model_name="a"} 1
vllm:num_request_waiting{model_name="b"} 2
"#;
        let scraped = parse_metrics(text, Engine::Vllm);
        assert_eq!(scraped.tpot_sum, Some(4.0));
        assert_eq!(scraped.tpot_count, Some(40.0));
        assert_eq!(scraped.waiting_requests, Some(3.0));
    }

    #[test]
    fn test_delta_average_between_scrapes() {
        let pod = test_pod(Engine::Vllm);

        apply_scrape(
            &pod,
            &ScrapedMetrics {
                ttft_sum: Some(10.0),
                ttft_count: Some(100.0),
                ..Default::default()
            },
        );
        // First scrape has no previous baseline: average over everything.
        assert!((pod.metrics_snapshot().time_to_first_token - 0.1).abs() < 1e-9);

        apply_scrape(
            &pod,
            &ScrapedMetrics {
                ttft_sum: Some(16.0),
                ttft_count: Some(120.0),
                ..Default::default()
            },
        );
        // (16 - 10) / (120 - 100) = 0.3
        assert!((pod.metrics_snapshot().time_to_first_token - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_zero_delta_count_retains_previous_value() {
        let pod = test_pod(Engine::Vllm);
        apply_scrape(
            &pod,
            &ScrapedMetrics {
                tpot_sum: Some(4.0),
                tpot_count: Some(200.0),
                ..Default::default()
            },
        );
        let before = pod.metrics_snapshot().time_per_output_token;

        apply_scrape(
            &pod,
            &ScrapedMetrics {
                tpot_sum: Some(4.0),
                tpot_count: Some(200.0),
                ..Default::default()
            },
        );
        assert_eq!(pod.metrics_snapshot().time_per_output_token, before);
    }

    #[test]
    fn test_count_reset_after_restart_retains_value() {
        let pod = test_pod(Engine::Vllm);
        apply_scrape(
            &pod,
            &ScrapedMetrics {
                ttft_sum: Some(12.0),
                ttft_count: Some(100.0),
                ..Default::default()
            },
        );
        let before = pod.metrics_snapshot().time_to_first_token;

        apply_scrape(
            &pod,
            &ScrapedMetrics {
                ttft_sum: Some(0.5),
                ttft_count: Some(5.0),
                ..Default::default()
            },
        );
        let snapshot = pod.metrics_snapshot();
        assert_eq!(snapshot.time_to_first_token, before);
        // The raw baseline resets so the next delta is computed correctly.
        assert_eq!(snapshot.ttft_count, 5);
    }

    #[test]
    fn test_missing_families_leave_snapshot_stale() {
        let pod = test_pod(Engine::Vllm);
        apply_scrape(
            &pod,
            &ScrapedMetrics {
                gpu_cache_usage: Some(0.9),
                waiting_requests: Some(7.0),
                ..Default::default()
            },
        );
        apply_scrape(&pod, &ScrapedMetrics::default());

        let snapshot = pod.metrics_snapshot();
        assert_eq!(snapshot.gpu_cache_usage, 0.9);
        assert_eq!(snapshot.waiting_requests, 7);
    }

    #[test]
    fn test_sample_line_splitting() {
        assert_eq!(
            split_sample(r#"vllm:num_request_waiting{model="a b"} 3"#),
            Some((r#"vllm:num_request_waiting{model="a b"}"#, "3"))
        );
        assert_eq!(
            split_sample("sglang:token_usage 0.5 1700000000"),
            Some(("sglang:token_usage", "0.5"))
        );
        assert_eq!(split_sample("garbage"), None);
    }
}
