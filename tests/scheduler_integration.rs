mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{pod, pool};
use infergate::config::{PluginConfig, PrefixCacheConfig, SchedulerConfig};
use infergate::crd::PdGroup;
use infergate::datastore::Datastore;
use infergate::scheduler::{PrefixCacheStore, Scheduler, SchedulingContext, SchedulingDecision};

// ══════════════════════════════════════════════════════════════════
// Scheduler integration tests (no cluster required)
//
// Runs the real pipeline over datastore-produced candidates: load
// balancing, prefix affinity across consecutive requests, PD pairing.
// ══════════════════════════════════════════════════════════════════

fn pipeline(plugins: &[(&str, u32)]) -> (Scheduler, Arc<PrefixCacheStore>) {
    let config = SchedulerConfig {
        plugins: plugins
            .iter()
            .map(|(name, weight)| PluginConfig::new(name, *weight))
            .collect(),
        prefix_cache: PrefixCacheConfig {
            block_size: 4,
            ..Default::default()
        },
        ..Default::default()
    };
    let store = Arc::new(PrefixCacheStore::new(config.prefix_cache.clone()));
    (
        Scheduler::from_config(&config, store.clone()).unwrap(),
        store,
    )
}

fn fleet(store: &Datastore, count: usize) {
    store
        .add_or_update_model_server("default", "pool-a", pool("a", 8000))
        .unwrap();
    for i in 0..count {
        store.add_or_update_pod(pod(&format!("a-{i}"), &format!("10.0.0.{i}"), &[("app", "a")]));
    }
}

#[test]
fn test_prefix_affinity_sticks_across_requests() {
    let (scheduler, _) = pipeline(&[("prefix-cache", 1)]);
    let store = Datastore::new();
    fleet(&store, 4);

    let prompt = "You are a helpful assistant. Summarize the following text.";
    let ctx = SchedulingContext::new("m1", prompt, false);
    let first = scheduler
        .select(&ctx, store.pods_by_model_server("default/pool-a"))
        .unwrap();

    // The same prompt keeps landing on the warmed pod.
    for _ in 0..5 {
        let ctx = SchedulingContext::new("m1", prompt, false);
        let again = scheduler
            .select(&ctx, store.pods_by_model_server("default/pool-a"))
            .unwrap();
        assert_eq!(again.key, first.key);
    }

    // A shared prefix with a different tail still prefers the warm pod.
    let ctx = SchedulingContext::new(
        "m1",
        "You are a helpful assistant. Translate the following text.",
        false,
    );
    let related = scheduler
        .select(&ctx, store.pods_by_model_server("default/pool-a"))
        .unwrap();
    assert_eq!(related.key, first.key);
}

#[test]
fn test_load_outweighs_affinity_when_weighted() {
    let (scheduler, prefix) = pipeline(&[("least-request", 10), ("prefix-cache", 1)]);
    let store = Datastore::new();
    fleet(&store, 2);

    let prompt = "repeated prompt for affinity";
    let hashes = prefix.hash_prompt("m1", prompt);
    prefix.record("m1", "default/a-0", &hashes);

    // Saturate the warm pod; heavy load must beat cache affinity.
    store
        .get_pod("default/a-0")
        .unwrap()
        .metrics
        .write()
        .waiting_requests = 20;

    let ctx = SchedulingContext::new("m1", prompt, false);
    let chosen = scheduler
        .select(&ctx, store.pods_by_model_server("default/pool-a"))
        .unwrap();
    assert_eq!(chosen.key, "default/a-1");
}

#[test]
fn test_filter_starvation_returns_unschedulable() {
    let (scheduler, _) = pipeline(&[("least-request", 1)]);
    let store = Datastore::new();
    fleet(&store, 2);

    for p in store.list_pods() {
        p.metrics.write().waiting_requests = 10_000;
    }

    let ctx = SchedulingContext::new("m1", "hello", false);
    let result = scheduler.select(&ctx, store.pods_by_model_server("default/pool-a"));
    assert!(result.is_err());
}

#[test]
fn test_pd_pairing_from_datastore_groups() {
    let (scheduler, _) = pipeline(&[("least-request", 1)]);
    let store = Datastore::new();

    let mut spec = pool("pd", 8000);
    spec.pd_group = Some(PdGroup {
        key: "pd-group".to_string(),
        prefill_selector: BTreeMap::from([("role".to_string(), "prefill".to_string())]),
        decode_selector: BTreeMap::from([("role".to_string(), "decode".to_string())]),
    });
    store
        .add_or_update_model_server("default", "pd-pool", spec)
        .unwrap();

    for (name, role, group, ip) in [
        ("p-g1", "prefill", "g1", "10.0.1.1"),
        ("d-g1", "decode", "g1", "10.0.1.2"),
        ("p-g2", "prefill", "g2", "10.0.2.1"),
        ("d-g2", "decode", "g2", "10.0.2.2"),
    ] {
        store.add_or_update_pod(pod(
            name,
            ip,
            &[("app", "pd"), ("role", role), ("pd-group", group)],
        ));
    }

    // Load up everything in g1 so g2 wins.
    store.get_pod("default/p-g1").unwrap().metrics.write().waiting_requests = 50;
    store.get_pod("default/d-g1").unwrap().metrics.write().waiting_requests = 50;

    let mut ctx = SchedulingContext::new("m1", "hello world", false);
    let groups = store.pd_pods_by_group("default/pd-pool");
    let decision = scheduler.select_pd(&mut ctx, &groups).unwrap();

    match decision {
        SchedulingDecision::PrefillDecode {
            group_value,
            prefill,
            decode,
        } => {
            assert_eq!(group_value, "g2");
            assert_eq!(prefill.key, "default/p-g2");
            assert_eq!(decode.key, "default/d-g2");
        }
        SchedulingDecision::Single(_) => panic!("expected a PD pair"),
    }
}

#[test]
fn test_latency_scores_follow_metric_snapshots() {
    let (scheduler, _) = pipeline(&[("least-latency", 1)]);
    let store = Datastore::new();
    fleet(&store, 3);

    for (key, ttft, tpot) in [
        ("default/a-0", 0.8, 0.20),
        ("default/a-1", 0.1, 0.02),
        ("default/a-2", 0.4, 0.10),
    ] {
        let p = store.get_pod(key).unwrap();
        let mut m = p.metrics.write();
        m.time_to_first_token = ttft;
        m.time_per_output_token = tpot;
    }

    let ctx = SchedulingContext::new("m1", "hello", false);
    let chosen = scheduler
        .select(&ctx, store.pods_by_model_server("default/pool-a"))
        .unwrap();
    assert_eq!(chosen.key, "default/a-1");
}
