use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::datastore::{Datastore, PodSeed, object_key};

/// Annotation listing the models a replica serves, comma-separated.
pub const MODELS_ANNOTATION: &str = "gateway.infergate.dev/models";

/// Watch Pods cluster-wide and mirror the ready ones into the datastore.
///
/// A pod is in the datastore exactly while it is Ready, not terminating and
/// has an IP; every transition out of that state removes it. Which
/// ModelServers claim the pod is re-derived by the datastore on each apply,
/// so a server created after the pod still picks it up.
pub async fn run(client: Client, store: Arc<Datastore>) {
    let api: Api<Pod> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();

    info!("pod_reconciler_started");
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(pod)) => apply(&store, &pod),
            Ok(watcher::Event::Deleted(pod)) => {
                store.delete_pod(&pod_key(&pod));
            }
            Ok(watcher::Event::Restarted(pods)) => {
                info!(count = pods.len(), "pod_watch_resynced");
                for pod in pods {
                    apply(&store, &pod);
                }
            }
            Err(error) => warn!(error = %error, "pod_watch_error"),
        }
    }
}

fn pod_key(pod: &Pod) -> String {
    object_key(&pod.namespace().unwrap_or_default(), &pod.name_any())
}

fn apply(store: &Arc<Datastore>, pod: &Pod) {
    match project(pod) {
        Some(seed) => store.add_or_update_pod(seed),
        None => store.delete_pod(&pod_key(pod)),
    }
}

/// Project a cluster Pod into a datastore seed, or `None` when it must not
/// serve traffic.
fn project(pod: &Pod) -> Option<PodSeed> {
    if pod.metadata.deletion_timestamp.is_some() || !is_ready(pod) {
        return None;
    }
    let ip = pod.status.as_ref()?.pod_ip.clone()?;

    let models = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(MODELS_ANNOTATION))
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(PodSeed {
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        ip,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        models,
    })
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/* ============================= TESTS ============================= */
