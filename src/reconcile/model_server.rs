use std::sync::Arc;

use futures::StreamExt;
use kube::Api;
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::crd::ModelServer;
use crate::datastore::{Datastore, object_key};

use super::{ReconcileError, RetryTracker, clear_finalizer, has_finalizer, requeue_or_drop, set_finalizer};

struct ReconcileContext {
    client: Client,
    store: Arc<Datastore>,
    retries: RetryTracker,
}

/// Reconcile ModelServers cluster-wide into the datastore.
pub async fn run(client: Client, store: Arc<Datastore>) {
    let servers: Api<ModelServer> = Api::all(client.clone());
    let ctx = Arc::new(ReconcileContext {
        client,
        store,
        retries: RetryTracker::default(),
    });

    info!("model_server_reconciler_started");
    Controller::new(servers, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async {
            if let Err(error) = result {
                warn!(error = %error, "model_server_dispatch_error");
            }
        })
        .await;
}

async fn reconcile(
    server: Arc<ModelServer>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = server.namespace().unwrap_or_default();
    let name = server.name_any();
    let key = object_key(&namespace, &name);
    let api: Api<ModelServer> = Api::namespaced(ctx.client.clone(), &namespace);

    if server.metadata.deletion_timestamp.is_some() {
        ctx.store.delete_model_server(&key);
        ctx.retries.reset(&key);
        if has_finalizer(server.metadata.finalizers.as_deref()) {
            clear_finalizer(&api, &name).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(server.metadata.finalizers.as_deref()) {
        set_finalizer(&api, &name).await?;
    }

    ctx.store
        .add_or_update_model_server(&namespace, &name, server.spec.clone())?;
    ctx.retries.reset(&key);
    Ok(Action::await_change())
}

fn error_policy(
    server: Arc<ModelServer>,
    error: &ReconcileError,
    ctx: Arc<ReconcileContext>,
) -> Action {
    let key = object_key(&server.namespace().unwrap_or_default(), &server.name_any());
    requeue_or_drop(&ctx.retries, "ModelServer", &key, error)
}
