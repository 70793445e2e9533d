use std::sync::Arc;

use futures::StreamExt;
use kube::Api;
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::crd::ModelRoute;
use crate::datastore::{Datastore, object_key};

use super::{ReconcileError, RetryTracker, clear_finalizer, has_finalizer, requeue_or_drop, set_finalizer};

struct ReconcileContext {
    client: Client,
    store: Arc<Datastore>,
    retries: RetryTracker,
}

/// Reconcile ModelRoutes cluster-wide into the datastore.
pub async fn run(client: Client, store: Arc<Datastore>) {
    let routes: Api<ModelRoute> = Api::all(client.clone());
    let ctx = Arc::new(ReconcileContext {
        client,
        store,
        retries: RetryTracker::default(),
    });

    info!("model_route_reconciler_started");
    Controller::new(routes, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async {
            if let Err(error) = result {
                warn!(error = %error, "model_route_dispatch_error");
            }
        })
        .await;
}

async fn reconcile(
    route: Arc<ModelRoute>,
    ctx: Arc<ReconcileContext>,
) -> Result<Action, ReconcileError> {
    let namespace = route.namespace().unwrap_or_default();
    let name = route.name_any();
    let key = object_key(&namespace, &name);
    let api: Api<ModelRoute> = Api::namespaced(ctx.client.clone(), &namespace);

    // The finalizer makes deletion observable: the object comes back once
    // with a deletion timestamp, the datastore entry goes with it.
    if route.metadata.deletion_timestamp.is_some() {
        ctx.store.delete_model_route(&key);
        ctx.retries.reset(&key);
        if has_finalizer(route.metadata.finalizers.as_deref()) {
            clear_finalizer(&api, &name).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(route.metadata.finalizers.as_deref()) {
        set_finalizer(&api, &name).await?;
    }

    ctx.store
        .add_or_update_model_route(&namespace, &name, route.spec.clone())?;
    ctx.retries.reset(&key);
    Ok(Action::await_change())
}

fn error_policy(
    route: Arc<ModelRoute>,
    error: &ReconcileError,
    ctx: Arc<ReconcileContext>,
) -> Action {
    let key = object_key(&route.namespace().unwrap_or_default(), &route.name_any());
    requeue_or_drop(&ctx.retries, "ModelRoute", &key, error)
}
