//! VirtualServer controller
//!
//! Watches VirtualServer resources, keeps the store current, runs the
//! reconciliation core for the host key and patches the resource status.

use std::sync::Arc;

use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    Client, ResourceExt,
};
use tracing::{info, warn};

use crate::crd::{ResourceKey, ResourceState, VirtualServer, VirtualServerStatus, FIELD_MANAGER, FINALIZER};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, ReconciliationTimer};
use crate::sync::{ReconcileOutcome, Reconciler};

/// Context shared across reconciliation calls
pub struct Context {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(client: Client, reconciler: Arc<Reconciler>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            reconciler,
            metrics,
        }
    }
}

/// Reconcile a VirtualServer resource
pub async fn reconcile(
    vs: Arc<VirtualServer>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, Error> {
    let name = vs.name_any();
    let namespace = vs.namespace().unwrap_or_else(|| "default".to_string());

    info!(
        "Reconciling VirtualServer {}/{} (generation: {:?})",
        namespace, name, vs.metadata.generation
    );

    let timer = ReconciliationTimer::new(&ctx.metrics, "VirtualServer", &namespace);

    let api: Api<VirtualServer> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, FINALIZER, vs, |event| async {
        match event {
            FinalizerEvent::Apply(vs) => reconcile_apply(&vs, &ctx, &namespace, &name).await,
            FinalizerEvent::Cleanup(vs) => reconcile_cleanup(&vs, &ctx).await,
        }
    })
    .await;

    match result {
        Ok(action) => {
            timer.success();
            Ok(action)
        }
        Err(e) => {
            let error = match e {
                kube::runtime::finalizer::Error::ApplyFailed(e) => e,
                kube::runtime::finalizer::Error::CleanupFailed(e) => e,
                kube::runtime::finalizer::Error::AddFinalizer(e) => Error::Kube(e),
                kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::Kube(e),
                kube::runtime::finalizer::Error::UnnamedObject => {
                    Error::permanent("Resource has no name")
                }
            };
            timer.error(error.category());
            Err(error)
        }
    }
}

async fn reconcile_apply(
    vs: &VirtualServer,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let outcome = ctx.reconciler.upsert_virtual_server(vs.clone()).await?;

    if let Some(status) = status_for_outcome(&outcome, vs.metadata.generation) {
        update_status(&ctx.client, namespace, name, status).await?;
    }

    Ok(Action::await_change())
}

async fn reconcile_cleanup(vs: &VirtualServer, ctx: &Context) -> Result<Action> {
    let key = ResourceKey::from_object(vs);
    info!("Cleaning up VirtualServer {}", key);

    ctx.reconciler.delete_virtual_server(&key).await?;

    Ok(Action::await_change())
}

fn status_for_outcome(
    outcome: &ReconcileOutcome,
    observed_generation: Option<i64>,
) -> Option<VirtualServerStatus> {
    let (state, reason, message) = match outcome {
        ReconcileOutcome::Applied { warnings: 0 } => (
            ResourceState::Valid,
            "AddedOrUpdated",
            "Configuration was added or updated".to_string(),
        ),
        ReconcileOutcome::Applied { warnings } => (
            ResourceState::Warning,
            "AddedOrUpdatedWithWarnings",
            format!("Configuration was added or updated; {} branch(es) ignored", warnings),
        ),
        ReconcileOutcome::NotApplied(reason) => (
            ResourceState::Warning,
            "AddedOrUpdatedWithError",
            format!("Configuration was updated but was not applied: {}", reason),
        ),
        ReconcileOutcome::Rejected(errors) => (
            ResourceState::Invalid,
            "Rejected",
            errors.to_string(),
        ),
        ReconcileOutcome::Removed => (
            ResourceState::Invalid,
            "NoResolvableRoutes",
            "No routes could be resolved; configuration was removed".to_string(),
        ),
        ReconcileOutcome::Stale => return None,
    };

    Some(VirtualServerStatus {
        state,
        reason: reason.to_string(),
        message,
        observed_generation,
    })
}

/// Update the status subresource of a VirtualServer
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: VirtualServerStatus,
) -> Result<()> {
    let api: Api<VirtualServer> = Api::namespaced(client.clone(), namespace);

    let patch = serde_json::json!({ "status": status });

    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(Error::Kube)?;

    Ok(())
}

/// Error policy for the controller
pub fn error_policy(vs: Arc<VirtualServer>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = vs.name_any();
    let namespace = vs.namespace().unwrap_or_default();

    warn!(
        "Reconciliation error for VirtualServer {}/{}: {:?}",
        namespace, name, error
    );

    if error.is_permanent() {
        Action::await_change()
    } else {
        Action::requeue(error.retry_delay())
    }
}
