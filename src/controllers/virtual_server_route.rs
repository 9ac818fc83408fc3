//! VirtualServerRoute controller
//!
//! Keeps the route store current and re-reconciles every VirtualServer
//! that delegates to the changed route. Orphan routes are reported, not
//! failed.

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

use crate::crd::{
    ResourceKey, ResourceState, VirtualServerRoute, VirtualServerStatus, FIELD_MANAGER, FINALIZER,
};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, ReconciliationTimer};
use crate::sync::{Reconciler, RouteOutcome};

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

/// Reconcile a VirtualServerRoute resource
pub async fn reconcile(
    vsr: Arc<VirtualServerRoute>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, Error> {
    let name = vsr.name_any();
    let namespace = vsr.namespace().unwrap_or_else(|| "default".to_string());

    info!(
        "Reconciling VirtualServerRoute {}/{} (generation: {:?})",
        namespace, name, vsr.metadata.generation
    );

    let timer = ReconciliationTimer::new(&ctx.metrics, "VirtualServerRoute", &namespace);

    let api: Api<VirtualServerRoute> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, FINALIZER, vsr, |event| async {
        match event {
            FinalizerEvent::Apply(vsr) => reconcile_apply(&vsr, &ctx, &namespace, &name).await,
            FinalizerEvent::Cleanup(vsr) => reconcile_cleanup(&vsr, &ctx).await,
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
    vsr: &VirtualServerRoute,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let outcome = ctx
        .reconciler
        .upsert_virtual_server_route(vsr.clone())
        .await?;

    update_status(
        &ctx.client,
        namespace,
        name,
        status_for_outcome(&outcome, vsr.metadata.generation),
    )
    .await?;

    Ok(Action::await_change())
}

async fn reconcile_cleanup(vsr: &VirtualServerRoute, ctx: &Context) -> Result<Action> {
    let key = ResourceKey::from_object(vsr);
    info!("Cleaning up VirtualServerRoute {}", key);

    ctx.reconciler.delete_virtual_server_route(&key).await?;

    Ok(Action::await_change())
}

fn status_for_outcome(
    outcome: &RouteOutcome,
    observed_generation: Option<i64>,
) -> VirtualServerStatus {
    let (state, reason, message) = match outcome {
        RouteOutcome::Valid { referencing_hosts } => (
            ResourceState::Valid,
            "AddedOrUpdated",
            format!("Referenced by {} VirtualServer(s)", referencing_hosts),
        ),
        RouteOutcome::Invalid(errors) => {
            (ResourceState::Invalid, "Rejected", errors.to_string())
        }
        RouteOutcome::Orphan => (
            ResourceState::Warning,
            "NoVirtualServersFound",
            "No VirtualServer references this resource".to_string(),
        ),
    };

    VirtualServerStatus {
        state,
        reason: reason.to_string(),
        message,
        observed_generation,
    }
}

/// Update the status subresource of a VirtualServerRoute
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: VirtualServerStatus,
) -> Result<()> {
    let api: Api<VirtualServerRoute> = Api::namespaced(client.clone(), namespace);

    let patch = serde_json::json!({ "status": status });

    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(Error::Kube)?;

    Ok(())
}

/// Error policy for the controller
pub fn error_policy(vsr: Arc<VirtualServerRoute>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = vsr.name_any();
    let namespace = vsr.namespace().unwrap_or_default();

    warn!(
        "Reconciliation error for VirtualServerRoute {}/{}: {:?}",
        namespace, name, error
    );

    if error.is_permanent() {
        Action::await_change()
    } else {
        Action::requeue(error.retry_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_for_orphan() {
        let status = status_for_outcome(&RouteOutcome::Orphan, Some(1));
        assert_eq!(status.state, ResourceState::Warning);
        assert_eq!(status.reason, "NoVirtualServersFound");
    }

    #[test]
    fn test_status_for_valid() {
        let status = status_for_outcome(&RouteOutcome::Valid { referencing_hosts: 1 }, Some(2));
        assert_eq!(status.state, ResourceState::Valid);
        assert_eq!(status.observed_generation, Some(2));
    }
}
