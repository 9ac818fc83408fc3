//! Reconciliation core
//!
//! One logical reconciliation worker per VirtualServer key: work for
//! independent hosts runs concurrently, work for the same key is strictly
//! serialized, and a stale reconciliation never applies its output after a
//! newer one (generation tickets). Every decision point reports through
//! the event reporter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config_params::{parse_config_map, ConfigParams, ParamsHolder};
use crate::crd::{ResourceKey, VirtualServer, VirtualServerRoute};
use crate::error::{Error, Result};
use crate::events::{object_ref, EventReporter};
use crate::metrics::Metrics;
use crate::reload::ProxyManager;
use crate::renderer::render;
use crate::resolver::{endpoints_key, resolve, VirtualServerEx};
use crate::store::{referenced_route_keys, Store};
use crate::validation::{
    validate_virtual_server, validate_virtual_server_route,
    validate_virtual_server_route_for_virtual_server, ValidationErrors,
};

/// How many hosts a fan-out reconciles concurrently
const FAN_OUT_CONCURRENCY: usize = 8;

/// Result of reconciling one host
#[derive(Clone, Debug)]
pub enum ReconcileOutcome {
    /// Configuration applied; `warnings` counts dropped branches
    Applied { warnings: usize },
    /// Rendered but the proxy refused it; previous configuration stays live
    NotApplied(String),
    /// The resource is invalid; previous configuration stays live
    Rejected(ValidationErrors),
    /// No artifact exists for this host
    Removed,
    /// A newer reconciliation superseded this one before apply
    Stale,
}

/// Result of reconciling a VirtualServerRoute object
#[derive(Clone, Debug)]
pub enum RouteOutcome {
    /// Referenced by that many VirtualServers
    Valid { referencing_hosts: usize },
    Invalid(ValidationErrors),
    /// No VirtualServer references this route
    Orphan,
}

struct HostState {
    generation: AtomicU64,
    lock: Mutex<()>,
}

/// A delegated branch excluded from the route tree
struct BranchError {
    key: ResourceKey,
    route: Option<Arc<VirtualServerRoute>>,
    reason: String,
}

pub struct Reconciler {
    store: Arc<Store>,
    params: Arc<ParamsHolder>,
    proxy: Arc<dyn ProxyManager>,
    reporter: Arc<EventReporter>,
    metrics: Arc<Metrics>,
    hosts: Mutex<HashMap<ResourceKey, Arc<HostState>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        params: Arc<ParamsHolder>,
        proxy: Arc<dyn ProxyManager>,
        reporter: Arc<EventReporter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            params,
            proxy,
            reporter,
            metrics,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn reporter(&self) -> &Arc<EventReporter> {
        &self.reporter
    }

    async fn host_state(&self, key: &ResourceKey) -> Arc<HostState> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(HostState {
                    generation: AtomicU64::new(0),
                    lock: Mutex::new(()),
                })
            })
            .clone()
    }

    // ------------------------------------------------------------------
    // VirtualServer
    // ------------------------------------------------------------------

    pub async fn upsert_virtual_server(&self, vs: VirtualServer) -> Result<ReconcileOutcome> {
        let key = ResourceKey::from_object(&vs);
        self.store.upsert_virtual_server(vs).await;
        let outcome = self.reconcile_host(&key).await;
        self.metrics
            .set_managed_hosts(self.store.virtual_server_count().await as i64);
        outcome
    }

    /// Delete cascade: the host's artifact is removed entirely and its
    /// formerly referenced routes are re-checked for orphanhood.
    pub async fn delete_virtual_server(&self, key: &ResourceKey) -> Result<()> {
        let Some(vs) = self.store.remove_virtual_server(key).await else {
            return Ok(());
        };

        info!(host = %key, "deleting configuration for VirtualServer");
        if let Err(err) = self.proxy.delete(key).await {
            self.metrics.record_reload_error();
            warn!(host = %key, error = %err, "failed to remove configuration");
        }

        for route_key in referenced_route_keys(&vs) {
            let Some(vsr) = self.store.route(&route_key).await else {
                continue;
            };
            if self
                .store
                .virtual_servers_referencing_route(&route_key)
                .await
                .is_empty()
            {
                self.reporter
                    .orphan_route(&object_ref(&*vsr), &route_key)
                    .await;
            }
        }

        self.metrics
            .set_managed_hosts(self.store.virtual_server_count().await as i64);
        Ok(())
    }

    // ------------------------------------------------------------------
    // VirtualServerRoute
    // ------------------------------------------------------------------

    pub async fn upsert_virtual_server_route(
        &self,
        vsr: VirtualServerRoute,
    ) -> Result<RouteOutcome> {
        let key = ResourceKey::from_object(&vsr);
        let vsr = self.store.upsert_route(vsr).await;

        let validation = validate_virtual_server_route(&vsr);
        if let Err(errors) = &validation {
            self.reporter
                .rejected(&object_ref(&*vsr), "VirtualServerRoute", &key, errors)
                .await;
        }

        let referencing = self.store.virtual_servers_referencing_route(&key).await;
        if referencing.is_empty() {
            self.reporter.orphan_route(&object_ref(&*vsr), &key).await;
        }

        for vs in &referencing {
            let vs_key = ResourceKey::from_object(vs.as_ref());
            if let Err(err) = self.reconcile_host(&vs_key).await {
                warn!(host = %vs_key, error = %err, "reconciliation failed");
            }
        }

        Ok(match validation {
            Err(errors) => RouteOutcome::Invalid(errors),
            Ok(()) if referencing.is_empty() => RouteOutcome::Orphan,
            Ok(()) => RouteOutcome::Valid {
                referencing_hosts: referencing.len(),
            },
        })
    }

    pub async fn delete_virtual_server_route(&self, key: &ResourceKey) -> Result<()> {
        self.store.remove_route(key).await;

        for vs in self.store.virtual_servers_referencing_route(key).await {
            let vs_key = ResourceKey::from_object(vs.as_ref());
            if let Err(err) = self.reconcile_host(&vs_key).await {
                warn!(host = %vs_key, error = %err, "reconciliation failed");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // ConfigMap defaults
    // ------------------------------------------------------------------

    /// Apply a new defaults ConfigMap. An invalid update is rejected as a
    /// whole and the previous snapshot stays live.
    pub async fn apply_config_map(&self, cm: &ConfigMap) -> Result<()> {
        let key = ResourceKey::from_object(cm);

        match parse_config_map(cm) {
            Err(errors) => {
                let reason = errors.join("; ");
                warn!(configmap = %key, %reason, "rejecting ConfigMap update");
                self.reporter
                    .not_applied(&object_ref(cm), &key, &reason)
                    .await;
                Ok(())
            }
            Ok(params) => {
                let version = self.params.swap(params).await;
                self.metrics.set_config_params_version(version);
                info!(configmap = %key, version, "applied new configuration defaults");
                self.reporter.added_or_updated(&object_ref(cm), &key).await;
                self.reconcile_all_hosts().await;
                Ok(())
            }
        }
    }

    /// Revert to built-in defaults when the ConfigMap is deleted.
    pub async fn reset_config_params(&self) -> Result<()> {
        let version = self.params.swap(ConfigParams::default()).await;
        self.metrics.set_config_params_version(version);
        info!(version, "ConfigMap deleted, reverting to built-in defaults");
        self.reconcile_all_hosts().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dependent objects
    // ------------------------------------------------------------------

    pub async fn service_changed(&self, namespace: &str, service: &str) {
        let hosts = self
            .store
            .virtual_servers_referencing_service(namespace, service)
            .await;
        if !hosts.is_empty() {
            debug!(
                service = %format!("{}/{}", namespace, service),
                hosts = hosts.len(),
                "endpoints changed, re-resolving"
            );
        }
        self.reconcile_hosts(hosts).await;
    }

    pub async fn secret_changed(&self, namespace: &str, secret: &str) {
        let hosts = self
            .store
            .virtual_servers_referencing_secret(namespace, secret)
            .await;
        self.reconcile_hosts(hosts).await;
    }

    /// Re-resolve every live host, concurrently across keys but still
    /// serialized per key.
    pub async fn reconcile_all_hosts(&self) {
        let keys = self.store.live_host_keys().await;
        self.reconcile_hosts(keys).await;
    }

    async fn reconcile_hosts(&self, keys: Vec<ResourceKey>) {
        futures::stream::iter(keys)
            .for_each_concurrent(FAN_OUT_CONCURRENCY, |key| async move {
                if let Err(err) = self.reconcile_host(&key).await {
                    warn!(host = %key, error = %err, "reconciliation failed");
                }
            })
            .await;
    }

    // ------------------------------------------------------------------
    // The reconciliation pass
    // ------------------------------------------------------------------

    /// Run one reconciliation pass for a host key.
    ///
    /// Fail-static on both invalid resources and reload failures: the last
    /// successfully applied artifact stays live, and only the next
    /// triggering change retries.
    pub async fn reconcile_host(&self, key: &ResourceKey) -> Result<ReconcileOutcome> {
        let state = self.host_state(key).await;
        let ticket = state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = state.lock.lock().await;

        let snapshot = self.params.current().await;

        let Some(vs) = self.store.virtual_server(key).await else {
            if let Err(err) = self.proxy.delete(key).await {
                self.metrics.record_reload_error();
                warn!(host = %key, error = %err, "failed to remove configuration");
            }
            return Ok(ReconcileOutcome::Removed);
        };
        let vs_ref = object_ref(vs.as_ref());

        if let Err(errors) = validate_virtual_server(&vs) {
            self.reporter
                .rejected(&vs_ref, "VirtualServer", key, &errors)
                .await;
            return Ok(ReconcileOutcome::Rejected(errors));
        }

        let (vs_ex, branch_errors) = self.build_virtual_server_ex(&vs).await;

        for branch in &branch_errors {
            self.reporter
                .ignored_route(&vs_ref, &branch.key, &branch.reason)
                .await;
            if let Some(vsr) = &branch.route {
                self.reporter
                    .ignored_by(&object_ref(vsr.as_ref()), key)
                    .await;
            }
        }

        let resolution = resolve(&vs_ex, &snapshot.params);

        for warning in &resolution.warnings {
            if let Some(route_key) = &warning.route {
                self.reporter
                    .ignored_route(&vs_ref, route_key, &warning.reason)
                    .await;
                if let Some(vsr) = self.store.route(route_key).await {
                    self.reporter
                        .ignored_by(&object_ref(vsr.as_ref()), key)
                        .await;
                }
            }
        }

        let Some(config) = resolution.config else {
            debug!(host = %key, "no resolvable routes, removing artifact");
            if let Err(err) = self.proxy.delete(key).await {
                self.metrics.record_reload_error();
                warn!(host = %key, error = %err, "failed to remove configuration");
            }
            return Ok(ReconcileOutcome::Removed);
        };

        let artifact = render(&config);

        // a newer change for this key arrived while we were resolving;
        // discard this output instead of applying it out of order
        if state.generation.load(Ordering::SeqCst) != ticket {
            debug!(host = %key, "discarding stale reconciliation output");
            return Ok(ReconcileOutcome::Stale);
        }

        let start = Instant::now();
        match self.proxy.apply(&[(key.clone(), artifact)]).await {
            Ok(report) => {
                if report.reloaded {
                    self.metrics.record_reload(start.elapsed().as_secs_f64());
                }
                self.reporter.added_or_updated(&vs_ref, key).await;
                for vsr in &vs_ex.routes {
                    let vsr_key = ResourceKey::from_object(vsr);
                    self.reporter
                        .added_or_updated(&object_ref(vsr), &vsr_key)
                        .await;
                }
                Ok(ReconcileOutcome::Applied {
                    warnings: branch_errors.len() + resolution.warnings.len(),
                })
            }
            Err(Error::ReloadFailed(reason)) => {
                self.metrics.record_reload_error();
                self.reporter.not_applied(&vs_ref, key, &reason).await;
                for vsr in &vs_ex.routes {
                    let vsr_key = ResourceKey::from_object(vsr);
                    self.reporter
                        .not_applied(&object_ref(vsr), &vsr_key, &reason)
                        .await;
                }
                Ok(ReconcileOutcome::NotApplied(reason))
            }
            Err(err) => Err(err),
        }
    }

    /// Gather everything a host references: delegated routes (validated in
    /// the host's context), endpoint addresses and the TLS secret file.
    async fn build_virtual_server_ex(
        &self,
        vs: &VirtualServer,
    ) -> (VirtualServerEx, Vec<BranchError>) {
        let vs_key = ResourceKey::from_object(vs);
        let mut endpoints = HashMap::new();
        let mut routes = Vec::new();
        let mut branch_errors = Vec::new();

        for u in &vs.spec.upstreams {
            endpoints.insert(
                endpoints_key(&vs_key.namespace, &u.service, u.port),
                self.store
                    .addresses_for(&vs_key.namespace, &u.service, u.port)
                    .await,
            );
        }

        for route in &vs.spec.routes {
            let Some(target) = &route.route else {
                continue;
            };
            let route_key = ResourceKey::parse(target, &vs_key.namespace);

            let Some(vsr) = self.store.route(&route_key).await else {
                branch_errors.push(BranchError {
                    key: route_key,
                    route: None,
                    reason: "VirtualServerRoute doesn't exist".to_string(),
                });
                continue;
            };

            if let Err(errors) = validate_virtual_server_route_for_virtual_server(
                &vsr,
                &vs.spec.host,
                &route.path,
            ) {
                branch_errors.push(BranchError {
                    key: route_key,
                    route: Some(vsr),
                    reason: errors.to_string(),
                });
                continue;
            }

            for u in &vsr.spec.upstreams {
                endpoints.insert(
                    endpoints_key(&route_key.namespace, &u.service, u.port),
                    self.store
                        .addresses_for(&route_key.namespace, &u.service, u.port)
                        .await,
                );
            }
            routes.push(vsr.as_ref().clone());
        }

        let tls_cert_file = self.resolve_tls_secret(vs, &vs_key).await;

        (
            VirtualServerEx {
                virtual_server: vs.clone(),
                routes,
                endpoints,
                tls_cert_file,
            },
            branch_errors,
        )
    }

    /// Write the referenced TLS secret as a PEM file for the renderer. A
    /// missing or malformed secret degrades to the placeholder certificate
    /// rather than rejecting the host.
    async fn resolve_tls_secret(
        &self,
        vs: &VirtualServer,
        vs_key: &ResourceKey,
    ) -> Option<String> {
        let tls = vs.spec.tls.as_ref()?;
        if tls.secret.is_empty() {
            return None;
        }

        let secret_key = ResourceKey::new(vs_key.namespace.clone(), tls.secret.clone());
        let Some(secret) = self.store.secret(&secret_key).await else {
            warn!(host = %vs_key, secret = %secret_key, "TLS secret not found");
            return None;
        };

        if secret.type_.as_deref() != Some("kubernetes.io/tls") {
            warn!(host = %vs_key, secret = %secret_key, "secret is not a TLS secret");
            return None;
        }

        let data = secret.data.as_ref()?;
        let (cert, secret_file_key) = match (data.get("tls.crt"), data.get("tls.key")) {
            (Some(cert), Some(key)) => {
                let mut pem = cert.0.clone();
                pem.extend_from_slice(&key.0);
                (pem, format!("{}_{}", secret_key.namespace, secret_key.name))
            }
            _ => {
                warn!(host = %vs_key, secret = %secret_key, "secret is missing tls.crt or tls.key");
                return None;
            }
        };

        match self.proxy.write_secret(&secret_file_key, &cert).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(host = %vs_key, secret = %secret_key, error = %err, "failed to write secret");
                None
            }
        }
    }
}
