//! Routegate Kubernetes controller
//!
//! Watches VirtualServer and VirtualServerRoute resources, resolves them
//! into a validated configuration model, renders one proxy configuration
//! file per virtual host and reloads the proxy process. Status events are
//! emitted at every decision point.

use anyhow::{Context as AnyhowContext, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{controller::Controller, events::Reporter, watcher::Config as WatcherConfig},
    Client, CustomResourceExt, Resource,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use routegate_controller::config_params::ParamsHolder;
use routegate_controller::controllers;
use routegate_controller::crd::{ResourceKey, VirtualServer, VirtualServerRoute};
use routegate_controller::events::{EventReporter, KubeEventSink};
use routegate_controller::metrics::Metrics;
use routegate_controller::reload::LocalProxyManager;
use routegate_controller::store::Store;
use routegate_controller::sync::Reconciler;

/// Application state shared with the health server
struct AppState {
    ready: AtomicBool,
    healthy: AtomicBool,
    metrics: Arc<Metrics>,
}

/// Configuration for the controller process
#[derive(Clone, Debug)]
struct OperatorConfig {
    /// Namespace to watch (empty for all namespaces)
    namespace: Option<String>,
    /// `namespace/name` of the global defaults ConfigMap
    config_map: ResourceKey,
    /// Base directory for proxy configuration and secrets
    proxy_conf_path: String,
    /// Proxy binary used for config test and reload
    proxy_binary: String,
    /// Health/metrics server address
    health_addr: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let config_map = std::env::var("CONFIG_MAP")
            .unwrap_or_else(|_| "routegate-system/routegate-config".to_string());

        Self {
            namespace: std::env::var("WATCH_NAMESPACE").ok(),
            config_map: ResourceKey::parse(&config_map, "routegate-system"),
            proxy_conf_path: std::env::var("PROXY_CONF_PATH")
                .unwrap_or_else(|_| "/etc/proxy".to_string()),
            proxy_binary: std::env::var("PROXY_BINARY").unwrap_or_else(|_| "nginx".to_string()),
            health_addr: std::env::var("HEALTH_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate_controller=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("tower=warn".parse()?),
        )
        .json()
        .with_current_span(true)
        .init();

    info!("Starting routegate controller");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = OperatorConfig::default();
    info!("Configuration loaded: {:?}", config);

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let metrics = Arc::new(Metrics::new());
    metrics.record_startup();

    let proxy = Arc::new(
        LocalProxyManager::new(&config.proxy_conf_path, config.proxy_binary.clone())
            .context("Failed to set up proxy configuration directories")?,
    );

    let store = Arc::new(Store::new());
    let params = Arc::new(ParamsHolder::new());

    let reporter = Reporter {
        controller: "routegate-controller".to_string(),
        instance: std::env::var("POD_NAME").ok(),
    };
    let sink = Arc::new(KubeEventSink::new(client.clone(), reporter));
    let event_reporter = Arc::new(EventReporter::new(sink, metrics.clone()));

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        params.clone(),
        proxy,
        event_reporter,
        metrics.clone(),
    ));

    let state = Arc::new(AppState {
        ready: AtomicBool::new(false),
        healthy: AtomicBool::new(true),
        metrics: metrics.clone(),
    });

    print_crd_info();

    // store-feeding watchers
    tokio::spawn(controllers::config_map::run(
        client.clone(),
        config.config_map.clone(),
        reconciler.clone(),
    ));
    tokio::spawn(controllers::endpoints::run(
        client.clone(),
        config.namespace.clone(),
        store.clone(),
        reconciler.clone(),
    ));
    tokio::spawn(controllers::secrets::run(
        client.clone(),
        config.namespace.clone(),
        store.clone(),
        reconciler.clone(),
    ));

    let vs_controller = start_virtual_server_controller(
        client.clone(),
        reconciler.clone(),
        metrics.clone(),
        &config,
    );
    let vsr_controller = start_virtual_server_route_controller(
        client.clone(),
        reconciler.clone(),
        metrics.clone(),
        &config,
    );

    let health_server = start_health_server(state.clone(), &config);

    state.ready.store(true, Ordering::SeqCst);
    info!("Controller is ready");

    tokio::select! {
        result = health_server => {
            if let Err(e) = result {
                error!("Health server error: {}", e);
            }
        }
        _ = vs_controller => {
            error!("VirtualServer controller exited unexpectedly");
        }
        _ = vsr_controller => {
            error!("VirtualServerRoute controller exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down controller");
    state.ready.store(false, Ordering::SeqCst);

    Ok(())
}

/// Start the VirtualServer controller
async fn start_virtual_server_controller(
    client: Client,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
    config: &OperatorConfig,
) {
    let api: Api<VirtualServer> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(controllers::virtual_server::Context::new(
        client, reconciler, metrics,
    ));

    info!("Starting VirtualServer controller");

    Controller::new(api, WatcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(
            controllers::virtual_server::reconcile,
            controllers::virtual_server::error_policy,
            ctx,
        )
        .for_each(|result| async {
            match result {
                Ok((obj, _action)) => {
                    info!("Reconciled VirtualServer: {}", obj.name);
                }
                Err(e) => {
                    error!("Reconciliation error: {:?}", e);
                }
            }
        })
        .await;
}

/// Start the VirtualServerRoute controller
async fn start_virtual_server_route_controller(
    client: Client,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
    config: &OperatorConfig,
) {
    let api: Api<VirtualServerRoute> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(controllers::virtual_server_route::Context::new(
        client, reconciler, metrics,
    ));

    info!("Starting VirtualServerRoute controller");

    Controller::new(api, WatcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(
            controllers::virtual_server_route::reconcile,
            controllers::virtual_server_route::error_policy,
            ctx,
        )
        .for_each(|result| async {
            match result {
                Ok((obj, _action)) => {
                    info!("Reconciled VirtualServerRoute: {}", obj.name);
                }
                Err(e) => {
                    error!("Reconciliation error: {:?}", e);
                }
            }
        })
        .await;
}

/// Start the health and metrics HTTP server
async fn start_health_server(state: Arc<AppState>, config: &OperatorConfig) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr: std::net::SocketAddr = config.health_addr.parse()?;
    info!("Starting health/metrics server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .context("Health server failed")?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
    }
}

async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Ready")
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let output = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        output,
    )
}

/// Print CRD information for debugging
fn print_crd_info() {
    info!("Registered CRDs:");
    info!(
        "  - {}/{}",
        VirtualServer::group(&()),
        VirtualServer::kind(&())
    );
    info!(
        "  - {}/{}",
        VirtualServerRoute::group(&()),
        VirtualServerRoute::kind(&())
    );
}

/// Generate CRD YAML manifests (for installation)
#[allow(dead_code)]
fn generate_crds() -> String {
    let vs_crd = serde_yaml::to_string(&VirtualServer::crd()).unwrap_or_default();
    let vsr_crd = serde_yaml::to_string(&VirtualServerRoute::crd()).unwrap_or_default();

    format!("---\n{}\n---\n{}", vs_crd, vsr_crd)
}

#[cfg(test)]
mod main_tests {
    use super::*;

    #[test]
    fn test_operator_config_default() {
        let config = OperatorConfig::default();
        assert_eq!(
            config.config_map,
            ResourceKey::new("routegate-system", "routegate-config")
        );
        assert_eq!(config.proxy_binary, "nginx");
    }

    #[test]
    fn test_generate_crds() {
        let crds = generate_crds();
        assert!(crds.contains("VirtualServer"));
        assert!(crds.contains("VirtualServerRoute"));
        assert!(crds.contains("routegate.io"));
    }
}
