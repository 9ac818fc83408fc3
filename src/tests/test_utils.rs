//! Test utilities for reconciliation tests

use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
};
use kube::api::ObjectMeta;

use crate::config_params::ParamsHolder;
use crate::crd::{
    Route, Upstream, VirtualServer, VirtualServerRoute, VirtualServerRouteSpec, VirtualServerSpec,
};
use crate::events::{EventReporter, RecordingSink};
use crate::metrics::Metrics;
use crate::reload::FakeProxyManager;
use crate::store::Store;
use crate::sync::Reconciler;

/// Test configuration constants
pub mod constants {
    pub const TEST_NAMESPACE: &str = "default";
    pub const TEST_HOST: &str = "cafe.example.com";
}

/// Create object metadata for testing
pub fn test_metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(uuid::Uuid::new_v4().to_string()),
        generation: Some(1),
        ..Default::default()
    }
}

pub fn upstream(name: &str, service: &str) -> Upstream {
    Upstream {
        name: name.to_string(),
        service: service.to_string(),
        port: 80,
        ..Default::default()
    }
}

pub fn route_to(path: &str, upstream: &str) -> Route {
    Route {
        path: path.to_string(),
        upstream: Some(upstream.to_string()),
        ..Default::default()
    }
}

pub fn delegation(path: &str, target: &str) -> Route {
    Route {
        path: path.to_string(),
        route: Some(target.to_string()),
        ..Default::default()
    }
}

/// A VirtualServer with one upstream `tea` -> `tea-svc:80` and one route
/// `/tea`
pub fn test_virtual_server(name: &str) -> VirtualServer {
    VirtualServer {
        metadata: test_metadata(name, constants::TEST_NAMESPACE),
        spec: VirtualServerSpec {
            host: constants::TEST_HOST.to_string(),
            tls: None,
            upstreams: vec![upstream("tea", "tea-svc")],
            routes: vec![route_to("/tea", "tea")],
        },
        status: None,
    }
}

/// A VirtualServerRoute serving `/tea/green` from upstream `green`
pub fn test_virtual_server_route(name: &str) -> VirtualServerRoute {
    VirtualServerRoute {
        metadata: test_metadata(name, constants::TEST_NAMESPACE),
        spec: VirtualServerRouteSpec {
            host: constants::TEST_HOST.to_string(),
            upstreams: vec![upstream("green", "green-svc")],
            subroutes: vec![route_to("/tea/green", "green")],
        },
        status: None,
    }
}

pub fn test_endpoints(service: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: test_metadata(service, constants::TEST_NAMESPACE),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

pub fn test_config_map(entries: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: test_metadata("routegate-config", "routegate-system"),
        data: Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// A reconciler wired to in-memory doubles
pub struct Harness {
    pub store: Arc<Store>,
    pub params: Arc<ParamsHolder>,
    pub proxy: Arc<FakeProxyManager>,
    pub sink: Arc<RecordingSink>,
    pub reconciler: Arc<Reconciler>,
}

pub fn harness() -> Harness {
    let store = Arc::new(Store::new());
    let params = Arc::new(ParamsHolder::new());
    let proxy = Arc::new(FakeProxyManager::new());
    let sink = Arc::new(RecordingSink::new());
    let metrics = Arc::new(Metrics::new());
    let reporter = Arc::new(EventReporter::new(sink.clone(), metrics.clone()));

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        params.clone(),
        proxy.clone(),
        reporter,
        metrics,
    ));

    Harness {
        store,
        params,
        proxy,
        sink,
        reconciler,
    }
}

/// Seed endpoints for the default test services
pub async fn seed_endpoints(harness: &Harness) {
    harness
        .store
        .upsert_endpoints(test_endpoints("tea-svc", &["10.0.0.20"]))
        .await;
    harness
        .store
        .upsert_endpoints(test_endpoints("green-svc", &["10.0.0.30"]))
        .await;
}
