//! In-memory view of the watched resources
//!
//! The watchers keep these maps current; the reconciliation core reads
//! them to assemble a VirtualServerEx for one host. Reverse lookups answer
//! "which hosts must re-resolve when this object changes".

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Secret};
use tokio::sync::RwLock;

use crate::crd::{ResourceKey, VirtualServer, VirtualServerRoute};

/// Route keys referenced by a VirtualServer's delegations, in route order
pub fn referenced_route_keys(vs: &VirtualServer) -> Vec<ResourceKey> {
    let default_namespace = vs
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    vs.spec
        .routes
        .iter()
        .filter_map(|r| r.route.as_deref())
        .map(|target| ResourceKey::parse(target, &default_namespace))
        .collect()
}

#[derive(Default)]
pub struct Store {
    virtual_servers: RwLock<HashMap<ResourceKey, Arc<VirtualServer>>>,
    routes: RwLock<HashMap<ResourceKey, Arc<VirtualServerRoute>>>,
    endpoints: RwLock<HashMap<ResourceKey, Endpoints>>,
    secrets: RwLock<HashMap<ResourceKey, Secret>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // VirtualServers
    // ------------------------------------------------------------------

    pub async fn upsert_virtual_server(&self, vs: VirtualServer) -> Arc<VirtualServer> {
        let key = ResourceKey::from_object(&vs);
        let vs = Arc::new(vs);
        self.virtual_servers.write().await.insert(key, vs.clone());
        vs
    }

    pub async fn remove_virtual_server(&self, key: &ResourceKey) -> Option<Arc<VirtualServer>> {
        self.virtual_servers.write().await.remove(key)
    }

    pub async fn virtual_server(&self, key: &ResourceKey) -> Option<Arc<VirtualServer>> {
        self.virtual_servers.read().await.get(key).cloned()
    }

    /// Keys of every VirtualServer currently live, in stable order
    pub async fn live_host_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> =
            self.virtual_servers.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn virtual_server_count(&self) -> usize {
        self.virtual_servers.read().await.len()
    }

    // ------------------------------------------------------------------
    // VirtualServerRoutes
    // ------------------------------------------------------------------

    pub async fn upsert_route(&self, vsr: VirtualServerRoute) -> Arc<VirtualServerRoute> {
        let key = ResourceKey::from_object(&vsr);
        let vsr = Arc::new(vsr);
        self.routes.write().await.insert(key, vsr.clone());
        vsr
    }

    pub async fn remove_route(&self, key: &ResourceKey) -> Option<Arc<VirtualServerRoute>> {
        self.routes.write().await.remove(key)
    }

    pub async fn route(&self, key: &ResourceKey) -> Option<Arc<VirtualServerRoute>> {
        self.routes.read().await.get(key).cloned()
    }

    /// VirtualServers whose delegations point at the given route key
    pub async fn virtual_servers_referencing_route(
        &self,
        route_key: &ResourceKey,
    ) -> Vec<Arc<VirtualServer>> {
        let servers = self.virtual_servers.read().await;
        let mut result: Vec<(ResourceKey, Arc<VirtualServer>)> = servers
            .iter()
            .filter(|(_, vs)| referenced_route_keys(vs).contains(route_key))
            .map(|(k, vs)| (k.clone(), vs.clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result.into_iter().map(|(_, vs)| vs).collect()
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    pub async fn upsert_endpoints(&self, endpoints: Endpoints) {
        let key = ResourceKey::from_object(&endpoints);
        self.endpoints.write().await.insert(key, endpoints);
    }

    pub async fn remove_endpoints(&self, key: &ResourceKey) {
        self.endpoints.write().await.remove(key);
    }

    /// Ready addresses backing a service port, as `ip:port`, in stable
    /// order. Empty when the service has no ready endpoints.
    pub async fn addresses_for(&self, namespace: &str, service: &str, port: u16) -> Vec<String> {
        let key = ResourceKey::new(namespace, service);
        let endpoints = self.endpoints.read().await;
        let Some(ep) = endpoints.get(&key) else {
            return Vec::new();
        };

        let mut addresses = Vec::new();
        for subset in ep.subsets.iter().flatten() {
            let ports = subset.ports.as_deref().unwrap_or_default();
            let target_port = ports
                .iter()
                .find(|p| p.port == i32::from(port))
                .or(if ports.len() == 1 { ports.first() } else { None });
            let Some(target_port) = target_port else {
                continue;
            };
            for address in subset.addresses.iter().flatten() {
                addresses.push(format!("{}:{}", address.ip, target_port.port));
            }
        }
        addresses.sort();
        addresses
    }

    /// Hosts whose upstreams (own or delegated) are backed by the service
    pub async fn virtual_servers_referencing_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Vec<ResourceKey> {
        let servers = self.virtual_servers.read().await;
        let routes = self.routes.read().await;
        let mut result = Vec::new();

        for (key, vs) in servers.iter() {
            let own = key.namespace == namespace
                && vs.spec.upstreams.iter().any(|u| u.service == service);

            let delegated = referenced_route_keys(vs).iter().any(|route_key| {
                route_key.namespace == namespace
                    && routes
                        .get(route_key)
                        .map(|vsr| vsr.spec.upstreams.iter().any(|u| u.service == service))
                        .unwrap_or(false)
            });

            if own || delegated {
                result.push(key.clone());
            }
        }
        result.sort();
        result
    }

    // ------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------

    pub async fn upsert_secret(&self, secret: Secret) {
        let key = ResourceKey::from_object(&secret);
        self.secrets.write().await.insert(key, secret);
    }

    pub async fn remove_secret(&self, key: &ResourceKey) {
        self.secrets.write().await.remove(key);
    }

    pub async fn secret(&self, key: &ResourceKey) -> Option<Secret> {
        self.secrets.read().await.get(key).cloned()
    }

    /// Hosts whose TLS configuration references the secret
    pub async fn virtual_servers_referencing_secret(
        &self,
        namespace: &str,
        secret: &str,
    ) -> Vec<ResourceKey> {
        let servers = self.virtual_servers.read().await;
        let mut result: Vec<ResourceKey> = servers
            .iter()
            .filter(|(key, vs)| {
                key.namespace == namespace
                    && vs
                        .spec
                        .tls
                        .as_ref()
                        .map(|tls| tls.secret == secret)
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        result.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Route, Tls, Upstream, VirtualServerSpec};
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};
    use kube::api::ObjectMeta;

    fn virtual_server(name: &str, namespace: &str) -> VirtualServer {
        VirtualServer {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: VirtualServerSpec {
                host: format!("{}.example.com", name),
                tls: Some(Tls {
                    secret: "cafe-secret".to_string(),
                }),
                upstreams: vec![Upstream {
                    name: "tea".to_string(),
                    service: "tea-svc".to_string(),
                    port: 80,
                    ..Default::default()
                }],
                routes: vec![
                    Route {
                        path: "/tea".to_string(),
                        upstream: Some("tea".to_string()),
                        ..Default::default()
                    },
                    Route {
                        path: "/green".to_string(),
                        route: Some("tea-route".to_string()),
                        ..Default::default()
                    },
                ],
            },
            status: None,
        }
    }

    fn endpoints(name: &str, namespace: &str, ips: &[&str], port: i32) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
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
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    #[tokio::test]
    async fn test_referenced_route_keys() {
        let vs = virtual_server("cafe", "default");
        assert_eq!(
            referenced_route_keys(&vs),
            vec![ResourceKey::new("default", "tea-route")]
        );
    }

    #[tokio::test]
    async fn test_reverse_route_lookup() {
        let store = Store::new();
        store
            .upsert_virtual_server(virtual_server("cafe", "default"))
            .await;
        store
            .upsert_virtual_server(virtual_server("bar", "other"))
            .await;

        let referencing = store
            .virtual_servers_referencing_route(&ResourceKey::new("default", "tea-route"))
            .await;
        assert_eq!(referencing.len(), 1);
        assert_eq!(referencing[0].metadata.name.as_deref(), Some("cafe"));

        // the other host's delegation resolves in its own namespace
        let referencing = store
            .virtual_servers_referencing_route(&ResourceKey::new("other", "tea-route"))
            .await;
        assert_eq!(referencing.len(), 1);
    }

    #[tokio::test]
    async fn test_addresses_for_service() {
        let store = Store::new();
        store
            .upsert_endpoints(endpoints("tea-svc", "default", &["10.0.0.2", "10.0.0.1"], 80))
            .await;

        let addresses = store.addresses_for("default", "tea-svc", 80).await;
        assert_eq!(addresses, vec!["10.0.0.1:80", "10.0.0.2:80"]);

        assert!(store.addresses_for("default", "no-svc", 80).await.is_empty());
    }

    #[tokio::test]
    async fn test_addresses_single_port_fallback() {
        let store = Store::new();
        // endpoints expose target port 8080 while the upstream asks for the
        // service port 80; a single-port subset is used as-is
        store
            .upsert_endpoints(endpoints("tea-svc", "default", &["10.0.0.1"], 8080))
            .await;

        let addresses = store.addresses_for("default", "tea-svc", 80).await;
        assert_eq!(addresses, vec!["10.0.0.1:8080"]);
    }

    #[tokio::test]
    async fn test_service_reverse_lookup() {
        let store = Store::new();
        store
            .upsert_virtual_server(virtual_server("cafe", "default"))
            .await;

        let hosts = store
            .virtual_servers_referencing_service("default", "tea-svc")
            .await;
        assert_eq!(hosts, vec![ResourceKey::new("default", "cafe")]);

        assert!(store
            .virtual_servers_referencing_service("other", "tea-svc")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_secret_reverse_lookup() {
        let store = Store::new();
        store
            .upsert_virtual_server(virtual_server("cafe", "default"))
            .await;

        let hosts = store
            .virtual_servers_referencing_secret("default", "cafe-secret")
            .await;
        assert_eq!(hosts, vec![ResourceKey::new("default", "cafe")]);
    }

    #[tokio::test]
    async fn test_live_host_keys_sorted() {
        let store = Store::new();
        store
            .upsert_virtual_server(virtual_server("zebra", "default"))
            .await;
        store
            .upsert_virtual_server(virtual_server("cafe", "default"))
            .await;

        let keys = store.live_host_keys().await;
        assert_eq!(
            keys,
            vec![
                ResourceKey::new("default", "cafe"),
                ResourceKey::new("default", "zebra"),
            ]
        );
    }
}
