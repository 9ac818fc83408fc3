//! Controller implementations
//!
//! Each custom resource gets a kube controller with a reconcile function
//! and an error policy; plain watchers feed the store for the dependent
//! objects (ConfigMap defaults, Endpoints, Secrets). All of them delegate
//! the actual work to the reconciliation core in `sync`.

pub mod config_map;
pub mod endpoints;
pub mod secrets;
pub mod virtual_server;
pub mod virtual_server_route;

// Re-export for convenience
pub use virtual_server::Context as VirtualServerContext;
pub use virtual_server_route::Context as VirtualServerRouteContext;
