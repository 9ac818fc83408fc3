//! Custom Resource Definitions for the routegate controller
//!
//! This module defines the CRDs the controller reconciles:
//! - VirtualServer: a virtual host with its upstreams and routes
//! - VirtualServerRoute: a delegated route subtree referenced by a VirtualServer

use std::fmt;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// VirtualServer CRD
// ============================================================================

/// VirtualServer Custom Resource Definition
///
/// Defines one virtual host: its hostname, TLS settings, upstreams and the
/// routing tree, parts of which may be delegated to VirtualServerRoutes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "routegate.io",
    version = "v1alpha1",
    kind = "VirtualServer",
    namespaced,
    status = "VirtualServerStatus",
    shortname = "vs",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct VirtualServerSpec {
    /// Hostname served by this virtual server
    pub host: String,

    /// TLS termination settings
    #[serde(default)]
    pub tls: Option<Tls>,

    /// Upstreams referenced by the routes of this resource
    #[serde(default)]
    pub upstreams: Vec<Upstream>,

    /// Routing rules; a rule either routes directly or delegates to a
    /// VirtualServerRoute
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// TLS configuration for a VirtualServer
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Tls {
    /// Name of the kubernetes.io/tls secret holding the certificate
    pub secret: String,
}

/// An upstream: a backend Service plus connection options.
///
/// Optional fields inherit their values from the global ConfigMap defaults,
/// which in turn override the built-in defaults.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Upstream {
    /// Upstream name (unique within the owning resource)
    pub name: String,

    /// Backing Service name
    pub service: String,

    /// Service port
    pub port: u16,

    /// Load balancing method
    #[serde(default)]
    pub lb_method: Option<String>,

    /// Time a server is considered unavailable after max-fails failures
    #[serde(default)]
    pub fail_timeout: Option<String>,

    /// Failed attempts before a server is considered unavailable
    #[serde(default)]
    pub max_fails: Option<i64>,

    /// Number of idle keepalive connections to retain per worker
    #[serde(default)]
    pub keepalive: Option<i64>,

    /// Timeout for establishing a connection to the upstream
    #[serde(default)]
    pub connect_timeout: Option<String>,

    /// Timeout for reading a response from the upstream
    #[serde(default)]
    pub read_timeout: Option<String>,

    /// Timeout for transmitting a request to the upstream
    #[serde(default)]
    pub send_timeout: Option<String>,

    /// Upstream TLS settings
    #[serde(default)]
    pub tls: UpstreamTls,
}

/// TLS settings for connections to an upstream
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct UpstreamTls {
    /// Proxy to the upstream over HTTPS
    #[serde(default)]
    pub enable: bool,
}

/// A routing rule.
///
/// Exactly one of `upstream`, `splits`, `rules` or `route` must be set.
/// The `route` field delegates the path subtree to a VirtualServerRoute and
/// is forbidden inside subroutes.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Route {
    /// Path prefix this rule matches
    pub path: String,

    /// Name of the upstream to route to
    #[serde(default)]
    pub upstream: Option<String>,

    /// Weighted traffic split across upstreams
    #[serde(default)]
    pub splits: Vec<Split>,

    /// Conditional routing rules
    #[serde(default)]
    pub rules: Option<Rules>,

    /// Delegation target: a VirtualServerRoute as `name` or `namespace/name`
    #[serde(default)]
    pub route: Option<String>,
}

/// One leg of a weighted traffic split
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Split {
    /// Percentage of traffic, 1-99; all weights of a route must sum to 100
    pub weight: i64,

    /// Upstream receiving this share
    pub upstream: String,
}

/// Condition-based routing: each match supplies one value per condition
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rules {
    /// Request properties the values are matched against
    pub conditions: Vec<Condition>,

    /// Value tuples and their target upstreams
    pub matches: Vec<Match>,

    /// Upstream used when no match applies
    pub default_upstream: String,
}

/// A single condition; exactly one field must be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Condition {
    /// Match on a request header
    #[serde(default)]
    pub header: Option<String>,

    /// Match on a cookie
    #[serde(default)]
    pub cookie: Option<String>,

    /// Match on a query argument
    #[serde(default)]
    pub argument: Option<String>,

    /// Match on a proxy variable (e.g. $request_method)
    #[serde(default)]
    pub variable: Option<String>,
}

/// A value tuple for a Rules route
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Match {
    /// One value per condition; prefix a value with `!` to negate it
    pub values: Vec<String>,

    /// Upstream receiving requests that match all values
    pub upstream: String,
}

/// Status of a VirtualServer resource
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerStatus {
    /// Current state of the resource
    #[serde(default)]
    pub state: ResourceState,

    /// Machine-readable reason for the state
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation most recently reconciled
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// Reconciliation state of a resource
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ResourceState {
    #[default]
    Pending,
    Valid,
    Warning,
    Invalid,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Pending => write!(f, "Pending"),
            ResourceState::Valid => write!(f, "Valid"),
            ResourceState::Warning => write!(f, "Warning"),
            ResourceState::Invalid => write!(f, "Invalid"),
        }
    }
}

// ============================================================================
// VirtualServerRoute CRD
// ============================================================================

/// VirtualServerRoute Custom Resource Definition
///
/// A route subtree owned by a VirtualServer through a delegation. Active only
/// while exactly one VirtualServer references it; otherwise it is an orphan.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "routegate.io",
    version = "v1alpha1",
    kind = "VirtualServerRoute",
    namespaced,
    status = "VirtualServerStatus",
    shortname = "vsr",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct VirtualServerRouteSpec {
    /// Hostname; must equal the referencing VirtualServer's host
    pub host: String,

    /// Upstreams referenced by the subroutes
    #[serde(default)]
    pub upstreams: Vec<Upstream>,

    /// Routing rules under the delegation's path prefix
    #[serde(default)]
    pub subroutes: Vec<Route>,
}

// ============================================================================
// Shared types and constants
// ============================================================================

/// Namespace/name pair identifying a namespaced resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; falls back to "default" when the
    /// namespace is unset.
    pub fn from_object<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }

    /// Parse `name` or `namespace/name`, defaulting to the given namespace.
    pub fn parse(s: &str, default_namespace: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new(default_namespace, s),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Finalizer used by the controller
pub const FINALIZER: &str = "routegate.io/finalizer";

/// Field manager for server-side apply patches
pub const FIELD_MANAGER: &str = "routegate-controller";

/// Label for managed resources
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "routegate-controller";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_parse() {
        assert_eq!(
            ResourceKey::parse("tea-route", "cafe"),
            ResourceKey::new("cafe", "tea-route")
        );
        assert_eq!(
            ResourceKey::parse("other/tea-route", "cafe"),
            ResourceKey::new("other", "tea-route")
        );
    }

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::new("default", "cafe");
        assert_eq!(key.to_string(), "default/cafe");
    }

    #[test]
    fn test_upstream_wire_names() {
        let json = r#"{
            "name": "tea",
            "service": "tea-svc",
            "port": 80,
            "lb-method": "least_conn",
            "max-fails": 3,
            "fail-timeout": "30s",
            "connect-timeout": "55s"
        }"#;
        let upstream: Upstream = serde_json::from_str(json).unwrap();
        assert_eq!(upstream.lb_method.as_deref(), Some("least_conn"));
        assert_eq!(upstream.max_fails, Some(3));
        assert_eq!(upstream.fail_timeout.as_deref(), Some("30s"));
        assert_eq!(upstream.connect_timeout.as_deref(), Some("55s"));
        assert_eq!(upstream.read_timeout, None);
    }

    #[test]
    fn test_route_defaults() {
        let route: Route = serde_json::from_str(r#"{"path": "/tea"}"#).unwrap();
        assert_eq!(route.path, "/tea");
        assert!(route.upstream.is_none());
        assert!(route.splits.is_empty());
        assert!(route.rules.is_none());
        assert!(route.route.is_none());
    }

    #[test]
    fn test_rules_wire_names() {
        let json = r#"{
            "conditions": [{"header": "x-version"}],
            "matches": [{"values": ["v2"], "upstream": "tea-v2"}],
            "defaultUpstream": "tea-v1"
        }"#;
        let rules: Rules = serde_json::from_str(json).unwrap();
        assert_eq!(rules.default_upstream, "tea-v1");
        assert_eq!(rules.conditions[0].header.as_deref(), Some("x-version"));
    }

    #[test]
    fn test_resource_state_display() {
        assert_eq!(ResourceState::Valid.to_string(), "Valid");
        assert_eq!(ResourceState::Invalid.to_string(), "Invalid");
    }
}
