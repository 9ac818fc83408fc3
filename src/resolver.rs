//! Resolver / merge engine
//!
//! Combines a VirtualServer, its delegated VirtualServerRoutes and the
//! global defaults into one fully resolved configuration model. The
//! resolver exclusively owns ResolvedConfig construction; the renderer
//! never mutates it, and a new one fully replaces the old on the next
//! reconciliation.

use std::collections::{HashMap, HashSet};

use crate::config_params::ConfigParams;
use crate::crd::{Condition, ResourceKey, Route, Upstream, VirtualServer, VirtualServerRoute};
use crate::validation::parse_lb_method;

/// Local socket serving a static 502 for upstreams without endpoints
const FALLBACK_502_SERVER: &str = "unix:/var/run/proxy-502-server.sock";

/// Certificate path used when a referenced TLS secret is missing; paired
/// with `ssl_ciphers NULL` so the server never handshakes successfully.
pub const MISSING_TLS_CERT: &str = "/etc/proxy/secrets/default";

// ============================================================================
// Resolved model
// ============================================================================

/// Fully resolved configuration for one virtual host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub upstreams: Vec<ResolvedUpstream>,
    pub split_clients: Vec<SplitClient>,
    pub maps: Vec<RouteMap>,
    pub server: ResolvedServer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedUpstream {
    pub name: String,
    pub servers: Vec<UpstreamServer>,
    pub lb_method: String,
    pub keepalive: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamServer {
    pub address: String,
    pub max_fails: i64,
    pub fail_timeout: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedServer {
    pub server_name: String,
    pub proxy_protocol: bool,
    pub ssl: Option<Ssl>,
    pub server_tokens: String,
    pub snippets: Vec<String>,
    pub internal_redirects: Vec<InternalRedirect>,
    pub locations: Vec<Location>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ssl {
    pub http2: bool,
    pub certificate: String,
    pub certificate_key: String,
    pub ciphers: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub snippets: Vec<String>,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub proxy_send_timeout: String,
    pub client_max_body_size: String,
    pub proxy_buffering: bool,
    pub proxy_pass: String,
    pub has_keepalive: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitClient {
    pub source: String,
    pub variable: String,
    pub distributions: Vec<Distribution>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Distribution {
    pub weight: String,
    pub value: String,
}

/// A `map` block routing one rules condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMap {
    pub source: String,
    pub variable: String,
    pub parameters: Vec<MapParameter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapParameter {
    pub value: String,
    pub result: String,
}

/// Redirects a route path to the named location selected by a variable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalRedirect {
    pub path: String,
    pub destination: String,
}

// ============================================================================
// Inputs
// ============================================================================

/// A VirtualServer bundled with everything referenced by it
#[derive(Clone, Debug)]
pub struct VirtualServerEx {
    pub virtual_server: VirtualServer,
    /// Delegated routes that passed validation, in delegation order
    pub routes: Vec<VirtualServerRoute>,
    /// Endpoint addresses keyed by `namespace/service:port`
    pub endpoints: HashMap<String, Vec<String>>,
    /// PEM file for the TLS secret, when present and valid
    pub tls_cert_file: Option<String>,
}

/// Key for the endpoints map of a VirtualServerEx
pub fn endpoints_key(namespace: &str, service: &str, port: u16) -> String {
    format!("{}/{}:{}", namespace, service, port)
}

/// A branch dropped during resolution, reported but not fatal to the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteWarning {
    /// Delegated route the dropped branch came from, when applicable
    pub route: Option<ResourceKey>,
    pub reason: String,
}

/// Outcome of resolving one host.
///
/// `config` is None when the host declared routes but none resolved — its
/// configuration artifact must be absent. A host with an empty route list
/// still resolves to an (empty) server block.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub config: Option<ResolvedConfig>,
    pub warnings: Vec<RouteWarning>,
}

// ============================================================================
// Naming
// ============================================================================

/// Prefixes upstream names so merged resources cannot collide
pub struct UpstreamNamer {
    prefix: String,
}

impl UpstreamNamer {
    pub fn for_virtual_server(vs: &VirtualServer) -> Self {
        let key = ResourceKey::from_object(vs);
        Self {
            prefix: format!("vs_{}_{}", key.namespace, key.name),
        }
    }

    pub fn for_route(vs: &VirtualServer, vsr: &VirtualServerRoute) -> Self {
        let vs_key = ResourceKey::from_object(vs);
        let vsr_key = ResourceKey::from_object(vsr);
        Self {
            prefix: format!(
                "vs_{}_{}_vsr_{}_{}",
                vs_key.namespace, vs_key.name, vsr_key.namespace, vsr_key.name
            ),
        }
    }

    pub fn name_for(&self, upstream: &str) -> String {
        format!("{}_{}", self.prefix, upstream)
    }
}

/// Names the generated variables of one host's splits and rules routes
struct VariableNamer {
    safe_ns_name: String,
}

impl VariableNamer {
    fn new(vs: &VirtualServer) -> Self {
        let key = ResourceKey::from_object(vs);
        Self {
            safe_ns_name: format!("{}_{}", key.namespace, key.name).replace('-', "_"),
        }
    }

    fn split_var(&self, index: usize) -> String {
        format!("$vs_{}_splits_{}", self.safe_ns_name, index)
    }

    fn rules_cond_var(&self, rules: usize, m: usize, cond: usize) -> String {
        format!(
            "$vs_{}_rules_{}_match_{}_cond_{}",
            self.safe_ns_name, rules, m, cond
        )
    }

    fn rules_main_var(&self, rules: usize) -> String {
        format!("$vs_{}_rules_{}", self.safe_ns_name, rules)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve one host against a defaults snapshot.
///
/// Pure with respect to its inputs: identical inputs produce an identical
/// ResolvedConfig, which the renderer turns into byte-identical output.
pub fn resolve(vs_ex: &VirtualServerEx, params: &ConfigParams) -> Resolution {
    let vs = &vs_ex.virtual_server;
    let vs_key = ResourceKey::from_object(vs);
    let vs_namer = UpstreamNamer::for_virtual_server(vs);
    let variable_namer = VariableNamer::new(vs);

    // resolved upstream specs by generated name, for location generation
    let mut cr_upstreams: HashMap<String, Upstream> = HashMap::new();
    let mut upstreams = Vec::new();

    for u in &vs.spec.upstreams {
        let name = vs_namer.name_for(&u.name);
        let key = endpoints_key(&vs_key.namespace, &u.service, u.port);
        let endpoints = vs_ex.endpoints.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        upstreams.push(resolve_upstream(&name, u, endpoints, params));
        cr_upstreams.insert(name, u.clone());
    }
    for vsr in &vs_ex.routes {
        let namer = UpstreamNamer::for_route(vs, vsr);
        let vsr_key = ResourceKey::from_object(vsr);
        for u in &vsr.spec.upstreams {
            let name = namer.name_for(&u.name);
            let key = endpoints_key(&vsr_key.namespace, &u.service, u.port);
            let endpoints = vs_ex.endpoints.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            upstreams.push(resolve_upstream(&name, u, endpoints, params));
            cr_upstreams.insert(name, u.clone());
        }
    }

    let mut state = RouteGenState {
        locations: Vec::new(),
        internal_redirects: Vec::new(),
        split_clients: Vec::new(),
        maps: Vec::new(),
        rules_routes: 0,
        resolved_routes: 0,
        claimed_paths: HashSet::new(),
        warnings: Vec::new(),
    };

    // the host's own rules claim paths first
    for r in &vs.spec.routes {
        if r.route.is_some() {
            continue;
        }
        state.add_route(r, &vs_namer, &cr_upstreams, &variable_namer, params, None);
    }

    // then delegated subroutes, in listed order
    for vsr in &vs_ex.routes {
        let namer = UpstreamNamer::for_route(vs, vsr);
        let vsr_key = ResourceKey::from_object(vsr);
        for r in &vsr.spec.subroutes {
            state.add_route(
                r,
                &namer,
                &cr_upstreams,
                &variable_namer,
                params,
                Some(&vsr_key),
            );
        }
    }

    let declared_routes = vs.spec.routes.len();
    let config = if declared_routes > 0 && state.resolved_routes == 0 {
        None
    } else {
        Some(ResolvedConfig {
            upstreams,
            split_clients: state.split_clients,
            maps: state.maps,
            server: ResolvedServer {
                server_name: vs.spec.host.clone(),
                proxy_protocol: params.proxy_protocol,
                ssl: resolve_ssl(vs, &vs_ex.tls_cert_file, params),
                server_tokens: params.server_tokens.clone(),
                snippets: params.server_snippets.clone(),
                internal_redirects: state.internal_redirects,
                locations: state.locations,
            },
        })
    };

    Resolution {
        config,
        warnings: state.warnings,
    }
}

struct RouteGenState {
    locations: Vec<Location>,
    internal_redirects: Vec<InternalRedirect>,
    split_clients: Vec<SplitClient>,
    maps: Vec<RouteMap>,
    rules_routes: usize,
    resolved_routes: usize,
    claimed_paths: HashSet<String>,
    warnings: Vec<RouteWarning>,
}

impl RouteGenState {
    /// Generate config for one route, claiming its path. A path already
    /// claimed earlier in the tree drops this claimant only; first seen
    /// wins.
    fn add_route(
        &mut self,
        route: &Route,
        namer: &UpstreamNamer,
        cr_upstreams: &HashMap<String, Upstream>,
        variable_namer: &VariableNamer,
        params: &ConfigParams,
        owner: Option<&ResourceKey>,
    ) {
        if !self.claimed_paths.insert(route.path.clone()) {
            self.warnings.push(RouteWarning {
                route: owner.cloned(),
                reason: format!("duplicate path {:?}", route.path),
            });
            return;
        }

        if !route.splits.is_empty() {
            let cfg = resolve_split_route(
                route,
                namer,
                cr_upstreams,
                variable_namer,
                self.split_clients.len(),
                params,
            );
            self.split_clients.push(cfg.split_client);
            self.locations.extend(cfg.locations);
            self.internal_redirects.push(cfg.internal_redirect);
        } else if let Some(rules) = &route.rules {
            let cfg = resolve_rules_route(
                &route.path,
                rules,
                namer,
                cr_upstreams,
                variable_namer,
                self.rules_routes,
                params,
            );
            self.maps.extend(cfg.maps);
            self.locations.extend(cfg.locations);
            self.internal_redirects.push(cfg.internal_redirect);
            self.rules_routes += 1;
        } else if let Some(upstream) = &route.upstream {
            let name = namer.name_for(upstream);
            let spec = cr_upstreams.get(&name).cloned().unwrap_or_default();
            self.locations
                .push(resolve_location(&route.path, &name, &spec, params));
        } else {
            // no action; validation rejects this before resolution
            return;
        }

        self.resolved_routes += 1;
    }
}

fn resolve_upstream(
    name: &str,
    upstream: &Upstream,
    endpoints: &[String],
    params: &ConfigParams,
) -> ResolvedUpstream {
    let max_fails = upstream.max_fails.unwrap_or(params.max_fails);
    let fail_timeout = upstream
        .fail_timeout
        .clone()
        .unwrap_or_else(|| params.fail_timeout.clone());

    let mut servers: Vec<UpstreamServer> = endpoints
        .iter()
        .map(|address| UpstreamServer {
            address: address.clone(),
            max_fails,
            fail_timeout: fail_timeout.clone(),
        })
        .collect();

    // a backend without endpoints surfaces as a runtime 502, not an error
    if servers.is_empty() {
        servers.push(UpstreamServer {
            address: FALLBACK_502_SERVER.to_string(),
            max_fails,
            fail_timeout,
        });
    }

    let lb_method = match &upstream.lb_method {
        Some(method) => parse_lb_method(method).unwrap_or_else(|_| params.lb_method.clone()),
        None => params.lb_method.clone(),
    };

    ResolvedUpstream {
        name: name.to_string(),
        servers,
        lb_method,
        keepalive: upstream.keepalive.unwrap_or(params.keepalive),
    }
}

fn upstream_has_keepalive(upstream: &Upstream, params: &ConfigParams) -> bool {
    match upstream.keepalive {
        Some(keepalive) => keepalive != 0,
        None => params.keepalive != 0,
    }
}

fn resolve_location(
    path: &str,
    upstream_name: &str,
    upstream: &Upstream,
    params: &ConfigParams,
) -> Location {
    let scheme = if upstream.tls.enable { "https" } else { "http" };

    Location {
        path: path.to_string(),
        snippets: params.location_snippets.clone(),
        proxy_connect_timeout: upstream
            .connect_timeout
            .clone()
            .unwrap_or_else(|| params.proxy_connect_timeout.clone()),
        proxy_read_timeout: upstream
            .read_timeout
            .clone()
            .unwrap_or_else(|| params.proxy_read_timeout.clone()),
        proxy_send_timeout: upstream
            .send_timeout
            .clone()
            .unwrap_or_else(|| params.proxy_send_timeout.clone()),
        client_max_body_size: params.client_max_body_size.clone(),
        proxy_buffering: params.proxy_buffering,
        proxy_pass: format!("{}://{}", scheme, upstream_name),
        has_keepalive: upstream_has_keepalive(upstream, params),
    }
}

fn resolve_ssl(
    vs: &VirtualServer,
    tls_cert_file: &Option<String>,
    params: &ConfigParams,
) -> Option<Ssl> {
    let tls = vs.spec.tls.as_ref()?;
    if tls.secret.is_empty() {
        return None;
    }

    let (certificate, ciphers) = match tls_cert_file {
        Some(file) => (file.clone(), String::new()),
        None => (MISSING_TLS_CERT.to_string(), "NULL".to_string()),
    };

    Some(Ssl {
        http2: params.http2,
        certificate: certificate.clone(),
        certificate_key: certificate,
        ciphers,
    })
}

// ============================================================================
// Splits
// ============================================================================

struct SplitRouteCfg {
    split_client: SplitClient,
    locations: Vec<Location>,
    internal_redirect: InternalRedirect,
}

fn resolve_split_route(
    route: &Route,
    namer: &UpstreamNamer,
    cr_upstreams: &HashMap<String, Upstream>,
    variable_namer: &VariableNamer,
    index: usize,
    params: &ConfigParams,
) -> SplitRouteCfg {
    let variable = variable_namer.split_var(index);

    let distributions = route
        .splits
        .iter()
        .enumerate()
        .map(|(i, s)| Distribution {
            weight: format!("{}%", s.weight),
            value: format!("@splits_{}_split_{}", index, i),
        })
        .collect();

    let locations = route
        .splits
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let path = format!("@splits_{}_split_{}", index, i);
            let name = namer.name_for(&s.upstream);
            let spec = cr_upstreams.get(&name).cloned().unwrap_or_default();
            resolve_location(&path, &name, &spec, params)
        })
        .collect();

    SplitRouteCfg {
        split_client: SplitClient {
            source: "$request_id".to_string(),
            variable: variable.clone(),
            distributions,
        },
        locations,
        internal_redirect: InternalRedirect {
            path: route.path.clone(),
            destination: variable,
        },
    }
}

// ============================================================================
// Rules
// ============================================================================

struct RulesRouteCfg {
    maps: Vec<RouteMap>,
    locations: Vec<Location>,
    internal_redirect: InternalRedirect,
}

fn resolve_rules_route(
    path: &str,
    rules: &crate::crd::Rules,
    namer: &UpstreamNamer,
    cr_upstreams: &HashMap<String, Upstream>,
    variable_namer: &VariableNamer,
    index: usize,
    params: &ConfigParams,
) -> RulesRouteCfg {
    let mut maps = Vec::new();

    // one map per (match, condition); each chains into the next condition's
    // variable and the last one yields 1
    for (i, m) in rules.matches.iter().enumerate() {
        for (j, c) in rules.conditions.iter().enumerate() {
            let success = if j + 1 < m.values.len() {
                variable_namer.rules_cond_var(index, i, j + 1)
            } else {
                "1".to_string()
            };
            let value = m.values.get(j).map(String::as_str).unwrap_or("");

            maps.push(RouteMap {
                source: condition_source(c),
                variable: variable_namer.rules_cond_var(index, i, j),
                parameters: match_parameters(value, &success),
            });
        }
    }

    // the main map concatenates each match's first variable and picks the
    // first match whose chain produced 1
    let mut source = String::new();
    let mut parameters = Vec::new();
    for i in 0..rules.matches.len() {
        source.push_str(&variable_namer.rules_cond_var(index, i, 0));
        parameters.push(MapParameter {
            value: format!("~^{}1", "0".repeat(i)),
            result: format!("@rules_{}_match_{}", index, i),
        });
    }
    parameters.push(MapParameter {
        value: "default".to_string(),
        result: format!("@rules_{}_default", index),
    });

    let main_variable = variable_namer.rules_main_var(index);
    maps.push(RouteMap {
        source,
        variable: main_variable.clone(),
        parameters,
    });

    let mut locations: Vec<Location> = rules
        .matches
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let path = format!("@rules_{}_match_{}", index, i);
            let name = namer.name_for(&m.upstream);
            let spec = cr_upstreams.get(&name).cloned().unwrap_or_default();
            resolve_location(&path, &name, &spec, params)
        })
        .collect();

    let default_path = format!("@rules_{}_default", index);
    let default_name = namer.name_for(&rules.default_upstream);
    let default_spec = cr_upstreams.get(&default_name).cloned().unwrap_or_default();
    locations.push(resolve_location(&default_path, &default_name, &default_spec, params));

    RulesRouteCfg {
        maps,
        locations,
        internal_redirect: InternalRedirect {
            path: path.to_string(),
            destination: main_variable,
        },
    }
}

/// Map parameters reserved by the proxy; literal values must be escaped
const SPECIAL_MAP_PARAMETERS: &[&str] = &["default", "hostnames", "include", "volatile"];

fn map_value(matched: &str) -> (String, bool) {
    if matched.is_empty() {
        return ("\"\"".to_string(), false);
    }

    let (value, negative) = match matched.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (matched, false),
    };

    if SPECIAL_MAP_PARAMETERS.contains(&value) {
        (format!("\\{}", value), negative)
    } else {
        (format!("\"{}\"", value), negative)
    }
}

fn match_parameters(matched: &str, success: &str) -> Vec<MapParameter> {
    let (value, negative) = map_value(matched);

    let (value_result, default_result) = if negative {
        ("0".to_string(), success.to_string())
    } else {
        (success.to_string(), "0".to_string())
    };

    vec![
        MapParameter {
            value,
            result: value_result,
        },
        MapParameter {
            value: "default".to_string(),
            result: default_result,
        },
    ]
}

fn condition_source(condition: &Condition) -> String {
    if let Some(header) = &condition.header {
        return format!("$http_{}", header.replace('-', "_"));
    }
    if let Some(cookie) = &condition.cookie {
        return format!("$cookie_{}", cookie);
    }
    if let Some(argument) = &condition.argument {
        return format!("$arg_{}", argument);
    }
    condition.variable.clone().unwrap_or_default()
}
