//! Structural and semantic validation of custom resources
//!
//! Validation is a pure function over a resource: every offending field is
//! reported, not just the first, and each error is qualified with the field
//! path that produced it. A resource that fails validation is rejected in
//! its entirety; previously applied configuration stays in force until a
//! valid update or a deletion arrives.

use std::collections::HashSet;
use std::fmt;

use crate::crd::{
    Condition, Match, Route, Rules, Split, Upstream, VirtualServer, VirtualServerRoute,
};

/// A single field-qualified validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The full list of errors found in one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Validate a VirtualServer in isolation.
pub fn validate_virtual_server(vs: &VirtualServer) -> Result<(), ValidationErrors> {
    let mut errs = Vec::new();

    validate_host(&vs.spec.host, "spec.host", &mut errs);

    if let Some(tls) = &vs.spec.tls {
        validate_secret_name(&tls.secret, "spec.tls.secret", &mut errs);
    }

    let upstream_names = validate_upstreams(&vs.spec.upstreams, "spec.upstreams", &mut errs);
    validate_routes(
        &vs.spec.routes,
        "spec.routes",
        &upstream_names,
        RouteContext::VirtualServer,
        &mut errs,
    );

    ValidationErrors(errs).into_result()
}

/// Validate a VirtualServerRoute in isolation.
pub fn validate_virtual_server_route(vsr: &VirtualServerRoute) -> Result<(), ValidationErrors> {
    validate_route_spec(vsr, None, None)
}

/// Validate a VirtualServerRoute in the context of the VirtualServer that
/// delegates to it: the host must match and every subroute path must live
/// under the delegation's path prefix.
pub fn validate_virtual_server_route_for_virtual_server(
    vsr: &VirtualServerRoute,
    host: &str,
    path_prefix: &str,
) -> Result<(), ValidationErrors> {
    validate_route_spec(vsr, Some(host), Some(path_prefix))
}

fn validate_route_spec(
    vsr: &VirtualServerRoute,
    host: Option<&str>,
    path_prefix: Option<&str>,
) -> Result<(), ValidationErrors> {
    let mut errs = Vec::new();

    validate_host(&vsr.spec.host, "spec.host", &mut errs);
    if let Some(expected) = host {
        if vsr.spec.host != expected {
            errs.push(FieldError::new(
                "spec.host",
                format!("must be equal to {:?}", expected),
            ));
        }
    }

    let upstream_names = validate_upstreams(&vsr.spec.upstreams, "spec.upstreams", &mut errs);
    validate_routes(
        &vsr.spec.subroutes,
        "spec.subroutes",
        &upstream_names,
        RouteContext::Subroute {
            path_prefix: path_prefix.map(str::to_string),
        },
        &mut errs,
    );

    ValidationErrors(errs).into_result()
}

// ============================================================================
// Upstreams
// ============================================================================

fn validate_upstreams(
    upstreams: &[Upstream],
    field: &str,
    errs: &mut Vec<FieldError>,
) -> HashSet<String> {
    let mut names = HashSet::new();

    for (i, u) in upstreams.iter().enumerate() {
        let idx = format!("{}[{}]", field, i);

        if let Err(msg) = dns1035_label(&u.name) {
            errs.push(FieldError::new(format!("{}.name", idx), msg));
        } else if !names.insert(u.name.clone()) {
            errs.push(FieldError::new(
                format!("{}.name", idx),
                format!("duplicate value {:?}", u.name),
            ));
        }

        if let Err(msg) = dns1035_label(&u.service) {
            errs.push(FieldError::new(format!("{}.service", idx), msg));
        }

        if u.port == 0 {
            errs.push(FieldError::new(
                format!("{}.port", idx),
                "must be between 1 and 65535",
            ));
        }

        if let Some(method) = &u.lb_method {
            if let Err(msg) = parse_lb_method(method) {
                errs.push(FieldError::new(format!("{}.lb-method", idx), msg));
            }
        }
        for (value, name) in [
            (&u.fail_timeout, "fail-timeout"),
            (&u.connect_timeout, "connect-timeout"),
            (&u.read_timeout, "read-timeout"),
            (&u.send_timeout, "send-timeout"),
        ] {
            if let Some(t) = value {
                if let Err(msg) = parse_time(t) {
                    errs.push(FieldError::new(format!("{}.{}", idx, name), msg));
                }
            }
        }
        for (value, name) in [(u.max_fails, "max-fails"), (u.keepalive, "keepalive")] {
            if let Some(n) = value {
                if n < 0 {
                    errs.push(FieldError::new(
                        format!("{}.{}", idx, name),
                        "must be positive or zero",
                    ));
                }
            }
        }
    }

    names
}

// ============================================================================
// Routes
// ============================================================================

enum RouteContext {
    VirtualServer,
    Subroute { path_prefix: Option<String> },
}

fn validate_routes(
    routes: &[Route],
    field: &str,
    upstream_names: &HashSet<String>,
    context: RouteContext,
    errs: &mut Vec<FieldError>,
) {
    let mut paths = HashSet::new();

    for (i, r) in routes.iter().enumerate() {
        let idx = format!("{}[{}]", field, i);
        let before = errs.len();

        validate_route(r, &idx, upstream_names, &context, errs);

        if let RouteContext::Subroute {
            path_prefix: Some(prefix),
        } = &context
        {
            if !r.path.starts_with(prefix.as_str()) {
                errs.push(FieldError::new(
                    format!("{}.path", idx),
                    format!("must start with {:?}", prefix),
                ));
            }
        }

        // the duplicate check only applies to otherwise valid routes
        if errs.len() == before && !paths.insert(r.path.clone()) {
            errs.push(FieldError::new(
                format!("{}.path", idx),
                format!("duplicate value {:?}", r.path),
            ));
        }
    }
}

fn validate_route(
    route: &Route,
    field: &str,
    upstream_names: &HashSet<String>,
    context: &RouteContext,
    errs: &mut Vec<FieldError>,
) {
    validate_path(&route.path, &format!("{}.path", field), errs);

    let mut action_count = 0;

    if let Some(upstream) = &route.upstream {
        validate_referenced_upstream(upstream, &format!("{}.upstream", field), upstream_names, errs);
        action_count += 1;
    }

    if !route.splits.is_empty() {
        validate_splits(&route.splits, &format!("{}.splits", field), upstream_names, errs);
        action_count += 1;
    }

    if let Some(rules) = &route.rules {
        validate_rules(rules, &format!("{}.rules", field), upstream_names, errs);
        action_count += 1;
    }

    if let Some(delegation) = &route.route {
        match context {
            RouteContext::Subroute { .. } => {
                errs.push(FieldError::new(format!("{}.route", field), "is not allowed"));
            }
            RouteContext::VirtualServer => {
                validate_delegation(delegation, &format!("{}.route", field), errs);
                action_count += 1;
            }
        }
    }

    if action_count != 1 {
        let msg = match context {
            RouteContext::VirtualServer => {
                "must specify exactly one of: `upstream`, `splits`, `rules` or `route`"
            }
            RouteContext::Subroute { .. } => {
                "must specify exactly one of: `upstream`, `splits` or `rules`"
            }
        };
        errs.push(FieldError::new(field, msg));
    }
}

fn validate_referenced_upstream(
    name: &str,
    field: &str,
    upstream_names: &HashSet<String>,
    errs: &mut Vec<FieldError>,
) {
    if let Err(msg) = dns1035_label(name) {
        errs.push(FieldError::new(field, msg));
    } else if !upstream_names.contains(name) {
        errs.push(FieldError::new(field, format!("{:?} not found", name)));
    }
}

fn validate_splits(
    splits: &[Split],
    field: &str,
    upstream_names: &HashSet<String>,
    errs: &mut Vec<FieldError>,
) {
    if splits.len() < 2 {
        errs.push(FieldError::new(field, "must include at least 2 splits"));
        return;
    }

    let mut total = 0;
    for (i, s) in splits.iter().enumerate() {
        let idx = format!("{}[{}]", field, i);
        if !(1..=99).contains(&s.weight) {
            errs.push(FieldError::new(
                format!("{}.weight", idx),
                "must be between 1 and 99",
            ));
        }
        validate_referenced_upstream(&s.upstream, &format!("{}.upstream", idx), upstream_names, errs);
        total += s.weight;
    }

    if total != 100 {
        errs.push(FieldError::new(
            field,
            "the sum of the weights of all splits must be equal to 100",
        ));
    }
}

fn validate_rules(
    rules: &Rules,
    field: &str,
    upstream_names: &HashSet<String>,
    errs: &mut Vec<FieldError>,
) {
    if rules.conditions.is_empty() {
        errs.push(FieldError::new(
            format!("{}.conditions", field),
            "must specify at least one condition",
        ));
    } else {
        for (i, c) in rules.conditions.iter().enumerate() {
            validate_condition(c, &format!("{}.conditions[{}]", field, i), errs);
        }
    }

    if rules.matches.is_empty() {
        errs.push(FieldError::new(
            format!("{}.matches", field),
            "must specify at least one match",
        ));
    } else {
        for (i, m) in rules.matches.iter().enumerate() {
            validate_match(
                m,
                &format!("{}.matches[{}]", field, i),
                rules.conditions.len(),
                upstream_names,
                errs,
            );
        }
    }

    validate_referenced_upstream(
        &rules.default_upstream,
        &format!("{}.defaultUpstream", field),
        upstream_names,
        errs,
    );
}

/// Proxy variables allowed in conditions. Not every variable is safe to
/// interpolate into a map source.
const VALID_VARIABLE_NAMES: &[&str] = &[
    "$args",
    "$http2",
    "$https",
    "$remote_addr",
    "$remote_port",
    "$query_string",
    "$request",
    "$request_body",
    "$request_uri",
    "$request_method",
    "$scheme",
];

fn validate_condition(condition: &Condition, field: &str, errs: &mut Vec<FieldError>) {
    let mut count = 0;

    if let Some(header) = &condition.header {
        if !is_http_header_name(header) {
            errs.push(FieldError::new(
                format!("{}.header", field),
                "a valid header name must consist of alphanumeric characters or '-'",
            ));
        }
        count += 1;
    }
    if let Some(cookie) = &condition.cookie {
        if !is_word(cookie) {
            errs.push(FieldError::new(
                format!("{}.cookie", field),
                "a valid cookie name must consist of alphanumeric characters or '_'",
            ));
        }
        count += 1;
    }
    if let Some(argument) = &condition.argument {
        if !is_word(argument) {
            errs.push(FieldError::new(
                format!("{}.argument", field),
                "a valid argument name must consist of alphanumeric characters or '_'",
            ));
        }
        count += 1;
    }
    if let Some(variable) = &condition.variable {
        if !variable.starts_with('$') {
            errs.push(FieldError::new(
                format!("{}.variable", field),
                "must start with `$`",
            ));
        } else if !VALID_VARIABLE_NAMES.contains(&variable.as_str()) {
            errs.push(FieldError::new(
                format!("{}.variable", field),
                format!("{:?} is not an allowed variable", variable),
            ));
        }
        count += 1;
    }

    if count != 1 {
        errs.push(FieldError::new(
            field,
            "must specify exactly one of: `header`, `cookie`, `argument` or `variable`",
        ));
    }
}

fn validate_match(
    m: &Match,
    field: &str,
    conditions_count: usize,
    upstream_names: &HashSet<String>,
    errs: &mut Vec<FieldError>,
) {
    if m.values.len() != conditions_count {
        errs.push(FieldError::new(
            format!("{}.values", field),
            format!(
                "must specify {} values (same as the number of conditions)",
                conditions_count
            ),
        ));
    }

    for (i, v) in m.values.iter().enumerate() {
        if !is_valid_match_value(v) {
            errs.push(FieldError::new(
                format!("{}.values[{}]", field, i),
                "all double quotes must be escaped and the value must not end with an unescaped backslash",
            ));
        }
    }

    validate_referenced_upstream(&m.upstream, &format!("{}.upstream", field), upstream_names, errs);
}

fn validate_delegation(delegation: &str, field: &str, errs: &mut Vec<FieldError>) {
    let (namespace, name) = match delegation.split_once('/') {
        Some(parts) => parts,
        None => ("", delegation),
    };

    if !namespace.is_empty() {
        if let Err(msg) = dns1123_subdomain(namespace) {
            errs.push(FieldError::new(field, msg));
        }
    }
    if let Err(msg) = dns1123_subdomain(name) {
        errs.push(FieldError::new(field, msg));
    }
}

// ============================================================================
// Field grammars
// ============================================================================

fn validate_host(host: &str, field: &str, errs: &mut Vec<FieldError>) {
    if host.is_empty() {
        errs.push(FieldError::new(field, "required value"));
        return;
    }
    if let Err(msg) = dns1123_subdomain(host) {
        errs.push(FieldError::new(field, msg));
    }
}

fn validate_secret_name(name: &str, field: &str, errs: &mut Vec<FieldError>) {
    if name.is_empty() {
        errs.push(FieldError::new(field, "required value"));
        return;
    }
    if let Err(msg) = dns1123_subdomain(name) {
        errs.push(FieldError::new(field, msg));
    }
}

fn validate_path(path: &str, field: &str, errs: &mut Vec<FieldError>) {
    if path.is_empty() {
        errs.push(FieldError::new(field, "required value"));
        return;
    }
    if !path.starts_with('/')
        || path
            .chars()
            .any(|c| c.is_whitespace() || c == '{' || c == '}' || c == ';')
    {
        errs.push(FieldError::new(
            field,
            "must start with / and must not include any whitespace character, '{', '}' or ';'",
        ));
    }
}

fn dns1123_subdomain(value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > 253 {
        return Err("must be a valid DNS subdomain (RFC 1123)".to_string());
    }
    for label in value.split('.') {
        if label.is_empty()
            || !label.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            || !label.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            || !label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err("must be a valid DNS subdomain (RFC 1123)".to_string());
        }
    }
    Ok(())
}

fn dns1035_label(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("required value".to_string());
    }
    if value.len() > 63
        || !value.starts_with(|c: char| c.is_ascii_lowercase())
        || !value.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        || !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("must be a valid DNS label (RFC 1035)".to_string());
    }
    Ok(())
}

fn is_word(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_http_header_name(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_valid_match_value(value: &str) -> bool {
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return false;
        }
    }
    !escaped
}

const VALID_LB_METHODS: &[&str] = &[
    "least_conn",
    "ip_hash",
    "random",
    "random two",
    "random two least_conn",
    "least_time",
    "least_time header",
    "least_time last_byte",
];

/// Parse a load balancing method into its resolved form.
///
/// `round_robin` maps to the empty string so the renderer omits the
/// directive; `hash <key> [consistent]` passes the key through.
pub fn parse_lb_method(method: &str) -> Result<String, String> {
    let method = method.trim();

    if method == "round_robin" {
        return Ok(String::new());
    }

    let tokens: Vec<&str> = method.split_whitespace().collect();
    if tokens.first() == Some(&"hash") {
        match tokens.len() {
            2 => return Ok(format!("hash {}", tokens[1])),
            3 if tokens[2] == "consistent" => {
                return Ok(format!("hash {} consistent", tokens[1]));
            }
            _ => return Err(format!("invalid load balancing method {:?}", method)),
        }
    }

    let normalized = tokens.join(" ");
    if VALID_LB_METHODS.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(format!("invalid load balancing method {:?}", method))
    }
}

const TIME_UNITS: &[&str] = &["ms", "s", "m", "h", "d", "w", "M", "y"];

/// Parse a proxy time value such as `60s`, `1m 30s` or a bare `30`.
pub fn parse_time(value: &str) -> Result<String, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("invalid time string".to_string());
    }

    for token in value.split_whitespace() {
        let digits_end = token
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(token.len());
        let (digits, unit) = token.split_at(digits_end);
        if digits.is_empty() || (!unit.is_empty() && !TIME_UNITS.contains(&unit)) {
            return Err("invalid time string".to_string());
        }
    }

    Ok(value.to_string())
}

/// Parse a proxy size value such as `1024`, `8k` or `1m`.
pub fn parse_size(value: &str) -> Result<String, String> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => value.split_at(pos),
        None => (value, ""),
    };

    if digits.is_empty() || !matches!(unit, "" | "k" | "K" | "m" | "M" | "g" | "G") {
        return Err("invalid size string".to_string());
    }

    Ok(value.to_string())
}

/// Parse a boolean ConfigMap value.
pub fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("invalid boolean {:?}", other)),
    }
}
