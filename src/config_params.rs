//! Global configuration defaults
//!
//! Holds the built-in proxy defaults, applies overrides from the global
//! ConfigMap, and hands out immutable version-stamped snapshots to
//! resolvers. A resource-level field always wins over a ConfigMap value,
//! which wins over the built-in default.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::validation::{parse_bool, parse_lb_method, parse_size, parse_time};

/// Process-wide proxy defaults.
///
/// `lb_method` is stored in resolved form: the empty string means the
/// proxy's own default (round_robin), so the renderer omits the directive.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigParams {
    pub lb_method: String,
    pub max_fails: i64,
    pub fail_timeout: String,
    pub keepalive: i64,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub proxy_send_timeout: String,
    pub client_max_body_size: String,
    pub proxy_buffering: bool,
    pub server_tokens: String,
    pub http2: bool,
    pub proxy_protocol: bool,
    pub server_snippets: Vec<String>,
    pub location_snippets: Vec<String>,
}

impl Default for ConfigParams {
    fn default() -> Self {
        Self {
            lb_method: "random two least_conn".to_string(),
            max_fails: 1,
            fail_timeout: "10s".to_string(),
            keepalive: 0,
            proxy_connect_timeout: "60s".to_string(),
            proxy_read_timeout: "60s".to_string(),
            proxy_send_timeout: "60s".to_string(),
            client_max_body_size: "1m".to_string(),
            proxy_buffering: true,
            server_tokens: "on".to_string(),
            http2: false,
            proxy_protocol: false,
            server_snippets: Vec::new(),
            location_snippets: Vec::new(),
        }
    }
}

/// Parse the global ConfigMap into a full ConfigParams.
///
/// Starts from the built-in defaults and applies every recognized key.
/// Unrecognized keys are ignored. Any invalid value rejects the whole
/// update: the caller keeps the previous snapshot live.
pub fn parse_config_map(cm: &ConfigMap) -> Result<ConfigParams, Vec<String>> {
    let mut params = ConfigParams::default();
    let mut errors = Vec::new();
    let empty = BTreeMap::new();
    let data = cm.data.as_ref().unwrap_or(&empty);

    for (key, value) in data {
        match key.as_str() {
            "lb-method" => match parse_lb_method(value) {
                Ok(method) => params.lb_method = method,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "max-fails" => match parse_non_negative(value) {
                Ok(n) => params.max_fails = n,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "fail-timeout" => match parse_time(value) {
                Ok(t) => params.fail_timeout = t,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "keepalive" => match parse_non_negative(value) {
                Ok(n) => params.keepalive = n,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "proxy-connect-timeout" => match parse_time(value) {
                Ok(t) => params.proxy_connect_timeout = t,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "proxy-read-timeout" => match parse_time(value) {
                Ok(t) => params.proxy_read_timeout = t,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "proxy-send-timeout" => match parse_time(value) {
                Ok(t) => params.proxy_send_timeout = t,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "client-max-body-size" => match parse_size(value) {
                Ok(s) => params.client_max_body_size = s,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "proxy-buffering" => match parse_bool(value) {
                Ok(b) => params.proxy_buffering = b,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "server-tokens" => match value.as_str() {
                "on" | "off" => params.server_tokens = value.clone(),
                _ => errors.push(format!("{}: must be \"on\" or \"off\"", key)),
            },
            "http2" => match parse_bool(value) {
                Ok(b) => params.http2 = b,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "proxy-protocol" => match parse_bool(value) {
                Ok(b) => params.proxy_protocol = b,
                Err(msg) => errors.push(format!("{}: {}", key, msg)),
            },
            "server-snippets" => {
                params.server_snippets = value.lines().map(str::to_string).collect();
            }
            "location-snippets" => {
                params.location_snippets = value.lines().map(str::to_string).collect();
            }
            _ => {
                debug!(key = %key, "ignoring unrecognized ConfigMap key");
            }
        }
    }

    if errors.is_empty() {
        Ok(params)
    } else {
        Err(errors)
    }
}

fn parse_non_negative(value: &str) -> Result<i64, String> {
    match value.trim().parse::<i64>() {
        Ok(n) if n >= 0 => Ok(n),
        Ok(_) => Err("must be positive or zero".to_string()),
        Err(_) => Err(format!("invalid integer {:?}", value)),
    }
}

/// Immutable version-stamped snapshot of the defaults
#[derive(Clone, Debug)]
pub struct ParamsSnapshot {
    pub version: u64,
    pub params: Arc<ConfigParams>,
}

/// Shared holder for the current snapshot.
///
/// Only the ConfigMap watcher swaps it; resolvers take copies, so an
/// in-flight resolve never observes a partially applied update.
pub struct ParamsHolder {
    inner: RwLock<ParamsSnapshot>,
}

impl ParamsHolder {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ParamsSnapshot {
                version: 0,
                params: Arc::new(ConfigParams::default()),
            }),
        }
    }

    pub async fn current(&self) -> ParamsSnapshot {
        self.inner.read().await.clone()
    }

    /// Install a new set of defaults, bumping the version. Returns the new
    /// version number.
    pub async fn swap(&self, params: ConfigParams) -> u64 {
        let mut guard = self.inner.write().await;
        guard.version += 1;
        guard.params = Arc::new(params);
        guard.version
    }
}

impl Default for ParamsHolder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("routegate-config".to_string()),
                namespace: Some("routegate-system".to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_builtin_defaults() {
        let params = ConfigParams::default();
        assert_eq!(params.lb_method, "random two least_conn");
        assert_eq!(params.max_fails, 1);
        assert_eq!(params.fail_timeout, "10s");
        assert_eq!(params.proxy_connect_timeout, "60s");
        assert_eq!(params.keepalive, 0);
    }

    #[test]
    fn test_parse_overrides() {
        let cm = config_map(&[
            ("proxy-connect-timeout", "44s"),
            ("max-fails", "5"),
            ("lb-method", "round_robin"),
            ("keepalive", "32"),
        ]);
        let params = parse_config_map(&cm).unwrap();
        assert_eq!(params.proxy_connect_timeout, "44s");
        assert_eq!(params.max_fails, 5);
        assert_eq!(params.lb_method, "");
        assert_eq!(params.keepalive, 32);
        // untouched keys keep their built-ins
        assert_eq!(params.fail_timeout, "10s");
    }

    #[test]
    fn test_invalid_value_rejects_whole_update() {
        let cm = config_map(&[
            ("proxy-connect-timeout", "44s"),
            ("max-fails", "minus-one"),
        ]);
        let errs = parse_config_map(&cm).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].starts_with("max-fails:"));
    }

    #[test]
    fn test_all_errors_reported() {
        let cm = config_map(&[
            ("proxy-read-timeout", "fast"),
            ("keepalive", "-2"),
            ("lb-method", "fastest"),
        ]);
        let errs = parse_config_map(&cm).unwrap_err();
        assert_eq!(errs.len(), 3);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let cm = config_map(&[("no-such-key", "whatever")]);
        let params = parse_config_map(&cm).unwrap();
        assert_eq!(params, ConfigParams::default());
    }

    #[test]
    fn test_snippets_split_lines() {
        let cm = config_map(&[("server-snippets", "deny 10.0.0.0/8;\nallow all;")]);
        let params = parse_config_map(&cm).unwrap();
        assert_eq!(
            params.server_snippets,
            vec!["deny 10.0.0.0/8;".to_string(), "allow all;".to_string()]
        );
    }

    #[tokio::test]
    async fn test_holder_versioning() {
        let holder = ParamsHolder::new();
        assert_eq!(holder.current().await.version, 0);

        let before = holder.current().await;
        let v1 = holder
            .swap(ConfigParams {
                max_fails: 7,
                ..ConfigParams::default()
            })
            .await;
        assert_eq!(v1, 1);
        // the old snapshot is unaffected by the swap
        assert_eq!(before.params.max_fails, 1);
        assert_eq!(holder.current().await.params.max_fails, 7);
    }
}
