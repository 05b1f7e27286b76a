use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Ordered route list. Declaration order is match order.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Registration API, dashboards, health and metrics.
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Lease applied when a registration does not carry its own TTL.
    #[serde(default = "default_lease_secs")]
    pub default_lease_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Extra time past lease expiry before the monitor evicts an instance.
    #[serde(default = "default_grace_window")]
    pub grace_window_secs: u64,

    #[serde(default)]
    pub self_preservation: SelfPreservationConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_lease_secs: default_lease_secs(),
            sweep_interval_secs: default_sweep_interval(),
            grace_window_secs: default_grace_window(),
            self_preservation: SelfPreservationConfig::default(),
        }
    }
}

fn default_lease_secs() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_grace_window() -> u64 {
    5
}

/// A sweep that would evict more than `threshold` of all instances is
/// treated as a partition on our side and skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfPreservationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fraction in (0, 1].
    #[serde(default = "default_self_preservation_threshold")]
    pub threshold: f64,

    /// Below this many registered instances the policy does not apply.
    #[serde(default = "default_self_preservation_min_instances")]
    pub min_instances: usize,
}

impl Default for SelfPreservationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_self_preservation_threshold(),
            min_instances: default_self_preservation_min_instances(),
        }
    }
}

fn default_self_preservation_threshold() -> f64 {
    0.85
}

fn default_self_preservation_min_instances() -> usize {
    3
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Percentage in (0, 100].
    #[serde(default = "default_cb_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Size of the outcome window the failure rate is computed over.
    #[serde(default = "default_cb_minimum_number_of_calls")]
    pub minimum_number_of_calls: u32,

    #[serde(default = "default_cb_wait_duration")]
    pub wait_duration_in_open_state_secs: u64,

    #[serde(default = "default_cb_permitted_calls_in_half_open")]
    pub permitted_calls_in_half_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_cb_failure_rate_threshold(),
            minimum_number_of_calls: default_cb_minimum_number_of_calls(),
            wait_duration_in_open_state_secs: default_cb_wait_duration(),
            permitted_calls_in_half_open: default_cb_permitted_calls_in_half_open(),
        }
    }
}

fn default_cb_failure_rate_threshold() -> f64 {
    50.0
}

fn default_cb_minimum_number_of_calls() -> u32 {
    10
}

fn default_cb_wait_duration() -> u64 {
    60
}

fn default_cb_permitted_calls_in_half_open() -> u32 {
    3
}

/// Partial per-target breaker settings; absent fields fall back to the
/// `[breaker]` defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default)]
    pub failure_rate_threshold: Option<f64>,
    #[serde(default)]
    pub minimum_number_of_calls: Option<u32>,
    #[serde(default)]
    pub wait_duration_in_open_state_secs: Option<u64>,
    #[serde(default)]
    pub permitted_calls_in_half_open: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(flatten)]
    pub defaults: CircuitBreakerConfig,

    /// Keyed by target service name.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub targets: HashMap<String, BreakerOverride>,
}

impl BreakerConfig {
    /// Effective settings for `target`: its override merged over the defaults.
    pub fn for_target(&self, target: &str) -> CircuitBreakerConfig {
        let d = &self.defaults;
        match self.targets.get(target) {
            Some(o) => CircuitBreakerConfig {
                failure_rate_threshold: o
                    .failure_rate_threshold
                    .unwrap_or(d.failure_rate_threshold),
                minimum_number_of_calls: o
                    .minimum_number_of_calls
                    .unwrap_or(d.minimum_number_of_calls),
                wait_duration_in_open_state_secs: o
                    .wait_duration_in_open_state_secs
                    .unwrap_or(d.wait_duration_in_open_state_secs),
                permitted_calls_in_half_open: o
                    .permitted_calls_in_half_open
                    .unwrap_or(d.permitted_calls_in_half_open),
            },
            None => d.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upper bound on one downstream call, connect through response headers.
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,

    /// "round_robin" (default), "random", "weighted_response_time".
    #[serde(default = "default_load_balancer")]
    pub load_balancer: String,

    /// "strict" rejects overlapping route predicates at load time,
    /// "first_declared" accepts them and resolves by declaration order.
    #[serde(default = "default_route_overlap")]
    pub route_overlap: String,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            load_balancer: default_load_balancer(),
            route_overlap: default_route_overlap(),
            keepalive_pool: KeepalivePoolConfig::default(),
        }
    }
}

fn default_timeout() -> f64 {
    5.0
}

fn default_connect_timeout() -> f64 {
    1.0
}

fn default_load_balancer() -> String {
    "round_robin".to_string()
}

fn default_route_overlap() -> String {
    "strict".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    /// Idle connection timeout in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Max idle connections per downstream host.
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            size: default_pool_size(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    320
}

/// One routing rule: predicate → target service → filter chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// Path pattern: literals, `*` (one segment), `{name}` (one segment,
    /// captured) and a trailing `**` (any remainder).
    pub path: String,

    /// Allowed HTTP methods. Empty means all methods.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    /// Header matchers (AND semantics).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub headers: Vec<HeaderMatcher>,

    pub target_service: String,

    /// Overrides `proxy.load_balancer` for this route.
    #[serde(default)]
    pub load_balancer: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: Vec<FilterConfig>,
}

/// Supports exact (default), prefix, regex, and presence-only match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderMatcher {
    pub name: String,

    /// Ignored when `match_type` is "present".
    #[serde(default)]
    pub value: String,

    /// "exact" (default), "prefix", "regex", "present".
    #[serde(default = "default_header_match_type")]
    pub match_type: String,

    #[serde(default)]
    pub invert: bool,
}

fn default_header_match_type() -> String {
    "exact".to_string()
}

/// Declarative filter entry, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    RateLimit(RateLimitConfig),
    StripPrefix {
        #[serde(default = "default_strip_parts")]
        parts: usize,
    },
    PrefixPath {
        prefix: String,
    },
    SetRequestHeader {
        name: String,
        value: String,
    },
    AddRequestHeader {
        name: String,
        value: String,
    },
    RemoveRequestHeader {
        name: String,
    },
    SetResponseHeader {
        name: String,
        value: String,
    },
    AddResponseHeader {
        name: String,
        value: String,
    },
    RemoveResponseHeader {
        name: String,
    },
    Fallback {
        #[serde(default = "default_fallback_status")]
        status: u16,
        #[serde(default)]
        body: String,
        #[serde(default = "default_fallback_content_type")]
        content_type: String,
    },
}

fn default_strip_parts() -> usize {
    1
}

fn default_fallback_status() -> u16 {
    503
}

fn default_fallback_content_type() -> String {
    "application/json".to_string()
}

/// Token bucket (mode "req") or sliding window count (mode "count").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_limit_mode")]
    pub mode: String,

    /// Tokens refilled per second.
    #[serde(default)]
    pub rate: Option<f64>,

    /// Bucket capacity; defaults to one second of refill.
    #[serde(default)]
    pub burst: Option<u64>,

    #[serde(default)]
    pub count: Option<u64>,

    #[serde(default)]
    pub time_window: Option<u64>,

    /// "route" (default), "remote_addr", "uri", "host_uri".
    #[serde(default = "default_limit_key")]
    pub key: String,

    #[serde(default = "default_rejected_code")]
    pub rejected_code: u16,
}

fn default_limit_mode() -> String {
    "req".to_string()
}

fn default_limit_key() -> String {
    "route".to_string()
}

fn default_rejected_code() -> u16 {
    429
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_full_serde() {
        let json = r#"{
            "id": "orders",
            "path": "/orders/**",
            "methods": ["GET", "POST"],
            "headers": [
                {"name": "X-Canary", "value": "true"}
            ],
            "target_service": "order-service",
            "load_balancer": "random",
            "filters": [
                {"type": "rate_limit", "rate": 100.0, "burst": 20, "key": "remote_addr"},
                {"type": "strip_prefix", "parts": 1},
                {"type": "set_request_header", "name": "X-Env", "value": "prod"},
                {"type": "remove_response_header", "name": "Server"},
                {"type": "fallback", "body": "{\"orders\":[]}"}
            ]
        }"#;

        let route: RouteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(route.id, "orders");
        assert_eq!(route.path, "/orders/**");
        assert_eq!(route.methods, vec!["GET", "POST"]);
        assert_eq!(route.target_service, "order-service");
        assert_eq!(route.load_balancer.as_deref(), Some("random"));
        assert_eq!(route.headers[0].match_type, "exact");
        assert!(!route.headers[0].invert);
        assert_eq!(route.filters.len(), 5);

        match &route.filters[0] {
            FilterConfig::RateLimit(rl) => {
                assert_eq!(rl.mode, "req");
                assert_eq!(rl.rate, Some(100.0));
                assert_eq!(rl.burst, Some(20));
                assert_eq!(rl.key, "remote_addr");
                assert_eq!(rl.rejected_code, 429);
            }
            other => panic!("expected rate_limit, got {:?}", other),
        }
        assert!(matches!(
            route.filters[1],
            FilterConfig::StripPrefix { parts: 1 }
        ));
        match &route.filters[4] {
            FilterConfig::Fallback {
                status,
                body,
                content_type,
            } => {
                assert_eq!(*status, 503);
                assert_eq!(body, r#"{"orders":[]}"#);
                assert_eq!(content_type, "application/json");
            }
            other => panic!("expected fallback, got {:?}", other),
        }
    }

    #[test]
    fn test_route_null_collections() {
        let json = r#"{
            "id": "users",
            "path": "/users/**",
            "target_service": "user-service",
            "methods": null,
            "headers": null,
            "filters": null
        }"#;
        let route: RouteConfig = serde_json::from_str(json).unwrap();
        assert!(route.methods.is_empty());
        assert!(route.headers.is_empty());
        assert!(route.filters.is_empty());
        assert!(route.load_balancer.is_none());
    }

    #[test]
    fn test_breaker_override_merges_over_defaults() {
        let toml_str = r#"
            failure_rate_threshold = 40.0
            minimum_number_of_calls = 20

            [targets.order-service]
            minimum_number_of_calls = 4
        "#;
        let cfg: BreakerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.defaults.failure_rate_threshold, 40.0);
        assert_eq!(cfg.defaults.wait_duration_in_open_state_secs, 60);

        let order = cfg.for_target("order-service");
        assert_eq!(order.failure_rate_threshold, 40.0);
        assert_eq!(order.minimum_number_of_calls, 4);
        assert_eq!(order.permitted_calls_in_half_open, 3);

        let other = cfg.for_target("user-service");
        assert_eq!(other.minimum_number_of_calls, 20);
    }

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
        assert_eq!(cfg.registry.default_lease_secs, 30);
        assert_eq!(cfg.registry.sweep_interval_secs, 5);
        assert!(cfg.registry.self_preservation.enabled);
        assert_eq!(cfg.breaker.defaults.failure_rate_threshold, 50.0);
        assert_eq!(cfg.proxy.load_balancer, "round_robin");
        assert_eq!(cfg.proxy.route_overlap, "strict");
        assert!(cfg.routes.is_empty());
    }
}
