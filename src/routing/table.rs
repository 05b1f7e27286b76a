use crate::config::{GatewayConfig, HeaderMatcher, RouteConfig};
use crate::error::GatewayError;
use crate::proxy::filter::{build_route_filters, Filter};
use crate::routing::header::{compile_header_matchers, headers_match, CompiledHeaderMatcher};
use crate::routing::pattern::PathPattern;
use crate::upstream::LbPolicy;
use std::sync::Arc;

/// How construction treats two routes that can match the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Reject the table.
    #[default]
    Strict,
    /// Accept, warn, and let the earlier route win.
    FirstDeclared,
}

impl OverlapPolicy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "strict" => Some(Self::Strict),
            "first_declared" | "first_match" => Some(Self::FirstDeclared),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::FirstDeclared => "first_declared",
        }
    }
}

/// A route compiled from config: pattern parsed, matchers and filters built.
#[derive(Debug)]
pub struct CompiledRoute {
    pub id: String,
    pub path: PathPattern,
    /// Uppercased. Empty means all methods.
    pub methods: Vec<String>,
    pub header_matchers: Vec<CompiledHeaderMatcher>,
    header_config: Vec<HeaderMatcher>,
    pub target_service: String,
    /// Effective policy: the route override or the table default.
    pub load_balancer: LbPolicy,
    pub filters: Vec<Filter>,
}

impl CompiledRoute {
    fn compile(cfg: &RouteConfig, default_policy: LbPolicy) -> Result<Self, String> {
        if cfg.id.trim().is_empty() {
            return Err("route id must not be empty".into());
        }
        if cfg.target_service.trim().is_empty() {
            return Err(format!("route '{}': target_service must not be empty", cfg.id));
        }
        let path = PathPattern::parse(&cfg.path).map_err(|e| format!("route '{}': {}", cfg.id, e))?;
        let header_matchers =
            compile_header_matchers(&cfg.headers).map_err(|e| format!("route '{}': {}", cfg.id, e))?;
        let load_balancer = match cfg.load_balancer {
            Some(ref name) => LbPolicy::parse(name).ok_or_else(|| {
                format!("route '{}': unknown load_balancer '{}'", cfg.id, name)
            })?,
            None => default_policy,
        };
        let filters = build_route_filters(cfg).map_err(|e| format!("route '{}': {}", cfg.id, e))?;

        Ok(Self {
            id: cfg.id.clone(),
            path,
            methods: cfg.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            header_matchers,
            header_config: cfg.headers.clone(),
            target_service: cfg.target_service.clone(),
            load_balancer,
            filters,
        })
    }

    fn accepts_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Whether some request matches both routes. Routes with different
    /// header matchers are treated as discriminated by header.
    fn overlaps(&self, other: &CompiledRoute) -> bool {
        let methods_intersect = self.methods.is_empty()
            || other.methods.is_empty()
            || self.methods.iter().any(|m| other.methods.contains(m));
        methods_intersect && self.header_config == other.header_config && self.path.overlaps(&other.path)
    }
}

/// Result of a successful match.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<CompiledRoute>,
    /// `{name}` captures in pattern order.
    pub params: Vec<(String, String)>,
}

/// Ordered route list, first match wins.
///
/// Immutable once built. Reload builds a fresh table and swaps it in whole,
/// so a request only ever sees one version.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn new(
        configs: &[RouteConfig],
        overlap: OverlapPolicy,
        default_policy: LbPolicy,
    ) -> Result<Self, GatewayError> {
        let mut routes: Vec<Arc<CompiledRoute>> = Vec::with_capacity(configs.len());

        for cfg in configs {
            if routes.iter().any(|r| r.id == cfg.id) {
                return Err(GatewayError::Config(format!("duplicate route id '{}'", cfg.id)));
            }
            let route = CompiledRoute::compile(cfg, default_policy).map_err(GatewayError::Config)?;

            for earlier in &routes {
                if !earlier.overlaps(&route) {
                    continue;
                }
                match overlap {
                    OverlapPolicy::Strict => {
                        return Err(GatewayError::Config(format!(
                            "routes '{}' ({}) and '{}' ({}) overlap",
                            earlier.id,
                            earlier.path.as_str(),
                            route.id,
                            route.path.as_str()
                        )));
                    }
                    OverlapPolicy::FirstDeclared => {
                        tracing::warn!(
                            "routing: overlapping routes, winner={}, shadowed={}, path={}",
                            earlier.id,
                            route.id,
                            route.path.as_str()
                        );
                    }
                }
            }

            tracing::debug!(
                "routing: compiled route, id={}, path={}, target={}, lb={}, filters={}",
                route.id,
                route.path.as_str(),
                route.target_service,
                route.load_balancer.as_str(),
                route.filters.len()
            );
            routes.push(Arc::new(route));
        }

        tracing::info!(
            "routing: compiled route table, count={}, overlap={}",
            routes.len(),
            overlap.as_str()
        );
        Ok(Self { routes })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let overlap = OverlapPolicy::parse(&config.proxy.route_overlap).ok_or_else(|| {
            GatewayError::Config(format!(
                "unknown route_overlap policy '{}'",
                config.proxy.route_overlap
            ))
        })?;
        let lb = LbPolicy::parse(&config.proxy.load_balancer).ok_or_else(|| {
            GatewayError::Config(format!(
                "unknown load_balancer '{}'",
                config.proxy.load_balancer
            ))
        })?;
        Self::new(&config.routes, overlap, lb)
    }

    #[cfg(test)]
    fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    /// First route, in declared order, whose method, path and header
    /// predicates all accept the request.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
    ) -> Result<RouteMatch, GatewayError> {
        for route in &self.routes {
            if !route.accepts_method(method) {
                continue;
            }
            let Some(params) = route.path.captures(path) else {
                continue;
            };
            if !headers_match(&route.header_matchers, headers) {
                continue;
            }
            return Ok(RouteMatch {
                route: route.clone(),
                params,
            });
        }
        Err(GatewayError::NoRouteFound)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_route(id: &str, path: &str, target: &str) -> RouteConfig {
        RouteConfig {
            id: id.to_string(),
            path: path.to_string(),
            methods: vec![],
            headers: vec![],
            target_service: target.to_string(),
            load_balancer: None,
            filters: vec![],
        }
    }

    fn strict(routes: &[RouteConfig]) -> Result<RouteTable, GatewayError> {
        RouteTable::new(routes, OverlapPolicy::Strict, LbPolicy::RoundRobin)
    }

    fn empty_headers() -> http::HeaderMap {
        http::HeaderMap::new()
    }

    #[test]
    fn test_match_orders_route() {
        let table = strict(&[
            make_route("orders", "/orders/**", "order-service"),
            make_route("users", "/users/**", "user-service"),
        ])
        .unwrap();

        let m = table.match_route("GET", "/orders/42", &empty_headers()).unwrap();
        assert_eq!(m.route.id, "orders");
        assert_eq!(m.route.target_service, "order-service");

        let m = table.match_route("GET", "/users/7?x=1", &empty_headers()).unwrap();
        assert_eq!(m.route.target_service, "user-service");
    }

    #[test]
    fn test_no_route_found() {
        let table = strict(&[make_route("orders", "/orders/**", "order-service")]).unwrap();
        assert_eq!(
            table.match_route("GET", "/payments/1", &empty_headers()).unwrap_err(),
            GatewayError::NoRouteFound
        );
        assert_eq!(
            RouteTable::empty()
                .match_route("GET", "/", &empty_headers())
                .unwrap_err(),
            GatewayError::NoRouteFound
        );
    }

    #[test]
    fn test_match_is_deterministic() {
        let table = RouteTable::new(
            &[
                make_route("first", "/orders/{id}", "a"),
                make_route("second", "/orders/**", "b"),
            ],
            OverlapPolicy::FirstDeclared,
            LbPolicy::RoundRobin,
        )
        .unwrap();
        for _ in 0..100 {
            let m = table.match_route("GET", "/orders/42", &empty_headers()).unwrap();
            assert_eq!(m.route.id, "first");
        }
        let m = table
            .match_route("GET", "/orders/42/items", &empty_headers())
            .unwrap();
        assert_eq!(m.route.id, "second");
    }

    #[test]
    fn test_strict_rejects_overlap_naming_both() {
        let err = strict(&[
            make_route("all-orders", "/orders/**", "a"),
            make_route("one-order", "/orders/{id}", "b"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("all-orders"), "{}", msg);
        assert!(msg.contains("one-order"), "{}", msg);
    }

    #[test]
    fn test_disjoint_methods_do_not_overlap() {
        let mut get = make_route("get-order", "/orders/{id}", "reader");
        get.methods = vec!["get".into()];
        let mut put = make_route("put-order", "/orders/{id}", "writer");
        put.methods = vec!["PUT".into()];
        let table = strict(&[get, put]).unwrap();

        assert_eq!(
            table.match_route("GET", "/orders/1", &empty_headers()).unwrap().route.id,
            "get-order"
        );
        assert_eq!(
            table.match_route("PUT", "/orders/1", &empty_headers()).unwrap().route.id,
            "put-order"
        );
        assert!(table.match_route("DELETE", "/orders/1", &empty_headers()).is_err());
    }

    #[test]
    fn test_header_discriminated_routes() {
        let mut canary = make_route("canary", "/orders/**", "order-service-canary");
        canary.headers = vec![HeaderMatcher {
            name: "x-env".into(),
            value: "canary".into(),
            match_type: "exact".into(),
            invert: false,
        }];
        let stable = make_route("stable", "/orders/**", "order-service");
        let table = strict(&[canary, stable]).unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert("x-env", "canary".parse().unwrap());
        assert_eq!(
            table.match_route("GET", "/orders/1", &headers).unwrap().route.id,
            "canary"
        );
        assert_eq!(
            table.match_route("GET", "/orders/1", &empty_headers()).unwrap().route.id,
            "stable"
        );
    }

    #[test]
    fn test_path_params_captured() {
        let table = strict(&[make_route("item", "/orders/{id}/items/{item}", "a")]).unwrap();
        let m = table
            .match_route("GET", "/orders/42/items/7", &empty_headers())
            .unwrap();
        assert_eq!(
            m.params,
            vec![("id".into(), "42".into()), ("item".into(), "7".into())]
        );
    }

    #[test]
    fn test_construction_errors() {
        assert!(strict(&[make_route("a", "/x", "s"), make_route("a", "/y", "s")]).is_err());
        assert!(strict(&[make_route("a", "/x", "")]).is_err());
        assert!(strict(&[make_route("a", "x", "s")]).is_err());
        assert!(strict(&[make_route("a", "/a/**/b", "s")]).is_err());

        let mut bad_lb = make_route("a", "/x", "s");
        bad_lb.load_balancer = Some("least_conn".into());
        assert!(strict(&[bad_lb]).is_err());
    }

    #[test]
    fn test_route_lb_override() {
        let mut r = make_route("a", "/x", "s");
        r.load_balancer = Some("random".into());
        let table = RouteTable::new(
            &[r, make_route("b", "/y", "s")],
            OverlapPolicy::Strict,
            LbPolicy::WeightedResponseTime,
        )
        .unwrap();
        assert_eq!(table.routes()[0].load_balancer, LbPolicy::Random);
        assert_eq!(table.routes()[1].load_balancer, LbPolicy::WeightedResponseTime);
    }

    #[test]
    fn test_from_config() {
        let mut config = GatewayConfig::default();
        config.routes = vec![make_route("orders", "/orders/**", "order-service")];
        let table = RouteTable::from_config(&config).unwrap();
        assert_eq!(table.route_count(), 1);

        config.proxy.route_overlap = "newest".into();
        assert!(RouteTable::from_config(&config).is_err());
    }

    #[test]
    fn test_overlap_policy_parse() {
        assert_eq!(OverlapPolicy::parse("strict"), Some(OverlapPolicy::Strict));
        assert_eq!(
            OverlapPolicy::parse("first_declared"),
            Some(OverlapPolicy::FirstDeclared)
        );
        assert_eq!(OverlapPolicy::parse("other"), None);
    }
}
