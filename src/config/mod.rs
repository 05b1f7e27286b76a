pub mod types;


pub use types::*;

use crate::routing::OverlapPolicy;
use crate::upstream::LbPolicy;
use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used, so the gateway starts with an empty
    /// route table for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;

        // Environment variable overrides for infrastructure settings.
        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            routes = config.routes.len(),
            breaker_overrides = config.breaker.targets.len(),
            "loaded gateway configuration"
        );
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(GatewayConfig::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        };
        Ok(config)
    }

    /// Apply environment variable overrides for listener and registry
    /// settings. Routes and breaker thresholds stay in the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WAYPOINT_LISTEN") {
            self.server.listen = v;
        }
        if let Ok(v) = std::env::var("WAYPOINT_ADMIN_LISTEN") {
            self.server.admin_listen = v;
        }

        // Registry
        if let Ok(v) = std::env::var("WAYPOINT_REGISTRY_DEFAULT_LEASE") {
            if let Ok(n) = v.parse::<u64>() {
                self.registry.default_lease_secs = n;
            }
        }
        if let Ok(v) = std::env::var("WAYPOINT_REGISTRY_SWEEP_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.registry.sweep_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("WAYPOINT_REGISTRY_GRACE_WINDOW") {
            if let Ok(n) = v.parse::<u64>() {
                self.registry.grace_window_secs = n;
            }
        }
        if let Ok(v) = std::env::var("WAYPOINT_REGISTRY_SELF_PRESERVATION") {
            self.registry.self_preservation.enabled = v == "true" || v == "1";
        }

        // Proxy
        if let Ok(v) = std::env::var("WAYPOINT_PROXY_TIMEOUT") {
            if let Ok(n) = v.parse::<f64>() {
                self.proxy.timeout_secs = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.default_lease_secs == 0 {
            anyhow::bail!("registry.default_lease_secs must be > 0");
        }
        if self.registry.sweep_interval_secs == 0 {
            anyhow::bail!("registry.sweep_interval_secs must be > 0");
        }
        let sp = &self.registry.self_preservation;
        if !(sp.threshold > 0.0 && sp.threshold <= 1.0) {
            anyhow::bail!(
                "registry.self_preservation.threshold must be in (0, 1], got {}",
                sp.threshold
            );
        }

        validate_breaker("breaker", &self.breaker.defaults)?;
        for name in self.breaker.targets.keys() {
            validate_breaker(&format!("breaker.targets.{}", name), &self.breaker.for_target(name))?;
        }

        if !(self.proxy.timeout_secs > 0.0) {
            anyhow::bail!("proxy.timeout_secs must be > 0");
        }
        if LbPolicy::parse(&self.proxy.load_balancer).is_none() {
            anyhow::bail!("proxy.load_balancer: unknown policy '{}'", self.proxy.load_balancer);
        }
        if OverlapPolicy::parse(&self.proxy.route_overlap).is_none() {
            anyhow::bail!(
                "proxy.route_overlap: unknown policy '{}', use 'strict' or 'first_declared'",
                self.proxy.route_overlap
            );
        }

        let mut ids = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                anyhow::bail!("route with path '{}' has empty id", route.path);
            }
            if !ids.insert(route.id.as_str()) {
                anyhow::bail!("duplicate route id '{}'", route.id);
            }
            if route.target_service.is_empty() {
                anyhow::bail!("route '{}' has empty target_service", route.id);
            }
            if !route.path.starts_with('/') {
                anyhow::bail!("route '{}' path '{}' must start with '/'", route.id, route.path);
            }
            if let Some(ref lb) = route.load_balancer {
                if LbPolicy::parse(lb).is_none() {
                    anyhow::bail!("route '{}': unknown load_balancer '{}'", route.id, lb);
                }
            }
            for filter in &route.filters {
                validate_filter(&route.id, filter)?;
            }
        }
        Ok(())
    }
}

fn validate_breaker(section: &str, cb: &CircuitBreakerConfig) -> Result<()> {
    if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 100.0) {
        anyhow::bail!(
            "{}: failure_rate_threshold must be in (0, 100], got {}",
            section,
            cb.failure_rate_threshold
        );
    }
    if cb.minimum_number_of_calls == 0 {
        anyhow::bail!("{}: minimum_number_of_calls must be > 0", section);
    }
    if cb.permitted_calls_in_half_open == 0 {
        anyhow::bail!("{}: permitted_calls_in_half_open must be > 0", section);
    }
    Ok(())
}

fn validate_filter(route_id: &str, filter: &FilterConfig) -> Result<()> {
    match filter {
        FilterConfig::RateLimit(rl) => match rl.mode.as_str() {
            "req" => {
                if !rl.rate.is_some_and(|r| r > 0.0) {
                    anyhow::bail!(
                        "route '{}': rate_limit mode 'req' requires a positive 'rate'",
                        route_id
                    );
                }
            }
            "count" | "sliding_window" => {
                if rl.count.is_none() || rl.time_window.is_none() {
                    anyhow::bail!(
                        "route '{}': rate_limit mode '{}' requires 'count' and 'time_window'",
                        route_id,
                        rl.mode
                    );
                }
            }
            other => anyhow::bail!("route '{}': unknown rate_limit mode '{}'", route_id, other),
        },
        FilterConfig::PrefixPath { prefix } => {
            if !prefix.starts_with('/') {
                anyhow::bail!("route '{}': prefix_path '{}' must start with '/'", route_id, prefix);
            }
        }
        FilterConfig::Fallback { status, .. } => {
            if http::StatusCode::from_u16(*status).is_err() {
                anyhow::bail!("route '{}': fallback status {} is invalid", route_id, status);
            }
        }
        FilterConfig::SetRequestHeader { name, .. }
        | FilterConfig::AddRequestHeader { name, .. }
        | FilterConfig::RemoveRequestHeader { name }
        | FilterConfig::SetResponseHeader { name, .. }
        | FilterConfig::AddResponseHeader { name, .. }
        | FilterConfig::RemoveResponseHeader { name } => {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                anyhow::bail!("route '{}': invalid header name '{}'", route_id, name);
            }
        }
        FilterConfig::StripPrefix { .. } => {}
    }
    Ok(())
}
