use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Later calls return a handle to the same recorder.
    pub fn install() -> anyhow::Result<Self> {
        if let Some(handle) = HANDLE.get() {
            return Ok(Self {
                handle: handle.clone(),
            });
        }

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .build_recorder();
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_ok() {
            let _ = HANDLE.set(handle.clone());
            describe_all();
            tracing::info!("metrics: prometheus recorder installed");
            return Ok(Self { handle });
        }

        // Lost the race to a concurrent install, or a foreign recorder owns the slot.
        if let Some(installed) = HANDLE.get() {
            return Ok(Self {
                handle: installed.clone(),
            });
        }
        tracing::warn!("metrics: a global recorder is already installed, /metrics will be empty");
        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

enum Kind {
    Counter,
    Gauge,
    Histogram,
}

const DESCRIPTIONS: &[(Kind, &str, Unit, &str)] = &[
    // request path
    (Kind::Counter, "waypoint_http_requests_total", Unit::Count, "Total HTTP requests processed"),
    (
        Kind::Histogram,
        "waypoint_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective",
    ),
    (
        Kind::Histogram,
        "waypoint_downstream_request_duration_seconds",
        Unit::Seconds,
        "Time spent waiting for the downstream instance",
    ),
    (Kind::Gauge, "waypoint_http_requests_in_flight", Unit::Count, "Requests currently being processed"),
    (Kind::Counter, "waypoint_gateway_errors_total", Unit::Count, "Gateway-side failures by kind"),
    (Kind::Counter, "waypoint_fallback_responses_total", Unit::Count, "Failures answered by a route fallback"),
    // rate limiting
    (Kind::Counter, "waypoint_rate_limit_rejected_total", Unit::Count, "Requests rejected by a rate limiter"),
    (Kind::Counter, "waypoint_rate_limit_allowed_total", Unit::Count, "Requests admitted by a rate limiter"),
    // registry
    (Kind::Gauge, "waypoint_registry_instances", Unit::Count, "Registered instances after the last sweep"),
    (
        Kind::Counter,
        "waypoint_registry_registrations_total",
        Unit::Count,
        "Register calls, including re-registrations",
    ),
    (Kind::Counter, "waypoint_registry_heartbeats_total", Unit::Count, "Heartbeats accepted"),
    (Kind::Counter, "waypoint_registry_evictions_total", Unit::Count, "Instances evicted for an expired lease"),
    (
        Kind::Counter,
        "waypoint_registry_self_preservation_total",
        Unit::Count,
        "Sweeps skipped because self-preservation engaged",
    ),
    // circuit breaker
    (
        Kind::Gauge,
        "waypoint_breaker_state",
        Unit::Count,
        "Breaker state per target: 0=closed 1=open 2=half_open",
    ),
    (Kind::Counter, "waypoint_breaker_transitions_total", Unit::Count, "Breaker state transitions"),
    (Kind::Counter, "waypoint_breaker_rejections_total", Unit::Count, "Calls rejected by an open breaker"),
    // listeners
    (Kind::Gauge, "waypoint_connections_active", Unit::Count, "Open client connections on the proxy listener"),
    (Kind::Counter, "waypoint_connections_total", Unit::Count, "Proxy listener accepts by status"),
    // config
    (Kind::Gauge, "waypoint_config_routes_total", Unit::Count, "Routes currently loaded"),
    (Kind::Counter, "waypoint_config_reloads_total", Unit::Count, "Route reload attempts by result"),
];

fn describe_all() {
    for (kind, name, unit, help) in DESCRIPTIONS {
        let (name, unit, help) = (*name, unit.clone(), *help);
        match kind {
            Kind::Counter => describe_counter!(name, unit, help),
            Kind::Gauge => describe_gauge!(name, unit, help),
            Kind::Histogram => describe_histogram!(name, unit, help),
        }
    }
}
