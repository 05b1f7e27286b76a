use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::proxy::{Forwarder, GatewayRouter, HyperForwarder};
use crate::registry::{system_clock, InstanceLedger, LeaseMonitor, MonitorSettings, SharedClock};
use crate::routing::RouteTable;
use crate::upstream::{BreakerBank, LoadBalancer};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Reads of the config and route table go through `ArcSwap::load` and are
/// lock-free. Reloads are serialized through `config_mu`.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub ledger: Arc<InstanceLedger>,
    pub breakers: Arc<BreakerBank>,
    pub lb: Arc<LoadBalancer>,
    pub route_table: Arc<ArcSwap<RouteTable>>,
    pub router: Arc<GatewayRouter>,
    config_path: Option<PathBuf>,
    config_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    /// Production wiring: wall clock and the pooled hyper forwarder.
    pub fn new(config: GatewayConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let forwarder = Arc::new(HyperForwarder::new(&config.proxy));
        Self::with_parts(config, config_path, system_clock(), forwarder)
    }

    pub fn with_parts(
        config: GatewayConfig,
        config_path: Option<PathBuf>,
        clock: SharedClock,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::install()?;
        let route_table = RouteTable::from_config(&config)?;
        metrics::gauge!("waypoint_config_routes_total").set(route_table.route_count() as f64);

        let ledger = Arc::new(InstanceLedger::new(clock.clone()));
        let breakers = Arc::new(BreakerBank::new(config.breaker.clone(), clock));
        let lb = Arc::new(LoadBalancer::new());
        let route_table = Arc::new(ArcSwap::from_pointee(route_table));

        let router = Arc::new(GatewayRouter::new(
            route_table.clone(),
            ledger.clone(),
            breakers.clone(),
            lb.clone(),
            forwarder,
            Duration::from_secs_f64(config.proxy.timeout_secs),
        ));

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            metrics,
            ledger,
            breakers,
            lb,
            route_table,
            router,
            config_path,
            config_mu: Arc::new(Mutex::new(())),
        })
    }

    pub fn lease_monitor(&self) -> LeaseMonitor {
        let settings = MonitorSettings::from(&self.config.load().registry);
        LeaseMonitor::new(self.ledger.clone(), settings)
    }

    /// Lease applied when a registration does not name one.
    pub fn default_lease(&self) -> Duration {
        Duration::from_secs(self.config.load().registry.default_lease_secs)
    }

    /// Re-read the config file and apply its routes and breaker settings.
    pub async fn reload_routes(&self) -> Result<usize, GatewayError> {
        let Some(ref path) = self.config_path else {
            return Err(GatewayError::Config(
                "gateway was started without a config file".into(),
            ));
        };
        let fresh = GatewayConfig::load(path).map_err(|e| GatewayError::Config(e.to_string()))?;
        self.apply_routes(fresh).await
    }

    /// Swap in the route table and breaker thresholds from `fresh`.
    ///
    /// The table is built before anything is swapped, so a bad config leaves
    /// the running table untouched. Listener, registry and timeout settings
    /// only take effect on restart.
    pub async fn apply_routes(&self, fresh: GatewayConfig) -> Result<usize, GatewayError> {
        let _guard = self.config_mu.lock().await;

        let built = fresh
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))
            .and_then(|()| RouteTable::from_config(&fresh));
        let table = match built {
            Ok(t) => t,
            Err(e) => {
                metrics::counter!("waypoint_config_reloads_total", "result" => "error")
                    .increment(1);
                return Err(e);
            }
        };
        let count = table.route_count();

        let mut merged = (**self.config.load()).clone();
        merged.routes = fresh.routes;
        merged.breaker = fresh.breaker;
        merged.proxy.load_balancer = fresh.proxy.load_balancer;
        merged.proxy.route_overlap = fresh.proxy.route_overlap;

        self.route_table.store(Arc::new(table));
        self.breakers.reconfigure(merged.breaker.clone());
        self.config.store(Arc::new(merged));

        metrics::gauge!("waypoint_config_routes_total").set(count as f64);
        metrics::counter!("waypoint_config_reloads_total", "result" => "success").increment(1);
        info!("config: routes reloaded, count={}", count);
        Ok(count)
    }
}
