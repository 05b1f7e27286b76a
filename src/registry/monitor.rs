use super::ledger::InstanceLedger;
use crate::config::{RegistryConfig, SelfPreservationConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub sweep_interval: Duration,
    pub grace_window: Duration,
    pub self_preservation: SelfPreservationConfig,
}

impl From<&RegistryConfig> for MonitorSettings {
    fn from(cfg: &RegistryConfig) -> Self {
        Self {
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs),
            grace_window: Duration::from_secs(cfg.grace_window_secs),
            self_preservation: cfg.self_preservation.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Evicted(usize),
    /// Too large a share of the ledger looked stale; nothing was evicted.
    SelfPreserved { expired: usize, total: usize },
    /// Another sweep was still running.
    Busy,
}

/// Periodically removes instances whose lease ran out more than the grace
/// window ago. The only component that evicts from the ledger.
pub struct LeaseMonitor {
    ledger: Arc<InstanceLedger>,
    settings: MonitorSettings,
    sweep_lock: Mutex<()>,
}

impl LeaseMonitor {
    pub fn new(ledger: Arc<InstanceLedger>, settings: MonitorSettings) -> Self {
        Self {
            ledger,
            settings,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn sweep_once(&self) -> SweepOutcome {
        let Some(_guard) = self.sweep_lock.try_lock() else {
            debug!("lease_monitor: previous sweep still running, skipping");
            return SweepOutcome::Busy;
        };

        let now = self.ledger.now();
        let Some(cutoff) = now.checked_sub(self.settings.grace_window) else {
            return SweepOutcome::Evicted(0);
        };

        let candidates = self.ledger.expired_before(cutoff);
        let total = self.ledger.instance_count();
        if candidates.is_empty() {
            metrics::gauge!("waypoint_registry_instances").set(total as f64);
            return SweepOutcome::Evicted(0);
        }

        let sp = &self.settings.self_preservation;
        if sp.enabled && total >= sp.min_instances {
            let ratio = candidates.len() as f64 / total as f64;
            if ratio > sp.threshold {
                warn!(
                    "lease_monitor: self-preservation engaged, {} of {} instances stale ({:.0}% > {:.0}%), skipping eviction",
                    candidates.len(),
                    total,
                    ratio * 100.0,
                    sp.threshold * 100.0
                );
                metrics::counter!("waypoint_registry_self_preservation_total").increment(1);
                metrics::gauge!("waypoint_registry_instances").set(total as f64);
                return SweepOutcome::SelfPreserved {
                    expired: candidates.len(),
                    total,
                };
            }
        }

        let mut evicted = 0;
        for (service, instance_id) in candidates {
            if self.ledger.evict_if_stale(&service, &instance_id, cutoff) {
                warn!(
                    "lease_monitor: evicted, service={}, instance={}",
                    service, instance_id
                );
                metrics::counter!("waypoint_registry_evictions_total", "service" => service)
                    .increment(1);
                evicted += 1;
            }
        }
        metrics::gauge!("waypoint_registry_instances").set(self.ledger.instance_count() as f64);
        SweepOutcome::Evicted(evicted)
    }

    /// Sweep every `sweep_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "lease_monitor: started, interval={:?}, grace={:?}",
            self.settings.sweep_interval, self.settings.grace_window
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let SweepOutcome::Evicted(n) = self.sweep_once() {
                        if n > 0 {
                            info!("lease_monitor: sweep evicted {} instance(s)", n);
                        }
                    }
                }
            }
        }
        info!("lease_monitor: stopped");
    }
}
