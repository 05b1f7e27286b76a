use crate::registry::ServiceInstance;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_ALPHA: f64 = 0.2;
const DEFAULT_INITIAL_LATENCY_MS: u64 = 20;
const FAILURE_PENALTY: Duration = Duration::from_secs(30);

/// Weighted response time: pick the instance with the lowest EWMA latency.
///
/// EWMA is updated via `alpha * new + (1 - alpha) * old` on each completed
/// call. Instances never observed start at the initial latency, so a fresh
/// instance gets traffic as soon as the others are slower than that.
pub struct ResponseTimeBalancer {
    /// Keyed by `service/instance_id`, stored as `f64::to_bits` nanoseconds.
    ewma: DashMap<String, Arc<AtomicU64>>,
    alpha: f64,
    initial_latency_ns: u64,
}

impl Default for ResponseTimeBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA, DEFAULT_INITIAL_LATENCY_MS)
    }
}

impl ResponseTimeBalancer {
    pub fn new(alpha: f64, initial_latency_ms: u64) -> Self {
        Self {
            ewma: DashMap::new(),
            alpha: alpha.clamp(0.01, 1.0),
            initial_latency_ns: initial_latency_ms * 1_000_000,
        }
    }

    /// Index of the chosen instance plus a guard that feeds the observed
    /// latency back on drop.
    pub fn select(&self, instances: &[ServiceInstance]) -> Option<(usize, LatencyGuard)> {
        let (idx, _) = instances
            .iter()
            .enumerate()
            .map(|(i, inst)| (i, self.score(inst)))
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        let slot = self.slot(&instances[idx]);
        Some((
            idx,
            LatencyGuard {
                slot,
                start_time: Instant::now(),
                alpha: self.alpha,
                failed: false,
            },
        ))
    }

    /// Forget averages for instances that left the ledger.
    pub fn forget(&self, service: &str, instance_id: &str) {
        self.ewma.remove(&key(service, instance_id));
    }

    pub fn ewma_ms(&self, service: &str, instance_id: &str) -> Option<f64> {
        self.ewma
            .get(&key(service, instance_id))
            .map(|slot| f64::from_bits(slot.load(Ordering::Relaxed)) / 1_000_000.0)
    }

    fn score(&self, inst: &ServiceInstance) -> f64 {
        match self.ewma.get(&key(&inst.service_name, &inst.instance_id)) {
            Some(slot) => f64::from_bits(slot.load(Ordering::Relaxed)),
            None => self.initial_latency_ns as f64,
        }
    }

    fn slot(&self, inst: &ServiceInstance) -> Arc<AtomicU64> {
        let k = key(&inst.service_name, &inst.instance_id);
        if let Some(slot) = self.ewma.get(&k) {
            return slot.value().clone();
        }
        self.ewma
            .entry(k)
            .or_insert_with(|| Arc::new(AtomicU64::new((self.initial_latency_ns as f64).to_bits())))
            .clone()
    }

    #[cfg(test)]
    fn observe(&self, inst: &ServiceInstance, latency: Duration) {
        update_latency(&self.slot(inst), latency.as_nanos() as u64, self.alpha);
    }
}

fn key(service: &str, instance_id: &str) -> String {
    format!("{}/{}", service, instance_id)
}

#[inline]
fn update_latency(slot: &AtomicU64, new_latency_ns: u64, alpha: f64) {
    let new_latency = new_latency_ns as f64;
    let current = f64::from_bits(slot.load(Ordering::Relaxed));
    let new_ewma = alpha * new_latency + (1.0 - alpha) * current;
    slot.store(new_ewma.to_bits(), Ordering::Relaxed);
}

/// RAII guard that records latency on drop.
pub struct LatencyGuard {
    slot: Arc<AtomicU64>,
    start_time: Instant,
    alpha: f64,
    failed: bool,
}

impl LatencyGuard {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for LatencyGuard {
    fn drop(&mut self) {
        let latency_ns = if self.failed {
            FAILURE_PENALTY.as_nanos() as u64
        } else {
            self.start_time.elapsed().as_nanos() as u64
        };
        update_latency(&self.slot, latency_ns, self.alpha);
    }
}
