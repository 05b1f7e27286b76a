pub mod random;
pub mod response_time;
pub mod round_robin;

use crate::registry::ServiceInstance;
use random::RandomBalancer;
use response_time::{LatencyGuard, ResponseTimeBalancer};
use round_robin::RoundRobinBalancer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbPolicy {
    RoundRobin,
    Random,
    WeightedResponseTime,
}

impl LbPolicy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "weighted_response_time" | "response_time" | "ewma" => {
                Some(Self::WeightedResponseTime)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::WeightedResponseTime => "weighted_response_time",
        }
    }
}

/// Picks one instance out of a healthy-instance snapshot.
///
/// Holds the per-policy state shared by every route: round-robin counters
/// keyed by target service and latency averages keyed by instance.
#[derive(Default)]
pub struct LoadBalancer {
    round_robin: RoundRobinBalancer,
    random: RandomBalancer,
    response_time: ResponseTimeBalancer,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `instances` is expected in ledger order (sorted by instance id).
    pub fn select(
        &self,
        policy: LbPolicy,
        target: &str,
        mut instances: Vec<ServiceInstance>,
    ) -> Option<Selection> {
        if instances.is_empty() {
            return None;
        }
        match policy {
            LbPolicy::RoundRobin => {
                let idx = self.round_robin.next_index(target, instances.len());
                Some(Selection::plain(instances.swap_remove(idx)))
            }
            LbPolicy::Random => {
                let idx = self.random.next_index(instances.len());
                Some(Selection::plain(instances.swap_remove(idx)))
            }
            LbPolicy::WeightedResponseTime => {
                let (idx, guard) = self.response_time.select(&instances)?;
                Some(Selection {
                    instance: instances.swap_remove(idx),
                    latency_guard: Some(guard),
                })
            }
        }
    }

    pub fn response_time(&self) -> &ResponseTimeBalancer {
        &self.response_time
    }
}

/// The chosen instance. For the response-time policy it also carries a
/// guard that records the call's latency when dropped.
pub struct Selection {
    pub instance: ServiceInstance,
    latency_guard: Option<LatencyGuard>,
}

impl Selection {
    fn plain(instance: ServiceInstance) -> Self {
        Self {
            instance,
            latency_guard: None,
        }
    }

    /// Records a penalty latency instead of the measured one.
    pub fn mark_failed(&mut self) {
        if let Some(ref mut guard) = self.latency_guard {
            guard.mark_failed();
        }
    }
}
