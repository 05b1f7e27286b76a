use crate::config::{BreakerConfig, CircuitBreakerConfig};
use crate::registry::SharedClock;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-target granularity: each downstream service gets its own breaker,
/// guarded by its own lock. Lookups go through a sharded map, so traffic to
/// different services never contends.
pub struct BreakerBank {
    breakers: DashMap<String, Arc<TargetBreaker>>,
    config: ArcSwap<BreakerConfig>,
    clock: SharedClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

/// Result of checking the circuit breaker before a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Breaker is closed, proceed normally.
    Allowed,
    /// Breaker is half-open and this call is one of the admitted trials.
    Probe,
    /// Breaker is open (or the half-open trial budget is spent).
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerView {
    pub target: String,
    pub state: BreakerState,
    pub calls_in_window: usize,
    pub failure_rate: Option<f64>,
    pub opened_for_ms: Option<u64>,
    pub config: CircuitBreakerConfig,
}

struct TargetBreaker {
    inner: Mutex<BreakerInner>,
}

struct BreakerInner {
    state: BreakerState,
    /// Bumped on every transition. Permits only report into the generation
    /// that admitted them.
    generation: u64,
    /// Most recent outcomes while closed, `true` = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
    config: CircuitBreakerConfig,
}

impl BreakerBank {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            config: ArcSwap::from_pointee(config),
            clock,
        }
    }

    /// Whether a call to `target` may go out now.
    pub fn allow(&self, target: &str) -> bool {
        !matches!(self.check(target), BreakerCheck::Rejected)
    }

    pub fn check(&self, target: &str) -> BreakerCheck {
        self.admit(target).1
    }

    /// Admission with outcome bookkeeping attached. `None` when the breaker
    /// rejects the call.
    ///
    /// The permit reports its outcome through `BreakerPermit::record`. A
    /// trial permit dropped without a result (panic, cancelled request)
    /// counts as a failed trial so the half-open slot is never lost.
    pub fn acquire(&self, target: &str) -> Option<BreakerPermit> {
        let (breaker, check, generation) = self.admit(target);
        if check == BreakerCheck::Rejected {
            return None;
        }
        Some(BreakerPermit {
            breaker,
            target: target.to_string(),
            clock: self.clock.clone(),
            generation,
            check,
            settled: false,
        })
    }

    fn admit(&self, target: &str) -> (Arc<TargetBreaker>, BreakerCheck, u64) {
        let breaker = self.get_or_create(target);
        let now = self.clock.now();
        let mut inner = breaker.inner.lock();
        let result = match inner.state {
            BreakerState::Closed => BreakerCheck::Allowed,
            BreakerState::Open => {
                let wait = Duration::from_secs(inner.config.wait_duration_in_open_state_secs);
                let elapsed = inner.opened_at.is_some_and(|at| now >= at + wait);
                if elapsed {
                    inner.transition(target, BreakerState::HalfOpen);
                    inner.half_open_admitted = 1;
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_admitted < inner.config.permitted_calls_in_half_open {
                    inner.half_open_admitted += 1;
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected
                }
            }
        };
        let generation = inner.generation;
        drop(inner);

        if result == BreakerCheck::Rejected {
            metrics::counter!("waypoint_breaker_rejections_total", "target" => target.to_string())
                .increment(1);
        }
        (breaker, result, generation)
    }

    /// Record an outcome against the target's current state, whatever
    /// admitted the call.
    pub fn record_outcome(&self, target: &str, success: bool) {
        let breaker = self.get_or_create(target);
        let now = self.clock.now();
        breaker.inner.lock().apply(target, success, now);
    }

    /// Current state without side effects. An open breaker whose wait has
    /// elapsed still reports `Open` until the next `allow`.
    pub fn state(&self, target: &str) -> BreakerState {
        self.breakers
            .get(target)
            .map(|b| b.inner.lock().state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self) -> Vec<BreakerView> {
        let now = self.clock.now();
        let mut views: Vec<BreakerView> = self
            .breakers
            .iter()
            .map(|entry| {
                let inner = entry.value().inner.lock();
                BreakerView {
                    target: entry.key().clone(),
                    state: inner.state,
                    calls_in_window: inner.window.len(),
                    failure_rate: (!inner.window.is_empty()).then(|| inner.failure_rate()),
                    opened_for_ms: match inner.state {
                        BreakerState::Open => inner
                            .opened_at
                            .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                        _ => None,
                    },
                    config: inner.config.clone(),
                }
            })
            .collect();
        views.sort_by(|a, b| a.target.cmp(&b.target));
        views
    }

    /// Replace thresholds after a reload. States and windows are kept.
    pub fn reconfigure(&self, config: BreakerConfig) {
        for entry in self.breakers.iter() {
            let target_cfg = config.for_target(entry.key());
            let mut inner = entry.value().inner.lock();
            let capacity = window_capacity(&target_cfg);
            while inner.window.len() > capacity {
                inner.window.pop_front();
            }
            inner.config = target_cfg;
        }
        self.config.store(Arc::new(config));
        tracing::info!("circuit_breaker: reconfigured {} target(s)", self.breakers.len());
    }

    /// Force a target back to closed with an empty window.
    pub fn reset(&self, target: &str) -> bool {
        match self.breakers.get(target) {
            Some(b) => {
                b.inner.lock().transition(target, BreakerState::Closed);
                true
            }
            None => false,
        }
    }

    fn get_or_create(&self, target: &str) -> Arc<TargetBreaker> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.breakers.get(target) {
            return entry.value().clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                let config = self.config.load().for_target(target);
                Arc::new(TargetBreaker {
                    inner: Mutex::new(BreakerInner {
                        state: BreakerState::Closed,
                        generation: 0,
                        window: VecDeque::with_capacity(window_capacity(&config)),
                        opened_at: None,
                        half_open_admitted: 0,
                        half_open_successes: 0,
                        config,
                    }),
                })
            })
            .clone()
    }
}

/// One admitted call. Report the outcome with `record`.
pub struct BreakerPermit {
    breaker: Arc<TargetBreaker>,
    target: String,
    clock: SharedClock,
    generation: u64,
    check: BreakerCheck,
    settled: bool,
}

impl BreakerPermit {
    pub fn check(&self) -> BreakerCheck {
        self.check
    }

    pub fn record(mut self, success: bool) {
        self.settle(success);
    }

    fn settle(&mut self, success: bool) {
        self.settled = true;
        let now = self.clock.now();
        let mut inner = self.breaker.inner.lock();
        if inner.generation != self.generation {
            // Admitted before the last transition; the state it would
            // report into no longer exists.
            return;
        }
        inner.apply(&self.target, success, now);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.check == BreakerCheck::Probe {
            tracing::warn!(
                "circuit_breaker: trial call abandoned, target={}",
                self.target
            );
            self.settle(false);
        }
    }
}

impl BreakerInner {
    fn apply(&mut self, target: &str, success: bool, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                let capacity = window_capacity(&self.config);
                while self.window.len() >= capacity {
                    self.window.pop_front();
                }
                self.window.push_back(!success);
                if self.window.len() < capacity {
                    return;
                }
                let rate = self.failure_rate();
                if rate >= self.config.failure_rate_threshold {
                    tracing::warn!(
                        "circuit_breaker: opened, target={}, failure_rate={:.1}%, threshold={:.1}%",
                        target,
                        rate,
                        self.config.failure_rate_threshold
                    );
                    self.open(target, now);
                }
            }
            // Late outcomes from calls admitted before the breaker tripped.
            BreakerState::Open => {}
            BreakerState::HalfOpen => {
                if success {
                    self.half_open_successes += 1;
                    if self.half_open_successes >= self.config.permitted_calls_in_half_open {
                        tracing::info!(
                            "circuit_breaker: closed, target={}, recovered after {} trial calls",
                            target,
                            self.half_open_successes
                        );
                        self.transition(target, BreakerState::Closed);
                    }
                } else {
                    tracing::warn!("circuit_breaker: re-opened, target={}, trial call failed", target);
                    self.open(target, now);
                }
            }
        }
    }

    /// Percentage of failures in the window.
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }

    fn open(&mut self, target: &str, now: Instant) {
        self.transition(target, BreakerState::Open);
        self.opened_at = Some(now);
    }

    fn transition(&mut self, target: &str, to: BreakerState) {
        let from = self.state;
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.window.clear();
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
        if to != BreakerState::Open {
            self.opened_at = None;
        }
        if from != to {
            metrics::counter!(
                "waypoint_breaker_transitions_total",
                "target" => target.to_string(),
                "to" => to.as_str()
            )
            .increment(1);
            metrics::gauge!("waypoint_breaker_state", "target" => target.to_string())
                .set(to.gauge_value());
        }
    }
}

/// A zero-sized window would never fill; treat it as one call.
fn window_capacity(config: &CircuitBreakerConfig) -> usize {
    (config.minimum_number_of_calls as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerOverride;
    use crate::registry::ManualClock;

    fn config(threshold: f64, min_calls: u32, wait_secs: u64, permitted: u32) -> BreakerConfig {
        BreakerConfig {
            defaults: CircuitBreakerConfig {
                failure_rate_threshold: threshold,
                minimum_number_of_calls: min_calls,
                wait_duration_in_open_state_secs: wait_secs,
                permitted_calls_in_half_open: permitted,
            },
            targets: Default::default(),
        }
    }

    fn bank(cfg: BreakerConfig) -> (ManualClock, BreakerBank) {
        let clock = ManualClock::new();
        let bank = BreakerBank::new(cfg, clock.shared());
        (clock, bank)
    }

    fn record(bank: &BreakerBank, target: &str, outcomes: &[bool]) {
        for ok in outcomes {
            bank.record_outcome(target, *ok);
        }
    }

    #[test]
    fn test_starts_closed() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        assert!(matches!(bank.check("svc"), BreakerCheck::Allowed));
        assert_eq!(bank.state("svc"), BreakerState::Closed);
    }

    #[test]
    fn test_trips_on_failure_rate() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "order-service", &[false, false, false, true]);
        assert_eq!(bank.state("order-service"), BreakerState::Open);
        assert!(!bank.allow("order-service"));
    }

    #[test]
    fn test_trips_exactly_at_threshold() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "svc", &[false, true, true]);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
        bank.record_outcome("svc", false);
        assert_eq!(bank.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_below_threshold_stays_closed() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "svc", &[false, true, true, true, true, true]);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
        assert!(bank.allow("svc"));
    }

    #[test]
    fn test_window_not_evaluated_until_full() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "svc", &[false, false, false]);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
    }

    #[test]
    fn test_window_slides() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        // Old failures fall out of the window before the rate crosses.
        record(&bank, "svc", &[false, true, true, true, true, true, false]);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
        bank.record_outcome("svc", false);
        assert_eq!(bank.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_targets_are_independent() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "a", &[false; 4]);
        assert!(!bank.allow("a"));
        assert!(bank.allow("b"));
    }

    #[test]
    fn test_no_half_open_before_wait() {
        let (clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "svc", &[false; 4]);
        clock.advance(Duration::from_secs(59));
        assert!(matches!(bank.check("svc"), BreakerCheck::Rejected));
        assert_eq!(bank.state("svc"), BreakerState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(matches!(bank.check("svc"), BreakerCheck::Probe));
        assert_eq!(bank.state("svc"), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_limits_trials() {
        let (clock, bank) = bank(config(50.0, 4, 60, 2));
        record(&bank, "svc", &[false; 4]);
        clock.advance(Duration::from_secs(60));
        assert!(matches!(bank.check("svc"), BreakerCheck::Probe));
        assert!(matches!(bank.check("svc"), BreakerCheck::Probe));
        assert!(matches!(bank.check("svc"), BreakerCheck::Rejected));
    }

    #[test]
    fn test_half_open_successes_close() {
        let (clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "svc", &[false; 4]);
        clock.advance(Duration::from_secs(60));
        for _ in 0..3 {
            assert!(bank.allow("svc"));
        }
        record(&bank, "svc", &[true, true]);
        assert_eq!(bank.state("svc"), BreakerState::HalfOpen);
        bank.record_outcome("svc", true);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
        assert!(matches!(bank.check("svc"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "svc", &[false; 4]);
        clock.advance(Duration::from_secs(60));
        assert!(bank.allow("svc"));
        bank.record_outcome("svc", true);
        bank.record_outcome("svc", false);
        assert_eq!(bank.state("svc"), BreakerState::Open);

        // The wait starts over from the re-open.
        clock.advance(Duration::from_secs(30));
        assert!(!bank.allow("svc"));
        clock.advance(Duration::from_secs(30));
        assert!(bank.allow("svc"));
    }

    #[test]
    fn test_open_ignores_late_outcomes() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "svc", &[false; 4]);
        record(&bank, "svc", &[true; 10]);
        assert_eq!(bank.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_per_target_override() {
        let mut cfg = config(50.0, 10, 60, 3);
        cfg.targets.insert(
            "flaky".into(),
            BreakerOverride {
                minimum_number_of_calls: Some(2),
                ..Default::default()
            },
        );
        let (_clock, bank) = bank(cfg);
        record(&bank, "flaky", &[false, false]);
        record(&bank, "steady", &[false, false]);
        assert_eq!(bank.state("flaky"), BreakerState::Open);
        assert_eq!(bank.state("steady"), BreakerState::Closed);
    }

    #[test]
    fn test_reconfigure_preserves_state() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "open", &[false; 4]);
        record(&bank, "closed", &[false, true, true]);

        bank.reconfigure(config(50.0, 2, 60, 3));
        assert_eq!(bank.state("open"), BreakerState::Open);
        // Window trimmed to the last two outcomes [true, true].
        assert_eq!(bank.state("closed"), BreakerState::Closed);
        bank.record_outcome("closed", false);
        assert_eq!(bank.state("closed"), BreakerState::Open);
    }

    #[test]
    fn test_reset() {
        let (_clock, bank) = bank(config(50.0, 4, 60, 3));
        assert!(!bank.reset("svc"));
        record(&bank, "svc", &[false; 4]);
        assert!(bank.reset("svc"));
        assert!(matches!(bank.check("svc"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_dropped_trial_permit_reopens() {
        let (clock, bank) = bank(config(50.0, 4, 60, 1));
        record(&bank, "svc", &[false; 4]);
        clock.advance(Duration::from_secs(60));

        let permit = bank.acquire("svc").unwrap();
        assert_eq!(permit.check(), BreakerCheck::Probe);
        assert!(bank.acquire("svc").is_none());
        drop(permit);

        // The abandoned trial re-opened the breaker instead of holding the
        // only half-open slot.
        assert_eq!(bank.state("svc"), BreakerState::Open);
        clock.advance(Duration::from_secs(60));
        let permit = bank.acquire("svc").unwrap();
        permit.record(true);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
    }

    #[test]
    fn test_dropped_closed_permit_records_nothing() {
        let (_clock, bank) = bank(config(50.0, 1, 60, 1));
        drop(bank.acquire("svc").unwrap());
        assert_eq!(bank.state("svc"), BreakerState::Closed);
        assert_eq!(bank.snapshot()[0].calls_in_window, 0);
    }

    #[test]
    fn test_stale_permit_outcome_is_ignored() {
        let (clock, bank) = bank(config(50.0, 4, 60, 1));
        let slow = bank.acquire("svc").unwrap();
        assert_eq!(slow.check(), BreakerCheck::Allowed);

        record(&bank, "svc", &[false; 4]);
        clock.advance(Duration::from_secs(60));
        let trial = bank.acquire("svc").unwrap();
        assert_eq!(trial.check(), BreakerCheck::Probe);

        // A call admitted while closed finishing now must not close the
        // breaker on the trial's behalf.
        slow.record(true);
        assert_eq!(bank.state("svc"), BreakerState::HalfOpen);
        trial.record(true);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
    }

    #[test]
    fn test_zero_minimum_calls_uses_window_of_one() {
        let (_clock, bank) = bank(config(50.0, 0, 60, 1));
        bank.record_outcome("svc", true);
        assert_eq!(bank.state("svc"), BreakerState::Closed);
        bank.record_outcome("svc", false);
        assert_eq!(bank.state("svc"), BreakerState::Open);
    }

    #[test]
    fn test_snapshot() {
        let (clock, bank) = bank(config(50.0, 4, 60, 3));
        record(&bank, "b", &[false; 4]);
        record(&bank, "a", &[true, false]);
        clock.advance(Duration::from_secs(5));

        let snap = bank.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].target, "a");
        assert_eq!(snap[0].state, BreakerState::Closed);
        assert_eq!(snap[0].calls_in_window, 2);
        assert_eq!(snap[0].failure_rate, Some(50.0));
        assert_eq!(snap[1].state, BreakerState::Open);
        assert_eq!(snap[1].opened_for_ms, Some(5000));
    }
}
