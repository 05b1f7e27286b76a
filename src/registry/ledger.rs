use super::clock::SharedClock;
use crate::error::GatewayError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Longest lease an instance can hold; longer requests are capped.
pub const MAX_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    /// `host:port` or a URI authority.
    pub address: String,
    /// Stale once `now > lease_expiry`.
    pub lease_expiry: Instant,
    pub lease_duration: Duration,
    pub status: InstanceStatus,
    pub registered_at: SystemTime,
    pub last_renewed_at: SystemTime,
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.lease_expiry
    }

    pub fn is_healthy(&self, now: Instant) -> bool {
        self.status == InstanceStatus::Up && !self.is_expired(now)
    }

    /// JSON-friendly view for the admin API.
    pub fn view(&self, now: Instant) -> InstanceView {
        InstanceView {
            service_name: self.service_name.clone(),
            instance_id: self.instance_id.clone(),
            address: self.address.clone(),
            status: self.status,
            healthy: self.is_healthy(now),
            lease_secs: self.lease_duration.as_secs(),
            expires_in_ms: self.lease_expiry.saturating_duration_since(now).as_millis() as u64,
            registered_at: humantime::format_rfc3339_seconds(self.registered_at).to_string(),
            last_renewed_at: humantime::format_rfc3339_seconds(self.last_renewed_at).to_string(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    pub status: InstanceStatus,
    pub healthy: bool,
    pub lease_secs: u64,
    pub expires_in_ms: u64,
    pub registered_at: String,
    pub last_renewed_at: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered { service: String, instance_id: String },
    Deregistered { service: String, instance_id: String },
    Evicted { service: String, instance_id: String },
}

/// Authoritative set of live service instances.
///
/// Partitioned by service name, then by instance id. Every mutation happens
/// under the shard lock of the entry it touches; there is no global lock.
pub struct InstanceLedger {
    services: DashMap<String, DashMap<String, ServiceInstance>>,
    clock: SharedClock,
    events: broadcast::Sender<RegistryEvent>,
}

impl InstanceLedger {
    pub fn new(clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            services: DashMap::new(),
            clock,
            events,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Upsert keyed on `(service_name, instance_id)`. Resets the lease and
    /// marks the instance `UP`.
    pub fn register(
        &self,
        service_name: &str,
        instance_id: &str,
        address: &str,
        lease_duration: Duration,
    ) -> ServiceInstance {
        self.register_with_metadata(
            service_name,
            instance_id,
            address,
            lease_duration,
            HashMap::new(),
        )
    }

    pub fn register_with_metadata(
        &self,
        service_name: &str,
        instance_id: &str,
        address: &str,
        lease_duration: Duration,
        metadata: HashMap<String, String>,
    ) -> ServiceInstance {
        let now = self.clock.now();
        let wall = SystemTime::now();
        let lease_duration = lease_duration.min(MAX_LEASE);

        // Hold the outer entry while inserting so an empty-group prune
        // cannot interleave with this registration.
        let group = self.services.entry(service_name.to_string()).or_default();
        let registered_at = group
            .get(instance_id)
            .map(|existing| existing.registered_at)
            .unwrap_or(wall);
        let instance = ServiceInstance {
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
            address: address.to_string(),
            lease_expiry: lease_deadline(now, lease_duration),
            lease_duration,
            status: InstanceStatus::Up,
            registered_at,
            last_renewed_at: wall,
            metadata,
        };
        let previous = group.insert(instance_id.to_string(), instance.clone());
        drop(group);

        if previous.is_none() {
            tracing::info!(
                "registry: registered, service={}, instance={}, address={}, lease={}s",
                service_name,
                instance_id,
                address,
                lease_duration.as_secs()
            );
        } else {
            tracing::debug!(
                "registry: re-registered, service={}, instance={}",
                service_name,
                instance_id
            );
        }
        metrics::counter!("waypoint_registry_registrations_total", "service" => service_name.to_string())
            .increment(1);
        self.publish(RegistryEvent::Registered {
            service: service_name.to_string(),
            instance_id: instance_id.to_string(),
        });
        instance
    }

    /// Renew the lease of a known instance.
    pub fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<(), GatewayError> {
        let now = self.clock.now();
        let renewed = self
            .services
            .get(service_name)
            .and_then(|group| {
                group.get_mut(instance_id).map(|mut inst| {
                    inst.lease_expiry = lease_deadline(now, inst.lease_duration);
                    inst.last_renewed_at = SystemTime::now();
                })
            })
            .is_some();

        if renewed {
            metrics::counter!("waypoint_registry_heartbeats_total", "result" => "ok").increment(1);
            Ok(())
        } else {
            metrics::counter!("waypoint_registry_heartbeats_total", "result" => "not_found")
                .increment(1);
            Err(not_found(service_name, instance_id))
        }
    }

    /// Immediate removal. Returns whether an instance was present.
    pub fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let removed = self
            .services
            .get(service_name)
            .and_then(|group| group.remove(instance_id))
            .is_some();
        if removed {
            self.prune_group(service_name);
            tracing::info!(
                "registry: deregistered, service={}, instance={}",
                service_name,
                instance_id
            );
            self.publish(RegistryEvent::Deregistered {
                service: service_name.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        removed
    }

    /// Operator override; leaves the lease untouched.
    pub fn set_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), GatewayError> {
        let updated = self
            .services
            .get(service_name)
            .and_then(|group| group.get_mut(instance_id).map(|mut inst| inst.status = status))
            .is_some();
        if !updated {
            return Err(not_found(service_name, instance_id));
        }
        tracing::info!(
            "registry: status changed, service={}, instance={}, status={}",
            service_name,
            instance_id,
            status.as_str()
        );
        Ok(())
    }

    pub fn get(&self, service_name: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.services
            .get(service_name)
            .and_then(|group| group.get(instance_id).map(|inst| inst.clone()))
    }

    /// `UP` instances with an unexpired lease, ordered by instance id.
    pub fn healthy_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let now = self.clock.now();
        let mut healthy: Vec<ServiceInstance> = match self.services.get(service_name) {
            Some(group) => group
                .iter()
                .filter(|inst| inst.is_healthy(now))
                .map(|inst| inst.clone())
                .collect(),
            None => return Vec::new(),
        };
        healthy.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        healthy
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|group| group.len()).sum()
    }

    /// Every instance grouped by service, both sides sorted.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<InstanceView>> {
        let now = self.clock.now();
        let mut out = BTreeMap::new();
        for group in self.services.iter() {
            let mut views: Vec<InstanceView> = group.iter().map(|inst| inst.view(now)).collect();
            views.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
            out.insert(group.key().clone(), views);
        }
        out
    }

    /// Keys of instances whose lease ended before `cutoff`.
    pub fn expired_before(&self, cutoff: Instant) -> Vec<(String, String)> {
        let mut keys = Vec::new();
        for group in self.services.iter() {
            for inst in group.iter() {
                if inst.lease_expiry < cutoff {
                    keys.push((group.key().clone(), inst.key().clone()));
                }
            }
        }
        keys
    }

    /// Remove the instance only if its lease still ended before `cutoff`.
    /// The check runs under the entry lock, so a register or heartbeat that
    /// landed after the candidate was collected keeps the instance alive.
    pub fn evict_if_stale(&self, service_name: &str, instance_id: &str, cutoff: Instant) -> bool {
        let evicted = self
            .services
            .get(service_name)
            .and_then(|group| group.remove_if(instance_id, |_, inst| inst.lease_expiry < cutoff))
            .is_some();
        if evicted {
            self.prune_group(service_name);
            self.publish(RegistryEvent::Evicted {
                service: service_name.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        evicted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn prune_group(&self, service_name: &str) {
        self.services.remove_if(service_name, |_, group| group.is_empty());
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is the common case.
        let _ = self.events.send(event);
    }
}

fn not_found(service_name: &str, instance_id: &str) -> GatewayError {
    GatewayError::InstanceNotFound {
        service: service_name.to_string(),
        instance_id: instance_id.to_string(),
    }
}

fn lease_deadline(now: Instant, lease: Duration) -> Instant {
    now.checked_add(lease)
        .or_else(|| now.checked_add(MAX_LEASE))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::clock::{Clock, ManualClock};
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(30);

    fn ledger() -> (ManualClock, InstanceLedger) {
        let clock = ManualClock::new();
        let ledger = InstanceLedger::new(clock.shared());
        (clock, ledger)
    }

    fn ids(instances: &[ServiceInstance]) -> Vec<&str> {
        instances.iter().map(|i| i.instance_id.as_str()).collect()
    }

    #[test]
    fn test_register_then_healthy() {
        let (_clock, ledger) = ledger();
        ledger.register("order-service", "i1", "10.0.0.1:9000", LEASE);
        let healthy = ledger.healthy_instances("order-service");
        assert_eq!(ids(&healthy), vec!["i1"]);
        assert_eq!(healthy[0].address, "10.0.0.1:9000");
        assert_eq!(healthy[0].status, InstanceStatus::Up);
    }

    #[test]
    fn test_register_is_upsert() {
        let (_clock, ledger) = ledger();
        ledger.register("svc", "i1", "10.0.0.1:9000", LEASE);
        ledger.register("svc", "i1", "10.0.0.2:9000", LEASE);
        assert_eq!(ledger.instance_count(), 1);
        assert_eq!(ledger.get("svc", "i1").unwrap().address, "10.0.0.2:9000");
    }

    #[test]
    fn test_register_resets_status_to_up() {
        let (_clock, ledger) = ledger();
        ledger.register("svc", "i1", "a:1", LEASE);
        ledger
            .set_status("svc", "i1", InstanceStatus::OutOfService)
            .unwrap();
        assert!(ledger.healthy_instances("svc").is_empty());
        ledger.register("svc", "i1", "a:1", LEASE);
        assert_eq!(ids(&ledger.healthy_instances("svc")), vec!["i1"]);
    }

    #[test]
    fn test_oversized_lease_is_capped() {
        let (clock, ledger) = ledger();
        let inst = ledger.register("svc", "i1", "a:1", Duration::from_secs(u64::MAX));
        assert_eq!(inst.lease_duration, MAX_LEASE);
        assert_eq!(inst.lease_expiry, clock.now() + MAX_LEASE);

        ledger.heartbeat("svc", "i1").unwrap();
        clock.advance(MAX_LEASE - Duration::from_secs(1));
        assert_eq!(ids(&ledger.healthy_instances("svc")), vec!["i1"]);
    }

    #[test]
    fn test_heartbeat_unknown_instance() {
        let (_clock, ledger) = ledger();
        let err = ledger.heartbeat("svc", "ghost").unwrap_err();
        assert!(matches!(err, GatewayError::InstanceNotFound { .. }));

        ledger.register("svc", "i1", "a:1", LEASE);
        assert!(ledger.heartbeat("svc", "ghost").is_err());
    }

    #[test]
    fn test_heartbeat_extends_lease() {
        let (clock, ledger) = ledger();
        ledger.register("svc", "i1", "a:1", LEASE);
        clock.advance(Duration::from_secs(20));
        ledger.heartbeat("svc", "i1").unwrap();
        clock.advance(Duration::from_secs(20));
        assert_eq!(ids(&ledger.healthy_instances("svc")), vec!["i1"]);
        clock.advance(Duration::from_secs(11));
        assert!(ledger.healthy_instances("svc").is_empty());
    }

    #[test]
    fn test_healthy_excludes_expired_without_evicting() {
        let (clock, ledger) = ledger();
        ledger.register("svc", "i1", "a:1", LEASE);
        clock.advance(Duration::from_secs(31));
        assert!(ledger.healthy_instances("svc").is_empty());
        // Reads never evict.
        assert!(ledger.get("svc", "i1").is_some());
        assert_eq!(ledger.instance_count(), 1);
    }

    #[test]
    fn test_healthy_excludes_non_up_status() {
        let (_clock, ledger) = ledger();
        ledger.register("svc", "i1", "a:1", LEASE);
        ledger.register("svc", "i2", "a:2", LEASE);
        ledger.set_status("svc", "i1", InstanceStatus::Down).unwrap();
        assert_eq!(ids(&ledger.healthy_instances("svc")), vec!["i2"]);
    }

    #[test]
    fn test_healthy_sorted_by_instance_id() {
        let (_clock, ledger) = ledger();
        for id in ["i3", "i1", "i2"] {
            ledger.register("svc", id, "a:1", LEASE);
        }
        assert_eq!(ids(&ledger.healthy_instances("svc")), vec!["i1", "i2", "i3"]);
    }

    #[test]
    fn test_deregister_idempotent_and_prunes_service() {
        let (_clock, ledger) = ledger();
        ledger.register("svc", "i1", "a:1", LEASE);
        assert!(ledger.deregister("svc", "i1"));
        assert!(!ledger.deregister("svc", "i1"));
        assert!(!ledger.deregister("other", "i1"));
        assert!(ledger.services().is_empty());
        assert_eq!(ledger.instance_count(), 0);
    }

    #[test]
    fn test_set_status_unknown() {
        let (_clock, ledger) = ledger();
        assert!(ledger
            .set_status("svc", "i1", InstanceStatus::Down)
            .is_err());
    }

    #[test]
    fn test_evict_if_stale_respects_renewal() {
        let (clock, ledger) = ledger();
        ledger.register("svc", "i1", "a:1", LEASE);
        clock.advance(Duration::from_secs(40));
        let cutoff = clock.now() - Duration::from_secs(5);
        let candidates = ledger.expired_before(cutoff);
        assert_eq!(candidates, vec![("svc".to_string(), "i1".to_string())]);

        // Registration lands between candidate collection and eviction.
        ledger.register("svc", "i1", "a:1", LEASE);
        assert!(!ledger.evict_if_stale("svc", "i1", cutoff));
        assert_eq!(ids(&ledger.healthy_instances("svc")), vec!["i1"]);
    }

    #[test]
    fn test_evict_if_stale_removes() {
        let (clock, ledger) = ledger();
        ledger.register("svc", "i1", "a:1", LEASE);
        clock.advance(Duration::from_secs(40));
        let cutoff = clock.now() - Duration::from_secs(5);
        assert!(ledger.evict_if_stale("svc", "i1", cutoff));
        assert!(ledger.get("svc", "i1").is_none());
        assert!(ledger.services().is_empty());
    }

    #[test]
    fn test_snapshot_lists_every_instance() {
        let (_clock, ledger) = ledger();
        ledger.register("b", "i2", "b:2", LEASE);
        ledger.register("b", "i1", "b:1", LEASE);
        ledger.register("a", "i1", "a:1", LEASE);
        ledger.set_status("b", "i2", InstanceStatus::OutOfService).unwrap();

        let snap = ledger.snapshot();
        let services: Vec<&String> = snap.keys().collect();
        assert_eq!(services, vec!["a", "b"]);
        let b = &snap["b"];
        assert_eq!(b[0].instance_id, "i1");
        assert!(b[0].healthy);
        assert_eq!(b[1].status, InstanceStatus::OutOfService);
        assert!(!b[1].healthy);
    }

    #[test]
    fn test_instance_view_serializes_status() {
        let (_clock, ledger) = ledger();
        let inst = ledger.register("svc", "i1", "a:1", LEASE);
        let json = serde_json::to_value(inst.view(ledger.now())).unwrap();
        assert_eq!(json["status"], "UP");
        assert_eq!(json["lease_secs"], 30);
        assert_eq!(json["expires_in_ms"], 30_000);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let (clock, ledger) = ledger();
        let mut rx = ledger.subscribe();
        ledger.register("svc", "i1", "a:1", LEASE);
        ledger.deregister("svc", "i1");
        ledger.register("svc", "i2", "a:2", LEASE);
        clock.advance(Duration::from_secs(60));
        ledger.evict_if_stale("svc", "i2", clock.now());

        let svc = || "svc".to_string();
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::Registered { service: svc(), instance_id: "i1".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::Deregistered { service: svc(), instance_id: "i1".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::Registered { service: svc(), instance_id: "i2".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::Evicted { service: svc(), instance_id: "i2".into() }
        );
    }

    #[test]
    fn test_concurrent_ops_keep_at_most_one_entry() {
        let (_clock, ledger) = ledger();
        let ledger = Arc::new(ledger);
        std::thread::scope(|s| {
            for t in 0..8 {
                let ledger = ledger.clone();
                s.spawn(move || {
                    for n in 0..500 {
                        match (t + n) % 3 {
                            0 => {
                                ledger.register("svc", "i1", &format!("10.0.0.{}:80", t), LEASE);
                            }
                            1 => {
                                let _ = ledger.heartbeat("svc", "i1");
                            }
                            _ => {
                                ledger.deregister("svc", "i1");
                            }
                        }
                        assert!(ledger.instance_count() <= 1);
                    }
                });
            }
        });
        assert!(ledger.instance_count() <= 1);
    }
}
