use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Round-robin using a per-target modular counter.
///
/// The index is taken against the snapshot passed in, so a stable snapshot
/// of N instances is visited exactly once per N selections.
#[derive(Default)]
pub struct RoundRobinBalancer {
    counters: DashMap<String, AtomicU64>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&self, target: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        // Fast path: key already exists, no allocation.
        if let Some(counter) = self.counters.get(target) {
            return (counter.fetch_add(1, Ordering::Relaxed) % len as u64) as usize;
        }
        let count = self
            .counters
            .entry(target.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        (count % len as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_uniform() {
        let lb = RoundRobinBalancer::new();
        let mut counts = HashMap::new();
        for _ in 0..1000 {
            *counts.entry(lb.next_index("svc", 2)).or_insert(0) += 1;
        }
        assert_eq!(counts[&0], 500);
        assert_eq!(counts[&1], 500);
    }

    #[test]
    fn test_sequence() {
        let lb = RoundRobinBalancer::new();
        let picks: Vec<usize> = (0..6).map(|_| lb.next_index("svc", 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_targets_have_own_counters() {
        let lb = RoundRobinBalancer::new();
        assert_eq!(lb.next_index("a", 3), 0);
        assert_eq!(lb.next_index("a", 3), 1);
        assert_eq!(lb.next_index("b", 3), 0);
    }

    #[test]
    fn test_single() {
        let lb = RoundRobinBalancer::new();
        for _ in 0..100 {
            assert_eq!(lb.next_index("svc", 1), 0);
        }
    }

    #[test]
    fn test_concurrent_selection_is_balanced() {
        let lb = std::sync::Arc::new(RoundRobinBalancer::new());
        let counts: Vec<AtomicU64> = (0..4).map(|_| AtomicU64::new(0)).collect();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let lb = lb.clone();
                let counts = &counts;
                s.spawn(move || {
                    for _ in 0..1000 {
                        counts[lb.next_index("svc", 4)].fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        for c in &counts {
            assert_eq!(c.load(Ordering::Relaxed), 1000);
        }
    }
}
