use rand::Rng;

/// Uniform random pick.
#[derive(Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn next_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution() {
        let lb = RandomBalancer::new();
        let mut counts = [0usize; 2];
        for _ in 0..10_000 {
            counts[lb.next_index(2)] += 1;
        }
        assert!((4400..5600).contains(&counts[0]), "counts: {:?}", counts);
        assert!((4400..5600).contains(&counts[1]), "counts: {:?}", counts);
    }

    #[test]
    fn test_single() {
        let lb = RandomBalancer::new();
        for _ in 0..100 {
            assert_eq!(lb.next_index(1), 0);
        }
    }
}
