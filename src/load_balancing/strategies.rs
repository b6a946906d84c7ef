use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::config::SelectionKind;
use crate::core::types::ServiceInstance;

/// Picks one instance out of the list a registry returned.
///
/// Implementations must return `None` only for an empty slice.
pub trait SelectionStrategy: Send + Sync + std::fmt::Debug {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;

    fn name(&self) -> &'static str;
}

/// Build the strategy named in the configuration
pub fn strategy_for(kind: SelectionKind) -> Arc<dyn SelectionStrategy> {
    match kind {
        SelectionKind::First => Arc::new(FirstInstance),
        SelectionKind::RoundRobin => Arc::new(RoundRobin::new()),
        SelectionKind::Weighted => Arc::new(WeightedRandom),
        SelectionKind::Random => Arc::new(RandomInstance),
    }
}

/// Always the first entry the registry returned
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstInstance;

impl SelectionStrategy for FirstInstance {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        instances.first()
    }

    fn name(&self) -> &'static str {
        "first"
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl SelectionStrategy for RoundRobin {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % instances.len();
        instances.get(index)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Random pick proportional to instance weight; uniform when every weight is zero
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandom;

impl SelectionStrategy for WeightedRandom {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
        if total == 0 {
            return RandomInstance.select(instances);
        }

        let mut point = rand::thread_rng().gen_range(0..total);
        for instance in instances {
            let weight = u64::from(instance.weight);
            if point < weight {
                return Some(instance);
            }
            point -= weight;
        }
        instances.last()
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomInstance;

impl SelectionStrategy for RandomInstance {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        instances.get(rand::thread_rng().gen_range(0..instances.len()))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances() -> Vec<ServiceInstance> {
        vec![
            ServiceInstance::new("user-service", "10.0.0.1:8000"),
            ServiceInstance::new("user-service", "10.0.0.2:8000"),
            ServiceInstance::new("user-service", "10.0.0.3:8000"),
        ]
    }

    #[test]
    fn test_every_strategy_handles_empty_list() {
        for kind in [
            SelectionKind::First,
            SelectionKind::RoundRobin,
            SelectionKind::Weighted,
            SelectionKind::Random,
        ] {
            assert!(strategy_for(kind).select(&[]).is_none());
        }
    }

    #[test]
    fn test_first_is_deterministic() {
        let list = instances();
        let strategy = FirstInstance;
        for _ in 0..5 {
            assert_eq!(strategy.select(&list).unwrap().address, "10.0.0.1:8000");
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let list = instances();
        let strategy = RoundRobin::new();
        let picked: Vec<_> = (0..4)
            .map(|_| strategy.select(&list).unwrap().address.clone())
            .collect();
        assert_eq!(
            picked,
            vec!["10.0.0.1:8000", "10.0.0.2:8000", "10.0.0.3:8000", "10.0.0.1:8000"]
        );
    }

    #[test]
    fn test_weighted_skips_zero_weight() {
        let list = vec![
            ServiceInstance::new("stat-service", "10.0.0.1:8004").with_weight(0),
            ServiceInstance::new("stat-service", "10.0.0.2:8004").with_weight(5),
        ];
        for _ in 0..100 {
            assert_eq!(WeightedRandom.select(&list).unwrap().address, "10.0.0.2:8004");
        }
    }

    #[test]
    fn test_weighted_all_zero_falls_back_to_uniform() {
        let list: Vec<_> = instances().into_iter().map(|i| i.with_weight(0)).collect();
        assert!(WeightedRandom.select(&list).is_some());
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let list = instances();
        for _ in 0..50 {
            let picked = RandomInstance.select(&list).unwrap();
            assert!(list.contains(picked));
        }
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(strategy_for(SelectionKind::First).name(), "first");
        assert_eq!(strategy_for(SelectionKind::RoundRobin).name(), "round_robin");
        assert_eq!(strategy_for(SelectionKind::Weighted).name(), "weighted");
        assert_eq!(strategy_for(SelectionKind::Random).name(), "random");
    }
}
