use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{
    error::{GatewayError, GatewayResult},
    model::ServiceInstance,
    store::DynamicConfigStore,
};

/// Strategy named in the load-balance filter config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LoadBalanceStrategy {
    #[default]
    Random,
    RoundRobin,
    WeightedRoundRobin,
}

impl LoadBalanceStrategy {
    /// Resolves a strategy name; unknown names fall back to random.
    pub fn parse(name: &str) -> Self {
        match name {
            "RoundRobin" | "round_robin" => Self::RoundRobin,
            "WeightedRoundRobin" | "weighted_round_robin" => Self::WeightedRoundRobin,
            "Random" | "random" => Self::Random,
            other => {
                tracing::warn!(strategy = other, "Unknown load balance strategy, using Random");
                Self::Random
            }
        }
    }
}

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select an instance from a non-empty candidate list
    fn select_instance(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance>;
    /// Create a new instance of this strategy as a shared trait object
    fn shared(self) -> Arc<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Round-robin load balancing strategy
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_instance(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(instances[count % instances.len()].clone())
    }
}

/// Random selection load balancing strategy
#[derive(Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select_instance(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..instances.len());
        Some(instances[index].clone())
    }
}

/// Weighted round robin: the position advances modulo the total weight and
/// the instance whose cumulative weight first exceeds it is chosen, so weights
/// [3, 1] yield A, A, A, B and repeat.
#[derive(Default)]
pub struct WeightedRoundRobinStrategy {
    position: AtomicUsize,
}

impl WeightedRoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for WeightedRoundRobinStrategy {
    fn select_instance(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let total: usize = instances.iter().map(|i| i.weight as usize).sum();
        let position = self.position.fetch_add(1, Ordering::Relaxed);
        if total == 0 {
            return Some(instances[position % instances.len()].clone());
        }

        let index = position % total;
        let mut cumulative = 0usize;
        instances
            .iter()
            .find(|instance| {
                cumulative += instance.weight as usize;
                cumulative > index
            })
            .cloned()
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: LoadBalanceStrategy) -> Arc<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::Random => RandomStrategy::new().shared(),
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().shared(),
            LoadBalanceStrategy::WeightedRoundRobin => WeightedRoundRobinStrategy::new().shared(),
        }
    }
}

/// Chooses instances from the store, keeping strategy state per service so
/// round-robin positions of different services do not interfere.
pub struct LoadBalancer {
    store: Arc<DynamicConfigStore>,
    strategies: scc::HashMap<(LoadBalanceStrategy, String), Arc<dyn LoadBalancingStrategy>>,
}

impl LoadBalancer {
    pub fn new(store: Arc<DynamicConfigStore>) -> Self {
        Self {
            store,
            strategies: scc::HashMap::new(),
        }
    }

    pub async fn choose(
        &self,
        unique_id: &str,
        gray: bool,
        strategy: LoadBalanceStrategy,
    ) -> GatewayResult<ServiceInstance> {
        let instances = self.store.service_instances(unique_id, gray).await;
        let no_instance = || GatewayError::NoInstanceAvailable {
            unique_id: unique_id.to_string(),
            gray,
        };
        if instances.is_empty() {
            tracing::warn!(unique_id, gray, "No instance available");
            return Err(no_instance());
        }

        let selector = self.strategy_for(unique_id, strategy).await;
        selector.select_instance(&instances).ok_or_else(no_instance)
    }

    async fn strategy_for(
        &self,
        unique_id: &str,
        strategy: LoadBalanceStrategy,
    ) -> Arc<dyn LoadBalancingStrategy> {
        let key = (strategy, unique_id.to_string());
        if let Some(entry) = self.strategies.get_async(&key).await {
            return entry.get().clone();
        }
        let created = LoadBalancerFactory::create_strategy(strategy);
        // First writer wins so concurrent callers share one counter.
        match self.strategies.insert_async(key.clone(), created.clone()).await {
            Ok(()) => created,
            Err(_) => self
                .strategies
                .get_async(&key)
                .await
                .map(|entry| entry.get().clone())
                .unwrap_or(created),
        }
    }
}
