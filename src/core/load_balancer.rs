use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::config::LoadBalanceStrategy;

/// Picks one of `len` destinations of a cluster.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Index of the selected destination, `None` when there is nothing to pick from
    fn select(&self, len: usize) -> Option<usize>;

    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy. Each cluster owns its own counter.
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
    fn select(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % len)
    }
}

/// Random selection load balancing strategy
#[derive(Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(rand::rng().random_range(0..len))
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::Random => RandomStrategy.boxed(),
        }
    }
}
