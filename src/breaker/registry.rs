//! Registry of circuit breakers keyed by logical service identity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{CircuitBreaker, CircuitBreakerConfig};

pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(service) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.default_config)))
            .clone()
    }

    pub fn get_or_create_with(&self, service: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(service) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config)))
            .clone()
    }

    /// Administrative operation: reset every registered breaker to Closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().unwrap().values() {
            breaker.reset();
        }
    }

    pub fn snapshot_all(&self) -> Vec<super::BreakerSnapshot> {
        self.breakers.read().unwrap().values().map(|b| b.state()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_same_instance_for_same_service() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get_or_create("stage1");
        let b = registry.get_or_create("stage1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reset_all_restores_closed_state() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            min_throughput: 1,
            failure_ratio: 0.1,
            ..CircuitBreakerConfig::default()
        });
        let breaker = registry.get_or_create("stage1");
        let permit = breaker.allow().unwrap();
        breaker.on_failure(&crate::error::ErrorKind::Network, &permit);
        assert_eq!(
            breaker.state().state,
            crate::models::BreakerState::Open
        );

        registry.reset_all();
        assert_eq!(
            registry.get_or_create("stage1").state().state,
            crate::models::BreakerState::Closed
        );
    }
}
