//! Prometheus counters for the consistency and caching layer
//!
//! Counters live in a private registry so a host process can merge them into its own exporter
//! (`registry()`) or render them directly (`render()`).

use prometheus::{CounterVec, Encoder, Opts, Registry, Result as PrometheusResult, TextEncoder};

use crate::error::ServiceError;

pub struct CoreMetrics {
    pub cache_operations: CounterVec,
    pub circuit_transitions: CounterVec,
    pub lock_acquisitions: CounterVec,
    pub transactions: CounterVec,
    pub saga_compensations: CounterVec,
    pub sync_items: CounterVec,
    registry: Registry,
}

impl CoreMetrics {
    pub fn new() -> PrometheusResult<Self> {
        let registry = Registry::new();

        let cache_operations = CounterVec::new(
            Opts::new("tessera_cache_operations_total", "Cache operations by outcome"),
            &["service", "operation", "outcome"],
        )?;
        let circuit_transitions = CounterVec::new(
            Opts::new("tessera_cache_circuit_transitions_total", "Circuit breaker phase changes"),
            &["service", "phase"],
        )?;
        let lock_acquisitions = CounterVec::new(
            Opts::new("tessera_lock_acquisitions_total", "Lock acquisition attempts by outcome"),
            &["outcome"],
        )?;
        let transactions = CounterVec::new(
            Opts::new("tessera_transactions_total", "Coordinated transactions by mode and outcome"),
            &["mode", "outcome"],
        )?;
        let saga_compensations = CounterVec::new(
            Opts::new("tessera_saga_compensations_total", "Compensation steps by outcome"),
            &["outcome"],
        )?;
        let sync_items = CounterVec::new(
            Opts::new("tessera_sync_items_total", "Entity sync results"),
            &["entity_type", "outcome"],
        )?;

        registry.register(Box::new(cache_operations.clone()))?;
        registry.register(Box::new(circuit_transitions.clone()))?;
        registry.register(Box::new(lock_acquisitions.clone()))?;
        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(saga_compensations.clone()))?;
        registry.register(Box::new(sync_items.clone()))?;

        Ok(Self {
            cache_operations,
            circuit_transitions,
            lock_acquisitions,
            transactions,
            saga_compensations,
            sync_items,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every counter in the Prometheus text format
    pub fn render(&self) -> Result<String, ServiceError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| {
                ServiceError::SerializationError(format!("Metrics encode failed: {}", e))
            })?;
        String::from_utf8(buffer)
            .map_err(|e| ServiceError::SerializationError(format!("Metrics are not UTF-8: {}", e)))
    }

    pub(crate) fn cache_op(&self, service: &str, operation: &str, outcome: &str) {
        self.cache_operations
            .with_label_values(&[service, operation, outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_counters() {
        let metrics = CoreMetrics::new().unwrap();
        metrics.cache_op("users", "get", "hit");
        metrics.lock_acquisitions.with_label_values(&["timeout"]).inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("tessera_cache_operations_total"));
        assert!(text.contains("service=\"users\""));
        assert!(text.contains("tessera_lock_acquisitions_total"));
    }
}
