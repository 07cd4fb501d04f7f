use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for rate limiters
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
    store_connections_active: GaugeVec,
}

impl Metrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a metrics instance registering into an existing registry
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let registry = Arc::new(registry);

        let decisions = CounterVec::new(
            Opts::new(
                "ratelimit_decisions_total",
                "Number of rate limit decisions by outcome",
            ),
            &["key", "outcome"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "ratelimit_store_operations_total",
                "Number of store operations by backend, operation and result",
            ),
            &["backend", "operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of store operations in seconds",
            ),
            &["backend", "operation"],
        )?;

        let store_connections_active = GaugeVec::new(
            Opts::new(
                "ratelimit_store_connections_active",
                "Number of open limiter store connections",
            ),
            &["backend"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(store_connections_active.clone()))?;

        Ok(Self {
            registry,
            decisions,
            store_operations,
            store_operation_duration,
            store_connections_active,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admitted(&self, key: &str) {
        self.decisions.with_label_values(&[key, "admitted"]).inc();
    }

    pub fn record_rejected(&self, key: &str) {
        self.decisions.with_label_values(&[key, "rejected"]).inc();
    }

    /// Record a store operation
    pub fn record_store_operation(&self, backend: &str, operation: &str, result: &str) {
        self.store_operations
            .with_label_values(&[backend, operation, result])
            .inc();
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(
        &self,
        backend: &str,
        operation: &str,
        duration_seconds: f64,
    ) {
        self.store_operation_duration
            .with_label_values(&[backend, operation])
            .observe(duration_seconds);
    }

    pub fn connection_opened(&self, backend: &str) {
        self.store_connections_active.with_label_values(&[backend]).inc();
    }

    pub fn connection_closed(&self, backend: &str) {
        self.store_connections_active.with_label_values(&[backend]).dec();
    }

    /// Current value of the decision counter for `key` and `outcome`
    pub fn decisions(&self, key: &str, outcome: &str) -> f64 {
        self.decisions.with_label_values(&[key, outcome]).get()
    }

    /// Current value of the store operation counter
    pub fn store_operations(&self, backend: &str, operation: &str, result: &str) -> f64 {
        self.store_operations
            .with_label_values(&[backend, operation, result])
            .get()
    }

    pub fn connections_active(&self, backend: &str) -> f64 {
        self.store_connections_active.with_label_values(&[backend]).get()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
