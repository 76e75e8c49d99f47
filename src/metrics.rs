//! Prometheus metrics integration for the module host.

use prometheus::{Counter, Histogram, HistogramOpts, Registry};

/// Configuration for host metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all host metrics.
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "modhost".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Host metrics collector.
pub struct HostMetrics {
    config: MetricsConfig,
    registry: Registry,
    modules_loaded: Counter,
    modules_unloaded: Counter,
    load_errors: Counter,
    deferrals: Counter,
    load_duration: Histogram,
}

impl HostMetrics {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let modules_loaded = Counter::new(
            format!("{}_modules_loaded_total", config.prefix),
            "Total number of modules enabled",
        )?;

        let modules_unloaded = Counter::new(
            format!("{}_modules_unloaded_total", config.prefix),
            "Total number of modules disabled",
        )?;

        let load_errors = Counter::new(
            format!("{}_load_errors_total", config.prefix),
            "Total number of failed archive loads",
        )?;

        let deferrals = Counter::new(
            format!("{}_deferrals_total", config.prefix),
            "Total number of archives deferred on a dependency",
        )?;

        let load_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_load_duration_seconds", config.prefix),
                "Archive load duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(modules_loaded.clone()))?;
        registry.register(Box::new(modules_unloaded.clone()))?;
        registry.register(Box::new(load_errors.clone()))?;
        registry.register(Box::new(deferrals.clone()))?;
        registry.register(Box::new(load_duration.clone()))?;

        Ok(Self {
            config,
            registry,
            modules_loaded,
            modules_unloaded,
            load_errors,
            deferrals,
            load_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a successful archive load that enabled `modules` modules.
    pub fn record_load(&self, modules: usize, duration_secs: f64) {
        self.modules_loaded.inc_by(modules as f64);
        self.load_duration.observe(duration_secs);
    }

    /// Record a module disable.
    pub fn record_unload(&self) {
        self.modules_unloaded.inc();
    }

    /// Record a failed archive load.
    pub fn record_error(&self) {
        self.load_errors.inc();
    }

    /// Record a deferred archive.
    pub fn record_deferral(&self) {
        self.deferrals.inc();
    }

    /// Get the total number of modules enabled.
    pub fn modules_loaded_total(&self) -> u64 {
        self.modules_loaded.get() as u64
    }

    /// Get the total number of modules disabled.
    pub fn modules_unloaded_total(&self) -> u64 {
        self.modules_unloaded.get() as u64
    }

    /// Get the total number of failed loads.
    pub fn load_errors_total(&self) -> u64 {
        self.load_errors.get() as u64
    }

    /// Get the total number of deferrals.
    pub fn deferrals_total(&self) -> u64 {
        self.deferrals.get() as u64
    }
}

impl std::fmt::Debug for HostMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMetrics")
            .field("config", &self.config)
            .field("modules_loaded", &self.modules_loaded_total())
            .field("modules_unloaded", &self.modules_unloaded_total())
            .field("load_errors", &self.load_errors_total())
            .field("deferrals", &self.deferrals_total())
            .finish()
    }
}
