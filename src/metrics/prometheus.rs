//! Prometheus counters and gauges for the parallel runtime.
//!
//! Metric names use a `{prefix}_` prefix derived from the runtime's thread
//! prefix, sanitized to a valid Prometheus name.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for one runtime.
///
/// Cloning shares the underlying counters.
#[derive(Clone)]
pub struct SmpMetrics {
    /// Regions currently executing.
    pub active_regions: IntGauge,

    /// Worker count estimate of the active backend.
    pub threads: IntGauge,

    /// Regions dispatched.
    pub regions_total: IntCounter,

    /// Sub-ranges handed to functors.
    pub chunks_total: IntCounter,

    /// Nested regions collapsed to sequential execution.
    pub nested_inline_total: IntCounter,

    /// Sub-ranges whose functor panicked.
    pub chunk_panics_total: IntCounter,
}

impl Default for SmpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace characters Prometheus does not accept in metric names.
fn sanitize(prefix: &str) -> String {
    prefix
        .chars()
        .enumerate()
        .map(|(i, c)| match c {
            'a'..='z' | 'A'..='Z' | '_' | ':' => c,
            '0'..='9' if i > 0 => c,
            _ => '_',
        })
        .collect()
}

fn counter(prefix: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("sanitized metric name is valid")
}

fn gauge(prefix: &str, name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("sanitized metric name is valid")
}

impl SmpMetrics {
    /// Create metrics with the default prefix "smp".
    pub fn new() -> Self {
        Self::with_prefix("smp")
    }

    /// Create metrics named `{prefix}_*`.
    ///
    /// Hyphens and other invalid characters in `prefix` become underscores.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = sanitize(prefix);
        Self {
            active_regions: gauge(&prefix, "active_regions", "Parallel regions executing"),
            threads: gauge(&prefix, "threads", "Worker count of the active backend"),
            regions_total: counter(&prefix, "regions_total", "Parallel regions dispatched"),
            chunks_total: counter(&prefix, "chunks_total", "Sub-ranges executed"),
            nested_inline_total: counter(
                &prefix,
                "nested_inline_total",
                "Nested regions run sequentially",
            ),
            chunk_panics_total: counter(
                &prefix,
                "chunk_panics_total",
                "Sub-ranges whose functor panicked",
            ),
        }
    }

    /// Register all metrics with a registry for exposition.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register (e.g., duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.active_regions.clone()))?;
        registry.register(Box::new(self.threads.clone()))?;
        registry.register(Box::new(self.regions_total.clone()))?;
        registry.register(Box::new(self.chunks_total.clone()))?;
        registry.register(Box::new(self.nested_inline_total.clone()))?;
        registry.register(Box::new(self.chunk_panics_total.clone()))?;
        Ok(())
    }

    /// Track one region for as long as the returned guard lives.
    #[inline]
    pub(crate) fn enter_region(&self, nested_inline: bool) -> ActiveRegion<'_> {
        self.regions_total.inc();
        if nested_inline {
            self.nested_inline_total.inc();
        }
        self.active_regions.inc();
        ActiveRegion(self)
    }
}

/// Decrements the active-region gauge on drop, also on unwind.
pub(crate) struct ActiveRegion<'a>(&'a SmpMetrics);

impl Drop for ActiveRegion<'_> {
    fn drop(&mut self) {
        self.0.active_regions.dec();
    }
}

impl std::fmt::Debug for SmpMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmpMetrics")
            .field("active_regions", &self.active_regions.get())
            .field("regions_total", &self.regions_total.get())
            .field("chunks_total", &self.chunks_total.get())
            .field("chunk_panics_total", &self.chunk_panics_total.get())
            .finish()
    }
}
