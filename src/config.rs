//! Configuration types for the smp-rs runtime.

use prometheus::Registry;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

/// Configuration for an [`SmpRuntime`](crate::SmpRuntime).
///
/// Deserializable from TOML, YAML, JSON or environment variables through
/// figment; see [`SmpBuilder`](crate::SmpBuilder).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmpConfig {
    /// Thread name prefix (default: "smp")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Backend to start with. None selects the build default.
    #[serde(default)]
    pub backend: Option<BackendKind>,

    /// Worker count. None or 0 uses the platform default.
    #[serde(default)]
    pub num_threads: Option<usize>,

    /// Cap on the configured and default worker counts. A later non-zero
    /// `initialize` request overrides it.
    #[serde(default)]
    pub max_threads: Option<usize>,

    /// Whether nested regions run in parallel (default: false)
    #[serde(default)]
    pub nested_parallelism: bool,

    /// CPU set string (e.g., "0-7,16-23") or None for all CPUs
    #[serde(default)]
    pub cpuset: Option<String>,

    /// Pin pool workers round-robin over the CPU set (default: false)
    #[serde(default)]
    pub pin_threads: bool,

    /// Prometheus registry for metrics exposition.
    /// Not serializable - must be set programmatically.
    #[serde(skip)]
    pub prometheus_registry: Option<Registry>,
}

fn default_prefix() -> String {
    "smp".to_string()
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            backend: None,
            num_threads: None,
            max_threads: None,
            nested_parallelism: false,
            cpuset: None,
            pin_threads: false,
            prometheus_registry: None,
        }
    }
}

impl SmpConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// The configured backend, or the build default.
    pub fn effective_backend(&self) -> BackendKind {
        self.backend.unwrap_or_else(BackendKind::build_default)
    }

    /// Default worker count given the platform's `available` parallelism.
    ///
    /// Capped by `max_threads`, never below 1.
    pub fn default_threads(&self, available: usize) -> usize {
        self.cap(available)
    }

    /// Initial worker count: `num_threads` if set and non-zero, else the
    /// default.
    pub fn effective_threads(&self, available: usize) -> usize {
        match self.num_threads {
            Some(n) if n > 0 => self.cap(n),
            _ => self.default_threads(available),
        }
    }

    fn cap(&self, threads: usize) -> usize {
        match self.max_threads {
            Some(max) if max > 0 => threads.min(max),
            _ => threads,
        }
        .max(1)
    }
}
