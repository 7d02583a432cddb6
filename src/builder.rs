//! Builder pattern for constructing smp runtimes.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap

use std::path::Path;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;

use crate::backend::BackendKind;
use crate::config::SmpConfig;
use crate::error::Result;
use crate::runtime::SmpRuntime;

/// Builder for constructing an [`SmpRuntime`].
///
/// Configuration sources are merged in the order they are added, later
/// sources overriding earlier ones, on top of the defaults.
///
/// # Examples
///
/// ```ignore
/// use smp_rs::{BackendKind, SmpBuilder};
///
/// let runtime = SmpBuilder::new()
///     .file("smp.toml")
///     .env_prefix("SMP")
///     .backend(BackendKind::TaskStealingPool)
///     .num_threads(8)
///     .build()?;
/// ```
pub struct SmpBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
}

impl Default for SmpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SmpBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmpBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .finish()
    }
}

impl SmpBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(SmpConfig::default())),
            prometheus_registry: None,
        }
    }

    /// Add a configuration file.
    ///
    /// The format follows the extension (`.toml`, `.yaml`/`.yml`, `.json`);
    /// anything else is read as TOML. Missing files are skipped.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        self.figment = match extension.as_str() {
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => self.figment.merge(Toml::file(path)),
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Variables are read as `{PREFIX}_{KEY}`, e.g. `SMP_BACKEND`,
    /// `SMP_MAX_THREADS`, `SMP_NESTED_PARALLELISM`.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        let prefix = format!("{}_", prefix.trim_end_matches('_'));
        self.figment = self.figment.merge(Env::prefixed(&prefix));
        self
    }

    /// Set the thread name prefix.
    ///
    /// Workers are named `{prefix}-{pool}-{NNNN}`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("prefix", prefix.into()));
        self
    }

    /// Set the backend the runtime starts with.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.figment = self.figment.merge(Serialized::default("backend", backend));
        self
    }

    /// Set the worker count (0 = platform default).
    pub fn num_threads(mut self, n: usize) -> Self {
        self.figment = self.figment.merge(Serialized::default("num_threads", n));
        self
    }

    /// Cap every worker count, including later `initialize` requests.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.figment = self.figment.merge(Serialized::default("max_threads", n));
        self
    }

    /// Allow nested regions to run in parallel.
    pub fn nested_parallelism(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("nested_parallelism", enabled));
        self
    }

    /// Set the CPU set string.
    ///
    /// Format: `"0-7,16-23"` for ranges, `"0,2,4,6"` for individual CPUs.
    pub fn cpuset(mut self, cpuset: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("cpuset", cpuset.into()));
        self
    }

    /// Pin pool workers to the CPU set.
    pub fn pin_threads(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("pin_threads", enabled));
        self
    }

    /// Provide an external Prometheus registry for metrics exposition.
    ///
    /// ```ignore
    /// use prometheus::Registry;
    ///
    /// let registry = Registry::new();
    /// let runtime = SmpBuilder::new()
    ///     .prometheus_registry(registry.clone())
    ///     .build()?;
    ///
    /// let families = registry.gather();
    /// ```
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Apply CLI argument overrides.
    ///
    /// Only the values present in `args` are applied.
    pub fn with_cli_args(mut self, args: &SmpArgs) -> Self {
        if let Some(ref prefix) = args.smp_prefix {
            self = self.prefix(prefix.clone());
        }
        if let Some(backend) = args.smp_backend {
            self = self.backend(backend);
        }
        if let Some(threads) = args.smp_threads {
            self = self.num_threads(threads);
        }
        if let Some(threads) = args.smp_max_threads {
            self = self.max_threads(threads);
        }
        if args.smp_nested {
            self = self.nested_parallelism(true);
        }
        if let Some(ref cpuset) = args.smp_cpuset {
            self = self.cpuset(cpuset.clone());
        }
        if args.smp_pin {
            self = self.pin_threads(true);
        }
        self
    }

    fn extract(&self) -> Result<SmpConfig> {
        Ok(self.figment.extract().map_err(Box::new)?)
    }

    /// Build the runtime.
    ///
    /// Worker threads are not started here; each backend starts its workers
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration extraction fails
    /// - CPU set is invalid or contains unavailable CPUs
    /// - The configured backend is not compiled in
    pub fn build(self) -> Result<SmpRuntime> {
        let mut config = self.extract()?;
        config.prometheus_registry = self.prometheus_registry;
        SmpRuntime::from_config(config)
    }
}

/// CLI arguments for smp configuration.
///
/// Flatten into an application's clap parser and apply with
/// [`SmpBuilder::with_cli_args`].
///
/// ```ignore
/// use clap::Parser;
/// use smp_rs::{SmpArgs, SmpBuilder};
///
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     smp: SmpArgs,
/// }
///
/// let args = MyArgs::parse();
/// let runtime = SmpBuilder::new().with_cli_args(&args.smp).build()?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct SmpArgs {
    /// Thread name prefix
    #[arg(long)]
    pub smp_prefix: Option<String>,

    /// Backend (sequential, native, stealing, directive, cooperative)
    #[arg(long)]
    pub smp_backend: Option<BackendKind>,

    /// Number of worker threads
    #[arg(long)]
    pub smp_threads: Option<usize>,

    /// Upper bound on worker threads
    #[arg(long)]
    pub smp_max_threads: Option<usize>,

    /// Run nested regions in parallel
    #[arg(long)]
    pub smp_nested: bool,

    /// CPU set (e.g., "0-7,16-23")
    #[arg(long)]
    pub smp_cpuset: Option<String>,

    /// Pin workers to the CPU set
    #[arg(long)]
    pub smp_pin: bool,
}
