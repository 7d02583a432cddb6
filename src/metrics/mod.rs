//! Metrics for smp-rs runtime observability.
//!
//! Counters are plain atomic operations and are always collected. They are
//! exposed for scraping only when a Prometheus registry is passed to
//! [`SmpBuilder::prometheus_registry`](crate::SmpBuilder::prometheus_registry).
//!
//! # Available Metrics
//!
//! ## Gauges
//!
//! - `smp_active_regions` - Parallel regions currently executing
//! - `smp_threads` - Worker count estimate of the active backend
//!
//! ## Counters
//!
//! - `smp_regions_total` - Regions dispatched (one per non-empty `parallel_for`)
//! - `smp_chunks_total` - Sub-ranges handed to functors
//! - `smp_nested_inline_total` - Nested regions collapsed to sequential execution
//! - `smp_chunk_panics_total` - Sub-ranges that unwound
//!
//! # Example
//!
//! ```ignore
//! use prometheus::Registry;
//! use smp_rs::SmpBuilder;
//!
//! let registry = Registry::new();
//! let runtime = SmpBuilder::new()
//!     .prometheus_registry(registry.clone())
//!     .build()?;
//! ```

mod prometheus;

pub use self::prometheus::SmpMetrics;
