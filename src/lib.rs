//! # smp-rs
//!
//! **One parallel-for, many engines**
//!
//! A backend-agnostic parallel-for runtime. Algorithm code writes a functor
//! once and runs it over an index range on whichever execution engine is
//! active; the engine can be switched at runtime.
//!
//! ## Features
//!
//! - **Pluggable backends**: sequential, a native `std::thread` pool, a rayon
//!   work-stealing pool, a rayon team loop and a tokio cooperative scheduler
//! - **Functor hooks**: optional per-worker `initialize` and a final `reduce`
//! - **Per-worker storage**: [`ThreadLocalStore`] for lock-free partial results
//! - **Nested regions**: run inline by default, parallel on request
//! - **Parallel algorithms**: fill, transform and sort over slices
//! - **Flexible configuration**: files (TOML/YAML/JSON), environment variables,
//!   code and CLI arguments, merged by figment
//! - **Prometheus metrics** and `tracing` instrumentation
//!
//! ## Quick Start
//!
//! ```
//! use smp_rs::{BackendKind, Index, SmpBuilder, ThreadLocalStore};
//!
//! let runtime = SmpBuilder::new()
//!     .prefix("myapp")
//!     .backend(BackendKind::NativeThreadPool)
//!     .num_threads(4)
//!     .build()
//!     .unwrap();
//!
//! // A plain closure is a functor without hooks.
//! let partial: ThreadLocalStore<i64> = ThreadLocalStore::new();
//! runtime
//!     .parallel_for(0, 1_000, &mut |first: Index, last: Index| {
//!         *partial.local() += (first..last).sum::<i64>();
//!     })
//!     .unwrap();
//! assert_eq!(partial.into_values().into_iter().sum::<i64>(), 499_500);
//! ```
//!
//! The free functions ([`parallel_for`], [`set_backend`], [`sort`], ...)
//! operate on the process-wide [`global`] runtime.
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//!
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env_prefix()`)
//! 4. Programmatic overrides
//! 5. CLI arguments (via `.with_cli_args()`)
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! prefix = "myapp"
//! backend = "stealing"
//! num_threads = 8
//! max_threads = 16
//! nested_parallelism = false
//! cpuset = "0-7"
//! ```
//!
//! ### Environment Variables
//!
//! The global runtime reads `SMP_*` variables:
//! - `SMP_BACKEND=native`
//! - `SMP_NUM_THREADS=8`
//! - `SMP_MAX_THREADS=16`
//! - `SMP_NESTED_PARALLELISM=true`
//!
//! ## Backend Names
//!
//! Names are matched case-insensitively: `sequential`, `native`
//! (`stdthread`), `stealing` (`tbb`, `rayon`), `directive` (`openmp`) and
//! `cooperative` (`kaapi`, `tokio`).
//!
//! ## Thread Naming
//!
//! Pool workers are named with the configured prefix:
//! - Native pool: `{prefix}-native-0001`, ... (the caller is worker 0)
//! - Stealing pool: `{prefix}-rayon-0000`, ...
//! - Directive team: `{prefix}-directive-0000`, ...
//! - Cooperative runtime: `{prefix}-tokio-0000`, ...

pub(crate) mod affinity;
pub mod backend;
pub mod builder;
pub mod config;
pub mod context;
pub mod cpuset;
pub mod error;
pub mod functor;
pub mod local_store;
pub mod metrics;
pub mod partition;
pub mod runtime;
pub(crate) mod slice;

pub use smp_macros::test;

pub use backend::{Backend, BackendKind, UnknownBackend};
pub use builder::{SmpArgs, SmpBuilder};
pub use config::SmpConfig;
pub use context::{is_parallel_scope, single_thread, worker_slot};
pub use error::{Result, SmpError};
pub use functor::{Functor, FunctorAdapter, FunctorCapability};
pub use local_store::{Local, ThreadLocalStore};
pub use metrics::SmpMetrics;
pub use runtime::{global, ScopeConfig, SmpRuntime};

use std::cmp::Ordering;

/// Signed index type of parallel ranges.
pub type Index = i64;

/// Run `functor` over `[first, last)` on the global runtime.
///
/// See [`SmpRuntime::parallel_for`].
pub fn parallel_for<F: Functor>(first: Index, last: Index, functor: &mut F) -> Result<()> {
    global().parallel_for(first, last, functor)
}

/// Run `functor` over `[first, last)` with an explicit grain on the global
/// runtime.
///
/// See [`SmpRuntime::parallel_for_with_grain`].
pub fn parallel_for_with_grain<F: Functor>(
    first: Index,
    last: Index,
    grain: Index,
    functor: &mut F,
) -> Result<()> {
    global().parallel_for_with_grain(first, last, grain, functor)
}

/// Run a shared-reference functor over `[first, last)` on the global runtime.
///
/// See [`SmpRuntime::parallel_for_shared`].
pub fn parallel_for_shared<F: Functor>(first: Index, last: Index, grain: Index, functor: &F) -> Result<()> {
    global().parallel_for_shared(first, last, grain, functor)
}

/// Request `num_threads` workers from the active global backend (0 = default).
pub fn initialize(num_threads: usize) -> Result<()> {
    global().initialize(num_threads)
}

/// The active global backend.
pub fn backend() -> BackendKind {
    global().backend()
}

/// Switch the global backend by name. Returns `false` if the name is unknown
/// or the backend is not compiled in.
pub fn set_backend(name: &str) -> bool {
    global().set_backend(name)
}

/// Worker-count estimate of the active global backend.
pub fn estimated_threads() -> usize {
    global().estimated_threads()
}

/// Worker count used absent any explicit configuration.
pub fn estimated_default_threads() -> usize {
    global().estimated_default_threads()
}

/// Allow or forbid nested regions to run in parallel on the global runtime.
pub fn set_nested_parallelism(enabled: bool) {
    global().set_nested_parallelism(enabled)
}

/// Whether nested regions run in parallel on the global runtime.
pub fn nested_parallelism() -> bool {
    global().nested_parallelism()
}

/// See [`SmpRuntime::fill`].
pub fn fill<T: Clone + Send + Sync>(slice: &mut [T], value: T) -> Result<()> {
    global().fill(slice, value)
}

/// See [`SmpRuntime::transform`].
pub fn transform<T, U, F>(input: &[T], output: &mut [U], op: F) -> Result<()>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync,
{
    global().transform(input, output, op)
}

/// See [`SmpRuntime::transform2`].
pub fn transform2<A, B, U, F>(first: &[A], second: &[B], output: &mut [U], op: F) -> Result<()>
where
    A: Sync,
    B: Sync,
    U: Send,
    F: Fn(&A, &B) -> U + Sync,
{
    global().transform2(first, second, output, op)
}

/// See [`SmpRuntime::transform_in_place`].
pub fn transform_in_place<T: Send, F: Fn(&mut T) + Sync>(slice: &mut [T], op: F) -> Result<()> {
    global().transform_in_place(slice, op)
}

/// See [`SmpRuntime::sort`].
pub fn sort<T: Ord + Send>(slice: &mut [T]) -> Result<()> {
    global().sort(slice)
}

/// See [`SmpRuntime::sort_by`].
pub fn sort_by<T, C>(slice: &mut [T], compare: C) -> Result<()>
where
    T: Send,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    global().sort_by(slice, compare)
}

/// See [`SmpRuntime::local_scope`].
pub fn local_scope<R>(scope: ScopeConfig, f: impl FnOnce() -> R) -> R {
    global().local_scope(scope, f)
}
