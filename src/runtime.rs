//! The dispatcher: active backend, thread configuration and region dispatch.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ SmpRuntime                                                    │
//! │   active: AtomicU8 ──▶ one of the backend instances below     │
//! │   nested: AtomicBool     num_threads: AtomicUsize             │
//! └───────────────────────────────────────────────────────────────┘
//!      │ sequential   │ native      │ stealing   │ directive   │ cooperative
//!      ▼              ▼             ▼            ▼             ▼
//!   caller only   std threads   rayon pool   rayon team    tokio runtime
//! ```
//!
//! Every backend instance lives as long as the runtime and starts its
//! workers on first use, so reading the active backend never takes a lock.
//! Switching backends only stores a new discriminant; calls already running
//! finish on the backend they started with.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::affinity::WorkerStart;
use crate::backend::{Backend, BackendKind, Job, PoolSettings, Sequential};
use crate::builder::SmpBuilder;
use crate::config::SmpConfig;
use crate::context::{self, Region};
use crate::cpuset::{available_cpus, format_cpuset, parse_and_validate_cpuset};
use crate::error::{Result, SmpError};
use crate::functor::{Functor, FunctorAdapter};
use crate::metrics::SmpMetrics;
use crate::slice::SharedSlice;
use crate::Index;

#[cfg(feature = "tokio")]
use crate::backend::CooperativeScheduler;
#[cfg(feature = "rayon")]
use crate::backend::{CompilerDirectiveLoop, TaskStealingPool};
#[cfg(feature = "native")]
use crate::backend::NativeThreadPool;

/// A parallel-for runtime.
///
/// Cheap to clone; clones share the same backends and settings. Use
/// [`global`] for the process-wide instance or [`SmpBuilder`] for an
/// independent one.
///
/// ```
/// use smp_rs::{BackendKind, SmpBuilder};
///
/// let runtime = SmpBuilder::new()
///     .backend(BackendKind::NativeThreadPool)
///     .num_threads(4)
///     .build()
///     .unwrap();
///
/// let mut squares = vec![0_i64; 1000];
/// runtime
///     .transform(&(0..1000).collect::<Vec<i64>>(), &mut squares, |i| i * i)
///     .unwrap();
/// assert_eq!(squares[999], 998_001);
/// ```
#[derive(Clone)]
pub struct SmpRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: SmpConfig,
    active: AtomicU8,
    /// Last `initialize` request (0 = default).
    num_threads: AtomicUsize,
    nested: AtomicBool,
    reconfigure: Mutex<()>,
    platform_threads: usize,
    cpus: Vec<usize>,
    sequential: Sequential,
    #[cfg(feature = "native")]
    native: NativeThreadPool,
    #[cfg(feature = "rayon")]
    stealing: TaskStealingPool,
    #[cfg(feature = "rayon")]
    directive: CompilerDirectiveLoop,
    #[cfg(feature = "tokio")]
    cooperative: CooperativeScheduler,
    metrics: SmpMetrics,
}

impl RuntimeInner {
    fn backend_for(&self, kind: BackendKind) -> &dyn Backend {
        match kind {
            #[cfg(feature = "native")]
            BackendKind::NativeThreadPool => &self.native,
            #[cfg(feature = "rayon")]
            BackendKind::TaskStealingPool => &self.stealing,
            #[cfg(feature = "rayon")]
            BackendKind::CompilerDirectiveLoop => &self.directive,
            #[cfg(feature = "tokio")]
            BackendKind::CooperativeScheduler => &self.cooperative,
            _ => &self.sequential,
        }
    }
}

/// Backend chosen for one region.
pub(crate) struct Target<'a> {
    pub(crate) backend: &'a dyn Backend,
    /// Nested region collapsed to sequential execution.
    pub(crate) inline: bool,
}

/// Counts a chunk as panicked if it unwinds.
struct PanicCounter<'a>(&'a SmpMetrics);

impl Drop for PanicCounter<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.chunk_panics_total.inc();
        }
    }
}

impl SmpRuntime {
    /// Create a runtime from a configuration.
    ///
    /// This is typically called via [`SmpBuilder::build`].
    pub(crate) fn from_config(config: SmpConfig) -> Result<Self> {
        let backend = config.effective_backend();
        if !backend.is_compiled() {
            return Err(SmpError::BackendNotCompiled(backend));
        }

        let (cpus, restricted) = match config.cpuset.as_deref() {
            Some(cpuset) => (parse_and_validate_cpuset(cpuset)?, true),
            None => (available_cpus(), false),
        };
        if restricted && cpus.is_empty() {
            return Err(SmpError::NoCpusAvailable);
        }

        let mut platform = std::thread::available_parallelism().map_or(1, |n| n.get());
        if restricted {
            platform = platform.min(cpus.len());
        }
        Ok(Self::assemble(config, cpus, platform))
    }

    /// Runtime with default settings. Cannot fail.
    fn with_defaults() -> Self {
        let platform = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::assemble(SmpConfig::default(), available_cpus(), platform)
    }

    fn assemble(config: SmpConfig, cpus: Vec<usize>, platform: usize) -> Self {
        let backend = config.effective_backend();
        let platform_threads = platform.max(1);
        let pin_cpus = config.pin_threads.then(|| cpus.clone());
        let settings = PoolSettings {
            threads: config.effective_threads(platform),
            default_threads: config.effective_threads(platform),
            max_threads: config.max_threads.filter(|&max| max > 0),
            workers: WorkerStart::new(&config.prefix, pin_cpus),
        };

        let metrics = SmpMetrics::with_prefix(&config.prefix);
        if let Some(ref registry) = config.prometheus_registry {
            if let Err(e) = metrics.register(registry) {
                warn!(%e, "failed to register prometheus metrics");
            }
        }

        info!(
            prefix = %config.prefix,
            %backend,
            threads = settings.threads,
            nested_parallelism = config.nested_parallelism,
            cpus = %format_cpuset(&cpus),
            "building smp runtime"
        );

        let inner = RuntimeInner {
            active: AtomicU8::new(backend as u8),
            num_threads: AtomicUsize::new(0),
            nested: AtomicBool::new(config.nested_parallelism),
            reconfigure: Mutex::new(()),
            platform_threads,
            cpus,
            sequential: Sequential,
            #[cfg(feature = "native")]
            native: NativeThreadPool::new(settings.clone()),
            #[cfg(feature = "rayon")]
            stealing: TaskStealingPool::new(settings.clone()),
            #[cfg(feature = "rayon")]
            directive: CompilerDirectiveLoop::new(settings.clone()),
            #[cfg(feature = "tokio")]
            cooperative: CooperativeScheduler::new(settings),
            metrics,
            config,
        };
        let runtime = Self {
            inner: Arc::new(inner),
        };
        runtime.update_thread_gauge();
        runtime
    }

    /// Get the resolved configuration.
    pub fn config(&self) -> &SmpConfig {
        &self.inner.config
    }

    /// Prometheus metrics of this runtime.
    pub fn metrics(&self) -> &SmpMetrics {
        &self.inner.metrics
    }

    /// CPUs this runtime may use (all available CPUs without a CPU set).
    pub fn cpus(&self) -> &[usize] {
        &self.inner.cpus
    }

    /// The active backend.
    pub fn backend(&self) -> BackendKind {
        BackendKind::from_u8(self.inner.active.load(Ordering::Acquire))
    }

    /// Switch the active backend by name.
    ///
    /// Returns `false`, leaving the active backend unchanged, if the name is
    /// unknown or that backend is not compiled in.
    pub fn set_backend(&self, name: &str) -> bool {
        match name.parse::<BackendKind>() {
            Ok(kind) => self.set_backend_kind(kind),
            Err(e) => {
                warn!(%e, "ignoring backend switch");
                false
            }
        }
    }

    /// Switch the active backend.
    ///
    /// Calls already running finish on the backend they started with.
    pub fn set_backend_kind(&self, kind: BackendKind) -> bool {
        if !kind.is_compiled() {
            warn!(backend = %kind, "backend is not compiled in");
            return false;
        }
        let _guard = self.inner.reconfigure.lock();
        let previous = BackendKind::from_u8(self.inner.active.swap(kind as u8, Ordering::AcqRel));
        if previous != kind {
            info!(from = %previous, to = %kind, "switched smp backend");
        }
        self.update_thread_gauge();
        true
    }

    /// Request `num_threads` workers from the active backend (0 = default).
    ///
    /// The native pool takes the request only before its workers exist. The
    /// rayon-based backends rebuild their pool when the count changes.
    ///
    /// # Errors
    ///
    /// Returns an error if a pool rebuild fails.
    pub fn initialize(&self, num_threads: usize) -> Result<()> {
        let _guard = self.inner.reconfigure.lock();
        self.inner.num_threads.store(num_threads, Ordering::Relaxed);
        let result = self.active_backend().initialize(num_threads);
        self.update_thread_gauge();
        result
    }

    /// Worker-count estimate of the active backend, at least 1.
    pub fn estimated_threads(&self) -> usize {
        self.active_backend().estimated_threads().max(1)
    }

    /// Worker count used absent any explicit thread configuration.
    ///
    /// The platform's available parallelism, limited by the CPU set. Not
    /// affected by `num_threads` or `max_threads`.
    pub fn estimated_default_threads(&self) -> usize {
        self.inner.platform_threads
    }

    /// Allow or forbid nested regions to run in parallel.
    pub fn set_nested_parallelism(&self, enabled: bool) {
        let _guard = self.inner.reconfigure.lock();
        self.inner.nested.store(enabled, Ordering::Release);
    }

    /// Whether nested regions run in parallel.
    pub fn nested_parallelism(&self) -> bool {
        self.inner.nested.load(Ordering::Acquire)
    }

    /// See [`crate::is_parallel_scope`].
    pub fn is_parallel_scope(&self) -> bool {
        context::is_parallel_scope()
    }

    /// See [`crate::single_thread`].
    pub fn single_thread(&self) -> bool {
        context::single_thread()
    }

    fn active_backend(&self) -> &dyn Backend {
        self.inner.backend_for(self.backend())
    }

    fn update_thread_gauge(&self) {
        let threads = self.active_backend().estimated_threads();
        self.inner
            .metrics
            .threads
            .set(i64::try_from(threads).unwrap_or(i64::MAX));
    }

    /// Run `functor` over `[first, last)` with the default grain.
    pub fn parallel_for<F: Functor>(&self, first: Index, last: Index, functor: &mut F) -> Result<()> {
        self.parallel_for_with_grain(first, last, 0, functor)
    }

    /// Run `functor` over `[first, last)` in sub-ranges of at most `grain`
    /// indices. A non-positive grain selects the backend default.
    ///
    /// Blocks until every sub-range has returned. A panic inside the functor
    /// resumes on this thread once the region has settled.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend's workers could not be started.
    pub fn parallel_for_with_grain<F: Functor>(
        &self,
        first: Index,
        last: Index,
        grain: Index,
        functor: &mut F,
    ) -> Result<()> {
        FunctorAdapter::new(&*functor).run(self, first, last, grain)?;
        if F::HAS_REDUCE {
            functor.reduce();
        }
        Ok(())
    }

    /// Run a functor the caller only holds by shared reference.
    ///
    /// Hooks work as in [`parallel_for_with_grain`](Self::parallel_for_with_grain),
    /// except that [`Functor::reduce_shared`] runs in place of `reduce`.
    pub fn parallel_for_shared<F: Functor>(
        &self,
        first: Index,
        last: Index,
        grain: Index,
        functor: &F,
    ) -> Result<()> {
        FunctorAdapter::new(functor).run(self, first, last, grain)?;
        if F::HAS_REDUCE {
            functor.reduce_shared();
        }
        Ok(())
    }

    /// Pick the backend for a region opened on the calling thread.
    pub(crate) fn select(&self) -> Target<'_> {
        let inline = context::is_parallel_scope() && !self.nested_parallelism();
        let backend: &dyn Backend = if inline {
            &self.inner.sequential
        } else {
            self.active_backend()
        };
        Target { backend, inline }
    }

    /// Open a region and run `job` over `[first, last)` on `target`.
    pub(crate) fn dispatch(
        &self,
        target: &Target<'_>,
        first: Index,
        last: Index,
        grain: Index,
        job: &Job<'_>,
    ) -> Result<()> {
        if last <= first {
            return Ok(());
        }
        // A collapsed nested region is one call for the whole range.
        let grain = if target.inline {
            last.saturating_sub(first)
        } else {
            grain
        };
        let metrics = &self.inner.metrics;
        let _active = metrics.enter_region(target.inline);
        let region = Region::open();
        trace!(
            backend = %target.backend.kind(),
            first,
            last,
            grain,
            depth = region.depth(),
            "dispatching region"
        );

        target.backend.execute(first, last, grain, &|a, b| {
            metrics.chunks_total.inc();
            let _panic = PanicCounter(metrics);
            region.run(|| job(a, b));
        })
    }

    /// Set every element of `slice` to `value`.
    pub fn fill<T>(&self, slice: &mut [T], value: T) -> Result<()>
    where
        T: Clone + Send + Sync,
    {
        let out = SharedSlice::new(slice);
        let value = &value;
        self.parallel_for(0, out.len() as Index, &mut |a: Index, b: Index| {
            // SAFETY: sub-ranges of one region are disjoint.
            unsafe { out.range_mut(a as usize, b as usize) }.fill(value.clone());
        })
    }

    /// `output[i] = op(&input[i])` over the shorter of the two slices.
    pub fn transform<T, U, F>(&self, input: &[T], output: &mut [U], op: F) -> Result<()>
    where
        T: Sync,
        U: Send,
        F: Fn(&T) -> U + Sync,
    {
        let len = input.len().min(output.len());
        let out = SharedSlice::new(&mut output[..len]);
        self.parallel_for(0, len as Index, &mut |a: Index, b: Index| {
            let (a, b) = (a as usize, b as usize);
            // SAFETY: sub-ranges of one region are disjoint.
            let dst = unsafe { out.range_mut(a, b) };
            for (dst, src) in dst.iter_mut().zip(&input[a..b]) {
                *dst = op(src);
            }
        })
    }

    /// `output[i] = op(&first[i], &second[i])` over the shortest slice.
    pub fn transform2<A, B, U, F>(&self, first: &[A], second: &[B], output: &mut [U], op: F) -> Result<()>
    where
        A: Sync,
        B: Sync,
        U: Send,
        F: Fn(&A, &B) -> U + Sync,
    {
        let len = first.len().min(second.len()).min(output.len());
        let out = SharedSlice::new(&mut output[..len]);
        self.parallel_for(0, len as Index, &mut |a: Index, b: Index| {
            let (a, b) = (a as usize, b as usize);
            // SAFETY: sub-ranges of one region are disjoint.
            let dst = unsafe { out.range_mut(a, b) };
            for ((dst, x), y) in dst.iter_mut().zip(&first[a..b]).zip(&second[a..b]) {
                *dst = op(x, y);
            }
        })
    }

    /// Apply `op` to every element of `slice` in place.
    pub fn transform_in_place<T, F>(&self, slice: &mut [T], op: F) -> Result<()>
    where
        T: Send,
        F: Fn(&mut T) + Sync,
    {
        let data = SharedSlice::new(slice);
        self.parallel_for(0, data.len() as Index, &mut |a: Index, b: Index| {
            // SAFETY: sub-ranges of one region are disjoint.
            unsafe { data.range_mut(a as usize, b as usize) }
                .iter_mut()
                .for_each(&op);
        })
    }

    /// Sort `slice` in ascending order. Not stable.
    pub fn sort<T: Ord + Send>(&self, slice: &mut [T]) -> Result<()> {
        self.sort_by(slice, T::cmp)
    }

    /// Sort `slice` with `compare`. Not stable.
    ///
    /// Parallel when the active backend is the work-stealing pool and the
    /// call is not a collapsed nested region; sequential otherwise.
    pub fn sort_by<T, C>(&self, slice: &mut [T], compare: C) -> Result<()>
    where
        T: Send,
        C: Fn(&T, &T) -> CmpOrdering + Sync,
    {
        #[cfg(feature = "rayon")]
        {
            let target = self.select();
            if !target.inline && target.backend.kind() == BackendKind::TaskStealingPool {
                return self.inner.stealing.sort_by(slice, compare);
            }
        }
        slice.sort_unstable_by(compare);
        Ok(())
    }

    /// Run `f` with temporary settings, restoring the previous ones when `f`
    /// returns or unwinds.
    ///
    /// Settings that cannot be applied (a backend that is not compiled in, a
    /// failed pool rebuild) are logged and skipped.
    pub fn local_scope<R>(&self, scope: ScopeConfig, f: impl FnOnce() -> R) -> R {
        let _restore = ScopeGuard::enter(self, &scope);
        f()
    }
}

/// Temporary settings for [`SmpRuntime::local_scope`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeConfig {
    pub backend: Option<BackendKind>,
    pub max_threads: Option<usize>,
    pub nested_parallelism: Option<bool>,
}

impl ScopeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn max_threads(mut self, threads: usize) -> Self {
        self.max_threads = Some(threads);
        self
    }

    pub fn nested_parallelism(mut self, enabled: bool) -> Self {
        self.nested_parallelism = Some(enabled);
        self
    }
}

struct ScopeGuard<'a> {
    runtime: &'a SmpRuntime,
    backend: Option<BackendKind>,
    threads: Option<usize>,
    nested: Option<bool>,
}

impl<'a> ScopeGuard<'a> {
    fn enter(runtime: &'a SmpRuntime, scope: &ScopeConfig) -> Self {
        let mut guard = Self {
            runtime,
            backend: None,
            threads: None,
            nested: None,
        };

        if let Some(kind) = scope.backend {
            let previous = runtime.backend();
            if runtime.set_backend_kind(kind) {
                guard.backend = Some(previous);
            }
        }
        if let Some(threads) = scope.max_threads {
            let previous = runtime.inner.num_threads.load(Ordering::Relaxed);
            match runtime.initialize(threads) {
                Ok(()) => guard.threads = Some(previous),
                Err(e) => warn!(%e, threads, "local scope could not resize backend"),
            }
        }
        if let Some(enabled) = scope.nested_parallelism {
            guard.nested = Some(runtime.nested_parallelism());
            runtime.set_nested_parallelism(enabled);
        }
        guard
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(enabled) = self.nested {
            self.runtime.set_nested_parallelism(enabled);
        }
        if let Some(threads) = self.threads {
            if let Err(e) = self.runtime.initialize(threads) {
                warn!(%e, threads, "local scope could not restore backend size");
            }
        }
        if let Some(kind) = self.backend {
            self.runtime.set_backend_kind(kind);
        }
    }
}

static GLOBAL: OnceLock<SmpRuntime> = OnceLock::new();

/// The process-wide runtime.
///
/// Built on first use from `SMP_*` environment variables (`SMP_BACKEND`,
/// `SMP_NUM_THREADS`, `SMP_MAX_THREADS`, `SMP_NESTED_PARALLELISM`, ...). An
/// invalid environment is logged and the defaults are used instead.
pub fn global() -> &'static SmpRuntime {
    GLOBAL.get_or_init(|| {
        SmpBuilder::new()
            .env_prefix("SMP")
            .build()
            .unwrap_or_else(|e| {
                warn!(%e, "invalid SMP_* configuration, using defaults");
                SmpRuntime::with_defaults()
            })
    })
}

impl fmt::Debug for SmpRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmpRuntime")
            .field("config", &self.inner.config)
            .field("backend", &self.backend())
            .field("nested_parallelism", &self.nested_parallelism())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for SmpRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SmpRuntime[{}]: {}({} threads, nested={}, cpus={})",
            self.inner.config.prefix,
            self.backend(),
            self.estimated_threads(),
            self.nested_parallelism(),
            format_cpuset(&self.inner.cpus),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn runtime(backend: BackendKind, threads: usize) -> SmpRuntime {
        SmpBuilder::new()
            .prefix("test")
            .backend(backend)
            .num_threads(threads)
            .build()
            .unwrap()
    }

    #[test]
    fn test_runtime_creation() {
        let rt = runtime(BackendKind::Sequential, 2);
        assert_eq!(rt.config().prefix, "test");
        assert_eq!(rt.backend(), BackendKind::Sequential);
        assert_eq!(rt.estimated_threads(), 1);
        assert!(rt.estimated_default_threads() >= 1);
        assert!(!rt.nested_parallelism());
    }

    #[test]
    fn test_set_backend_by_name() {
        let rt = runtime(BackendKind::Sequential, 2);
        assert!(!rt.set_backend("quantum"));
        assert_eq!(rt.backend(), BackendKind::Sequential);

        for kind in BackendKind::compiled() {
            assert!(rt.set_backend(&kind.as_str().to_uppercase()));
            assert_eq!(rt.backend(), kind);
            assert_eq!(rt.backend().to_string(), kind.as_str());
        }
    }

    #[test]
    fn test_uncompiled_backend_rejected() {
        let rt = runtime(BackendKind::Sequential, 2);
        for kind in BackendKind::ALL.into_iter().filter(|k| !k.is_compiled()) {
            assert!(!rt.set_backend_kind(kind));
            assert_eq!(rt.backend(), BackendKind::Sequential);
        }
    }

    #[test]
    fn test_parallel_for_covers_range_on_every_backend() {
        for kind in BackendKind::compiled() {
            let rt = runtime(kind, 3);
            let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
            rt.parallel_for_with_grain(0, 1000, 37, &mut |a: Index, b: Index| {
                for i in a..b {
                    hits[i as usize].fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
            assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1), "{kind}");
        }
    }

    #[test]
    fn test_metrics_count_regions() {
        let rt = runtime(BackendKind::Sequential, 1);
        rt.parallel_for(0, 10, &mut |_: Index, _: Index| {}).unwrap();
        rt.parallel_for(5, 5, &mut |_: Index, _: Index| {}).unwrap();
        assert_eq!(rt.metrics().regions_total.get(), 1);
        assert_eq!(rt.metrics().chunks_total.get(), 1);
        assert_eq!(rt.metrics().active_regions.get(), 0);
    }

    #[test]
    fn test_nested_region_runs_inline() {
        let rt = runtime(BackendKind::build_default(), 4);
        let outer_ok = AtomicBool::new(true);
        rt.parallel_for_with_grain(0, 8, 1, &mut |_: Index, _: Index| {
            let me = std::thread::current().id();
            let calls = AtomicUsize::new(0);
            rt.parallel_for_with_grain(0, 100, 1, &mut |a: Index, b: Index| {
                calls.fetch_add(1, Ordering::Relaxed);
                if std::thread::current().id() != me || (a, b) != (0, 100) {
                    outer_ok.store(false, Ordering::Relaxed);
                }
                if !context::is_parallel_scope() || context::region_depth() != 2 {
                    outer_ok.store(false, Ordering::Relaxed);
                }
            })
            .unwrap();
            if calls.load(Ordering::Relaxed) != 1 {
                outer_ok.store(false, Ordering::Relaxed);
            }
        })
        .unwrap();
        assert!(outer_ok.into_inner());
        assert_eq!(rt.metrics().nested_inline_total.get(), 8);
    }

    #[test]
    fn test_single_thread_has_one_leader() {
        let rt = runtime(BackendKind::build_default(), 4);
        let leaders = parking_lot::Mutex::new(HashSet::new());
        rt.parallel_for_with_grain(0, 64, 1, &mut |_: Index, _: Index| {
            if rt.single_thread() {
                leaders.lock().insert(std::thread::current().id());
            }
        })
        .unwrap();
        assert_eq!(leaders.into_inner().len(), 1);
        assert!(rt.single_thread());
        assert!(!rt.is_parallel_scope());
    }

    #[test]
    fn test_fill_and_transforms() {
        for kind in BackendKind::compiled() {
            let rt = runtime(kind, 2);
            let mut data = vec![0_i64; 1000];
            rt.fill(&mut data, 3).unwrap();
            assert!(data.iter().all(|&v| v == 3));

            let input: Vec<i64> = (0..1000).collect();
            rt.transform(&input, &mut data, |i| i * i).unwrap();
            assert_eq!(data[999], 998_001);

            let mut sums = vec![0_i64; 10];
            rt.transform2(&input, &data, &mut sums, |a, b| a + b).unwrap();
            assert_eq!(sums[3], 3 + 9);

            rt.transform_in_place(&mut data, |v| *v = -*v).unwrap();
            assert_eq!(data[10], -100);
        }
    }

    #[test]
    fn test_transform_uses_shortest_slice() {
        let rt = runtime(BackendKind::Sequential, 1);
        let input = [1, 2, 3];
        let mut output = [0; 5];
        rt.transform(&input, &mut output, |v| v * 10).unwrap();
        assert_eq!(output, [10, 20, 30, 0, 0]);
    }

    #[test]
    fn test_sort_on_every_backend() {
        for kind in BackendKind::compiled() {
            let rt = runtime(kind, 2);
            let mut values: Vec<i32> = (0..5000).map(|i| (i * 7919) % 5003).collect();
            rt.sort(&mut values).unwrap();
            assert!(values.windows(2).all(|w| w[0] <= w[1]), "{kind}");
        }
    }

    #[test]
    fn test_local_scope_restores() {
        let rt = runtime(BackendKind::Sequential, 2);
        let scope = ScopeConfig::new()
            .backend(BackendKind::build_default())
            .nested_parallelism(true);
        let inside = rt.local_scope(scope, || (rt.backend(), rt.nested_parallelism()));
        assert_eq!(inside, (BackendKind::build_default(), true));
        assert_eq!(rt.backend(), BackendKind::Sequential);
        assert!(!rt.nested_parallelism());
    }

    #[test]
    fn test_local_scope_restores_on_panic() {
        let rt = runtime(BackendKind::Sequential, 2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            rt.local_scope(ScopeConfig::new().nested_parallelism(true), || {
                panic!("inside scope")
            })
        }));
        assert!(result.is_err());
        assert!(!rt.nested_parallelism());
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_local_scope_resizes_stealing_pool() {
        let rt = runtime(BackendKind::TaskStealingPool, 2);
        let inside = rt.local_scope(ScopeConfig::new().max_threads(3), || rt.estimated_threads());
        assert_eq!(inside, 3);
        assert_eq!(rt.estimated_threads(), 2);
    }

    #[test]
    fn test_initialize_sets_thread_gauge() {
        let rt = runtime(BackendKind::build_default(), 2);
        rt.initialize(3).unwrap();
        assert_eq!(rt.estimated_threads(), 3);
        assert_eq!(rt.metrics().threads.get(), 3);
    }

    #[test]
    fn test_max_threads_caps_until_explicit_initialize() {
        let rt = SmpBuilder::new()
            .backend(BackendKind::build_default())
            .num_threads(8)
            .max_threads(2)
            .build()
            .unwrap();
        assert_eq!(rt.estimated_threads(), 2);
        rt.initialize(0).unwrap();
        assert_eq!(rt.estimated_threads(), 2);
        rt.initialize(4).unwrap();
        assert_eq!(rt.estimated_threads(), 4);
    }

    #[test]
    fn test_shared_functor_hooks() {
        use std::sync::atomic::AtomicI64;

        struct Histogram {
            inits: AtomicUsize,
            total: AtomicI64,
            reduced_on: parking_lot::Mutex<Vec<std::thread::ThreadId>>,
        }

        impl Functor for Histogram {
            const HAS_INITIALIZE: bool = true;
            const HAS_REDUCE: bool = true;

            fn initialize(&self) {
                self.inits.fetch_add(1, Ordering::Relaxed);
            }

            fn execute(&self, first: Index, last: Index) {
                self.total.fetch_add((first..last).sum::<i64>(), Ordering::Relaxed);
            }

            fn reduce_shared(&self) {
                self.reduced_on.lock().push(std::thread::current().id());
            }
        }

        for kind in BackendKind::compiled() {
            let rt = runtime(kind, 3);
            let histogram = Histogram {
                inits: AtomicUsize::new(0),
                total: AtomicI64::new(0),
                reduced_on: parking_lot::Mutex::new(Vec::new()),
            };
            let shared = &histogram;
            rt.parallel_for_shared(0, 1001, 50, shared).unwrap();

            assert_eq!(histogram.total.load(Ordering::Relaxed), 500_500, "{kind}");
            let inits = histogram.inits.load(Ordering::Relaxed);
            assert!((1..=21).contains(&inits), "{kind}: {inits} inits");
            assert_eq!(
                *histogram.reduced_on.lock(),
                vec![std::thread::current().id()],
                "{kind}"
            );
        }
    }

    #[test]
    fn test_default_threads_ignore_max_threads() {
        let platform = std::thread::available_parallelism().map_or(1, |n| n.get());
        let rt = SmpBuilder::new()
            .backend(BackendKind::Sequential)
            .max_threads(1)
            .build()
            .unwrap();
        assert_eq!(rt.estimated_default_threads(), platform);
    }

    #[test]
    fn test_explicit_grain_on_sequential() {
        let rt = runtime(BackendKind::Sequential, 1);
        let ranges = parking_lot::Mutex::new(Vec::new());
        rt.parallel_for_with_grain(0, 1000, 37, &mut |a: Index, b: Index| {
            ranges.lock().push((a, b));
        })
        .unwrap();
        let ranges = ranges.into_inner();
        assert_eq!(ranges.len(), 28);
        assert!(ranges.iter().all(|(a, b)| b - a <= 37));
        assert_eq!((ranges[0].0, ranges[27].1), (0, 1000));
    }

    #[test]
    fn test_nested_explicit_grain_stays_one_call() {
        let rt = runtime(BackendKind::Sequential, 1);
        let nested = AtomicUsize::new(0);
        rt.parallel_for_with_grain(0, 2, 1, &mut |_: Index, _: Index| {
            rt.parallel_for_with_grain(0, 100, 3, &mut |a: Index, b: Index| {
                assert_eq!((a, b), (0, 100));
                nested.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(nested.into_inner(), 2);
    }

    #[test]
    fn test_display() {
        let rt = runtime(BackendKind::Sequential, 1);
        let text = rt.to_string();
        assert!(text.starts_with("SmpRuntime[test]: sequential(1 threads"));
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(global(), global()));
        assert!(global().estimated_threads() >= 1);
    }
}
