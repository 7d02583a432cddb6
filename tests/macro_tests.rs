//! Integration tests for the #[smp_rs::test] macro.
//!
//! Each test body runs once per compiled-in backend unless a backend is named.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use smp_rs::{BackendKind, Functor, Index, SmpRuntime, ThreadLocalStore};

/// Records every sub-range it is handed.
#[derive(Default)]
struct Recorder {
    ranges: Mutex<Vec<(Index, Index)>>,
}

impl Functor for Recorder {
    fn execute(&self, first: Index, last: Index) {
        self.ranges.lock().unwrap().push((first, last));
    }
}

impl Recorder {
    fn sorted(self) -> Vec<(Index, Index)> {
        let mut ranges = self.ranges.into_inner().unwrap();
        ranges.sort_unstable();
        ranges
    }
}

fn assert_covers(ranges: &[(Index, Index)], first: Index, last: Index) {
    let mut next = first;
    for &(a, b) in ranges {
        assert_eq!(a, next, "gap or overlap at {a}");
        assert!(a < b);
        next = b;
    }
    assert_eq!(next, last);
}

/// Sum reduction with per-worker partials and hook bookkeeping.
struct Sum {
    partial: ThreadLocalStore<i64>,
    initialized: ThreadLocalStore<usize>,
    reduced: usize,
    reduced_on: Option<std::thread::ThreadId>,
    total: i64,
}

impl Sum {
    fn new() -> Self {
        Self {
            partial: ThreadLocalStore::new(),
            initialized: ThreadLocalStore::new(),
            reduced: 0,
            reduced_on: None,
            total: 0,
        }
    }
}

impl Functor for Sum {
    const HAS_INITIALIZE: bool = true;
    const HAS_REDUCE: bool = true;

    fn initialize(&self) {
        *self.initialized.local() += 1;
        *self.partial.local() = 0;
    }

    fn execute(&self, first: Index, last: Index) {
        assert_eq!(*self.initialized.local(), 1, "execute before initialize");
        *self.partial.local() += (first..last).sum::<i64>();
    }

    fn reduce(&mut self) {
        self.reduced += 1;
        self.reduced_on = Some(std::thread::current().id());
        self.total = self.partial.iter_mut().map(|v| *v).sum();
    }
}

/// Test sub-ranges cover the range exactly once with the default grain
#[smp_rs::test]
fn test_coverage_default_grain(rt: &SmpRuntime) {
    let mut recorder = Recorder::default();
    rt.parallel_for(-250, 1000, &mut recorder).unwrap();
    assert_covers(&recorder.sorted(), -250, 1000);
}

/// Test an explicit grain bounds every sub-range
#[smp_rs::test(threads = 3)]
fn test_coverage_explicit_grain(rt: &SmpRuntime) {
    let mut recorder = Recorder::default();
    rt.parallel_for_with_grain(0, 1000, 37, &mut recorder).unwrap();
    let ranges = recorder.sorted();
    assert_covers(&ranges, 0, 1000);
    assert_eq!(ranges.len(), 28);
    assert!(ranges.iter().all(|(a, b)| b - a <= 37));
}

/// Test empty and inverted ranges never call the functor but still reduce
#[smp_rs::test]
fn test_empty_range(rt: &SmpRuntime) {
    for (first, last) in [(5, 5), (10, 3)] {
        let mut sum = Sum::new();
        rt.parallel_for(first, last, &mut sum).unwrap();
        assert_eq!(sum.reduced, 1);
        assert_eq!(sum.total, 0);
        assert!(sum.initialized.is_empty());
    }
}

/// Test initialize runs exactly once per participating worker
#[smp_rs::test(threads = 4)]
fn test_initialize_once_per_worker(rt: &SmpRuntime) {
    let mut sum = Sum::new();
    rt.parallel_for_with_grain(0, 10_000, 10, &mut sum).unwrap();
    assert_eq!(sum.reduced, 1);
    assert!(!sum.initialized.is_empty());
    assert!(sum.initialized.iter_mut().all(|count| *count == 1));
}

/// Test every backend produces the same reduction
#[smp_rs::test]
fn test_backend_equivalence(rt: &SmpRuntime) {
    let mut sum = Sum::new();
    rt.parallel_for(0, 1001, &mut sum).unwrap();
    assert_eq!(sum.total, 500_500);
}

/// Test reduce runs once, on the calling thread, after many sub-ranges
#[smp_rs::test(threads = 4)]
fn test_reduce_on_calling_thread(rt: &SmpRuntime) {
    let mut sum = Sum::new();
    rt.parallel_for_with_grain(0, 10_000, 16, &mut sum).unwrap();
    assert_eq!(sum.reduced, 1);
    assert_eq!(sum.reduced_on, Some(std::thread::current().id()));
    assert_eq!(sum.total, 49_995_000);
}

/// Test the native pool with a single worker and with eight
#[test]
fn test_native_pool_thread_counts_agree() {
    if !BackendKind::NativeThreadPool.is_compiled() {
        return;
    }
    for threads in [1, 8] {
        let rt = smp_rs::SmpBuilder::new()
            .backend(BackendKind::NativeThreadPool)
            .num_threads(threads)
            .build()
            .unwrap();
        let mut sum = Sum::new();
        rt.parallel_for(0, 1001, &mut sum).unwrap();
        assert_eq!(sum.total, 500_500, "{threads} threads");
    }
}

/// Test nested regions run inline on the calling worker
#[smp_rs::test(threads = 4)]
fn test_nested_regions_inline(rt: &SmpRuntime) {
    let outer_threads = Mutex::new(HashSet::new());
    let nested_threads = Mutex::new(HashSet::new());
    let outer_calls = AtomicUsize::new(0);
    let nested_calls = AtomicUsize::new(0);

    rt.parallel_for_with_grain(0, 16, 1, &mut |_: Index, _: Index| {
        outer_calls.fetch_add(1, Ordering::Relaxed);
        let me = std::thread::current().id();
        outer_threads.lock().unwrap().insert(me);
        rt.parallel_for(0, 1000, &mut |a: Index, b: Index| {
            assert!(rt.is_parallel_scope());
            assert_eq!((a, b), (0, 1000));
            assert_eq!(std::thread::current().id(), me);
            nested_calls.fetch_add(1, Ordering::Relaxed);
            nested_threads.lock().unwrap().insert(me);
        })
        .unwrap();
    })
    .unwrap();

    assert_eq!(nested_calls.into_inner(), outer_calls.into_inner());
    let outer = outer_threads.into_inner().unwrap();
    assert!(nested_threads.into_inner().unwrap().is_subset(&outer));
}

/// Test nested regions fan out when nested parallelism is enabled
#[smp_rs::test(threads = 2, backend = "stealing")]
fn test_nested_parallelism_enabled(rt: &SmpRuntime) {
    rt.set_nested_parallelism(true);
    let chunks = AtomicUsize::new(0);
    rt.parallel_for_with_grain(0, 4, 1, &mut |_: Index, _: Index| {
        rt.parallel_for_with_grain(0, 100, 10, &mut |_: Index, _: Index| {
            chunks.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    })
    .unwrap();
    assert_eq!(chunks.into_inner(), 40);
}

/// Test the fill-with-squares scenario for auto and explicit grain
#[smp_rs::test]
fn test_squares_end_to_end(rt: &SmpRuntime) {
    let expected: Vec<i64> = (0..1000).map(|i| i * i).collect();
    for grain in [0, 37] {
        let out = Mutex::new(vec![-1_i64; 1000]);
        rt.parallel_for_with_grain(0, 1000, grain, &mut |a: Index, b: Index| {
            let mut out = out.lock().unwrap();
            for i in a..b {
                out[i as usize] = i * i;
            }
        })
        .unwrap();
        assert_eq!(out.into_inner().unwrap(), expected, "grain {grain}");
    }
}

/// Test the thread-count floor
#[smp_rs::test(threads = 1)]
fn test_thread_count_floor(rt: &SmpRuntime) {
    assert!(rt.estimated_threads() >= 1);
    assert!(rt.estimated_default_threads() >= 1);
    if rt.backend() == BackendKind::Sequential {
        assert_eq!(rt.estimated_threads(), 1);
    }
}

/// Test a panicking functor propagates to the caller
#[smp_rs::test]
fn test_functor_panic_propagates(rt: &SmpRuntime) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.parallel_for_with_grain(0, 100, 10, &mut |a: Index, b: Index| {
            if (a..b).contains(&50) {
                panic!("sub-range failed");
            }
        })
    }));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"sub-range failed"));

    // The runtime stays usable afterwards.
    let mut sum = Sum::new();
    rt.parallel_for(0, 1001, &mut sum).unwrap();
    assert_eq!(sum.total, 500_500);
}

/// Test the parallel algorithms
#[smp_rs::test(threads = 2)]
fn test_algorithms(rt: &SmpRuntime) {
    let mut values = vec![0_u32; 4096];
    rt.fill(&mut values, 7).unwrap();
    assert!(values.iter().all(|&v| v == 7));

    let input: Vec<u32> = (0..4096).rev().collect();
    rt.transform(&input, &mut values, |v| v % 97).unwrap();
    rt.sort(&mut values).unwrap();
    assert!(values.windows(2).all(|w| w[0] <= w[1]));

    rt.sort_by(&mut values, |a, b| b.cmp(a)).unwrap();
    assert!(values.windows(2).all(|w| w[0] >= w[1]));
}
