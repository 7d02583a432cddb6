//! Integration tests for the free functions operating on the global runtime.
//!
//! The global runtime is shared by every test in this binary, so tests that
//! change its settings hold `SERIAL` and restore what they changed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use smp_rs::{BackendKind, Index, ScopeConfig};

static SERIAL: Mutex<()> = Mutex::new(());

/// Serialize access to the global runtime and route its logs to the test
/// output (filtered by `RUST_LOG`).
fn serial() -> std::sync::MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn test_parallel_for_on_global() {
    let _serial = serial();
    let total = AtomicI64::new(0);
    smp_rs::parallel_for(0, 1001, &mut |a: Index, b: Index| {
        total.fetch_add((a..b).sum::<i64>(), Ordering::Relaxed);
    })
    .unwrap();
    assert_eq!(total.into_inner(), 500_500);
}

#[test]
fn test_set_backend_roundtrip() {
    let _serial = serial();
    let previous = smp_rs::backend();

    assert!(!smp_rs::set_backend("no-such-backend"));
    assert_eq!(smp_rs::backend(), previous);

    for kind in BackendKind::compiled() {
        assert!(smp_rs::set_backend(kind.as_str()));
        assert_eq!(smp_rs::backend(), kind);
        assert!(smp_rs::estimated_threads() >= 1);

        let total = AtomicI64::new(0);
        smp_rs::parallel_for_with_grain(0, 1000, 7, &mut |a: Index, b: Index| {
            total.fetch_add(b - a, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(total.into_inner(), 1000, "{kind}");
    }

    assert!(smp_rs::set_backend(previous.as_str()));
}

#[test]
fn test_nested_parallelism_toggle() {
    let _serial = serial();
    assert!(!smp_rs::nested_parallelism());
    smp_rs::set_nested_parallelism(true);
    assert!(smp_rs::nested_parallelism());
    smp_rs::set_nested_parallelism(false);
    assert!(!smp_rs::nested_parallelism());
}

#[test]
fn test_local_scope_on_global() {
    let _serial = serial();
    let previous = smp_rs::backend();
    let scope = ScopeConfig::new()
        .backend(BackendKind::Sequential)
        .nested_parallelism(true);

    let seen = smp_rs::local_scope(scope, || {
        (
            smp_rs::backend(),
            smp_rs::nested_parallelism(),
            smp_rs::estimated_threads(),
        )
    });
    assert_eq!(seen, (BackendKind::Sequential, true, 1));
    assert_eq!(smp_rs::backend(), previous);
    assert!(!smp_rs::nested_parallelism());
}

#[test]
fn test_parallel_for_shared_on_global() {
    let _serial = serial();
    let total = AtomicI64::new(0);
    let functor = |a: Index, b: Index| {
        total.fetch_add((a..b).sum::<i64>(), Ordering::Relaxed);
    };
    smp_rs::parallel_for_shared(0, 101, 10, &functor).unwrap();
    assert_eq!(total.into_inner(), 5050);
}

#[test]
fn test_scope_queries_outside_region() {
    assert!(!smp_rs::is_parallel_scope());
    assert!(smp_rs::single_thread());
    assert!(smp_rs::estimated_default_threads() >= 1);
}

#[test]
fn test_algorithms_on_global() {
    let _serial = serial();
    let mut values: Vec<i32> = (0..2000).map(|i| (i * 31) % 1999).collect();
    smp_rs::sort(&mut values).unwrap();
    assert!(values.windows(2).all(|w| w[0] <= w[1]));

    let mut doubled = vec![0; values.len()];
    smp_rs::transform(&values, &mut doubled, |v| v * 2).unwrap();
    assert_eq!(doubled[1999], values[1999] * 2);

    let mut sums = vec![0; values.len()];
    smp_rs::transform2(&values, &doubled, &mut sums, |a, b| a + b).unwrap();
    assert_eq!(sums[10], values[10] * 3);

    smp_rs::transform_in_place(&mut sums, |v| *v = 0).unwrap();
    assert!(sums.iter().all(|&v| v == 0));

    smp_rs::fill(&mut sums, 9).unwrap();
    smp_rs::sort_by(&mut values, |a, b| b.cmp(a)).unwrap();
    assert!(values.windows(2).all(|w| w[0] >= w[1]));
    assert!(sums.iter().all(|&v| v == 9));
}
