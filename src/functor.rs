//! The functor contract and the adapter that runs a functor over a range.
//!
//! A functor is the per-sub-range unit of work. It may opt into two hooks:
//!
//! - `initialize`, run once on each worker before that worker's first
//!   sub-range, and only on workers that receive one;
//! - `reduce`, run once on the calling thread after every sub-range returned,
//!   also for empty ranges.
//!
//! A functor the caller can only share runs through
//! [`SmpRuntime::parallel_for_shared`], which calls
//! [`reduce_shared`](Functor::reduce_shared) in place of `reduce`.
//!
//! Hooks are declared with the associated consts, so the adapter knows at
//! compile time which ones to call.
//!
//! ```
//! use smp_rs::{Functor, Index, ThreadLocalStore};
//!
//! struct Sum {
//!     partial: ThreadLocalStore<i64>,
//!     total: i64,
//! }
//!
//! impl Functor for Sum {
//!     const HAS_INITIALIZE: bool = true;
//!     const HAS_REDUCE: bool = true;
//!
//!     fn initialize(&self) {
//!         *self.partial.local() = 0;
//!     }
//!
//!     fn execute(&self, first: Index, last: Index) {
//!         *self.partial.local() += (first..last).sum::<i64>();
//!     }
//!
//!     fn reduce(&mut self) {
//!         self.total = self.partial.iter_mut().map(|v| *v).sum();
//!     }
//! }
//!
//! let mut sum = Sum { partial: ThreadLocalStore::new(), total: 0 };
//! smp_rs::parallel_for(0, 1001, &mut sum).unwrap();
//! assert_eq!(sum.total, 500_500);
//! ```

use crate::error::Result;
use crate::local_store::ThreadLocalStore;
use crate::runtime::SmpRuntime;
use crate::Index;

/// Work executed over sub-ranges of a parallel range.
///
/// Every `Fn(Index, Index) + Sync` closure is a functor without hooks.
pub trait Functor: Sync {
    /// Whether [`initialize`](Self::initialize) should be called.
    const HAS_INITIALIZE: bool = false;

    /// Whether [`reduce`](Self::reduce) (or, for shared calls,
    /// [`reduce_shared`](Self::reduce_shared)) should be called.
    const HAS_REDUCE: bool = false;

    /// Per-worker set-up, run before the worker's first sub-range.
    fn initialize(&self) {}

    /// Process indices `[first, last)`.
    fn execute(&self, first: Index, last: Index);

    /// Combine per-worker results once all sub-ranges returned.
    fn reduce(&mut self) {}

    /// Like [`reduce`](Self::reduce), for functors run through a shared
    /// reference. Results go to interior-mutable state.
    fn reduce_shared(&self) {}
}

impl<F> Functor for F
where
    F: Fn(Index, Index) + Sync,
{
    fn execute(&self, first: Index, last: Index) {
        self(first, last)
    }
}

/// Which optional hooks a functor type declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctorCapability {
    pub has_initialize: bool,
    pub has_reduce: bool,
}

impl FunctorCapability {
    pub const fn of<F: Functor>() -> Self {
        Self {
            has_initialize: F::HAS_INITIALIZE,
            has_reduce: F::HAS_REDUCE,
        }
    }
}

/// Wraps one functor for one `parallel_for` call.
///
/// Tracks which workers have run `initialize`. Reduction is left to the
/// caller, who knows whether it holds the functor exclusively.
pub struct FunctorAdapter<'f, F: Functor> {
    functor: &'f F,
    initialized: Option<ThreadLocalStore<bool>>,
}

impl<'f, F: Functor> FunctorAdapter<'f, F> {
    pub fn new(functor: &'f F) -> Self {
        Self {
            functor,
            initialized: F::HAS_INITIALIZE.then(ThreadLocalStore::new),
        }
    }

    /// Run one sub-range on the calling worker.
    pub fn execute(&self, first: Index, last: Index) {
        if let Some(initialized) = &self.initialized {
            let mut done = initialized.local();
            if !*done {
                self.functor.initialize();
                *done = true;
            }
        }
        self.functor.execute(first, last);
    }

    /// Run the functor over `[first, last)` on `runtime` and wait.
    ///
    /// A non-positive `grain` is replaced by the selected backend's default.
    /// Does not reduce.
    pub fn run(&self, runtime: &SmpRuntime, first: Index, last: Index, grain: Index) -> Result<()> {
        let target = runtime.select();
        let grain = if grain > 0 {
            grain
        } else {
            target.backend.default_grain(range_len(first, last))
        };
        runtime.dispatch(&target, first, last, grain, &|a, b| self.execute(a, b))
    }
}

/// Number of indices in `[first, last)`, saturating at `Index::MAX`.
fn range_len(first: Index, last: Index) -> Index {
    if last <= first {
        0
    } else {
        last.checked_sub(first).unwrap_or(Index::MAX)
    }
}
