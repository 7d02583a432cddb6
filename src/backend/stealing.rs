//! Work-stealing backend on a rayon pool.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::debug;

use super::{Backend, BackendKind, Job, PoolSettings};
use crate::error::Result;
use crate::partition::{chunk_bounds, chunk_count};
use crate::Index;

/// A rayon pool that is built lazily and rebuilt when resized.
///
/// Calls already running keep the pool they started on; it is dropped when
/// the last of them returns.
#[derive(Debug)]
pub(super) struct ReconfigurablePool {
    flavor: &'static str,
    settings: PoolSettings,
    requested: AtomicUsize,
    pool: RwLock<Option<Arc<rayon::ThreadPool>>>,
}

impl ReconfigurablePool {
    pub(super) fn new(flavor: &'static str, settings: PoolSettings) -> Self {
        let requested = AtomicUsize::new(settings.threads.max(1));
        Self {
            flavor,
            settings,
            requested,
            pool: RwLock::new(None),
        }
    }

    pub(super) fn get(&self) -> Result<Arc<rayon::ThreadPool>> {
        if let Some(pool) = self.pool.read().as_ref() {
            return Ok(Arc::clone(pool));
        }
        let mut slot = self.pool.write();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(self.build(self.requested.load(Ordering::Relaxed))?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Resize to `num_threads` (0 = default), rebuilding a live pool.
    pub(super) fn resize(&self, num_threads: usize) -> Result<()> {
        let threads = self.settings.resolve(num_threads);
        let mut slot = self.pool.write();
        self.requested.store(threads, Ordering::Relaxed);
        match slot.as_ref() {
            Some(pool) if pool.current_num_threads() == threads => {}
            Some(pool) => {
                debug!(
                    flavor = self.flavor,
                    from = pool.current_num_threads(),
                    to = threads,
                    "rebuilding rayon pool"
                );
                *slot = Some(Arc::new(self.build(threads)?));
            }
            None => {}
        }
        Ok(())
    }

    pub(super) fn threads(&self) -> usize {
        self.pool
            .read()
            .as_ref()
            .map_or_else(
                || self.requested.load(Ordering::Relaxed),
                |pool| pool.current_num_threads(),
            )
            .max(1)
    }

    fn build(&self, threads: usize) -> Result<rayon::ThreadPool> {
        let workers = self.settings.workers.clone();
        let flavor = self.flavor;
        let on_start = self.settings.workers.pool_start(flavor);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| workers.thread_name(flavor, index))
            .start_handler(move |_index| on_start())
            .build()?;
        debug!(
            prefix = %self.settings.workers.prefix(),
            flavor,
            threads,
            "rayon pool started"
        );
        Ok(pool)
    }
}

/// Work-stealing pool backed by rayon.
///
/// Chunks become independent rayon tasks. Idle workers steal them, so uneven
/// chunks balance without a shared cursor. The pool can be resized at any
/// time and also provides a parallel sort.
#[derive(Debug)]
pub struct TaskStealingPool {
    pool: ReconfigurablePool,
}

impl TaskStealingPool {
    pub(crate) fn new(settings: PoolSettings) -> Self {
        Self {
            pool: ReconfigurablePool::new("rayon", settings),
        }
    }

    /// Sort `slice` in parallel with `compare`. Not stable.
    pub fn sort_by<T, F>(&self, slice: &mut [T], compare: F) -> Result<()>
    where
        T: Send,
        F: Fn(&T, &T) -> CmpOrdering + Sync,
    {
        let pool = self.pool.get()?;
        let compare = &compare;
        pool.install(|| slice.par_sort_unstable_by(compare));
        Ok(())
    }
}

impl Backend for TaskStealingPool {
    fn kind(&self) -> BackendKind {
        BackendKind::TaskStealingPool
    }

    fn initialize(&self, num_threads: usize) -> Result<()> {
        self.pool.resize(num_threads)
    }

    fn estimated_threads(&self) -> usize {
        self.pool.threads()
    }

    fn execute(&self, first: Index, last: Index, grain: Index, job: &Job<'_>) -> Result<()> {
        let count = chunk_count(first, last, grain);
        if count == 0 {
            return Ok(());
        }
        let pool = self.pool.get()?;
        pool.install(|| {
            (0..count).into_par_iter().for_each(|index| {
                if let Some((a, b)) = chunk_bounds(first, last, grain, index) {
                    job(a, b);
                }
            })
        });
        Ok(())
    }
}
