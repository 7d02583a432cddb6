//! Fixed pool of native threads.
//!
//! The pool is spawned on first use (or by `initialize`) with `N - 1` threads;
//! the thread calling `execute` always works as the N-th member, so nested
//! regions make progress even when every pool thread is busy.
//!
//! ```text
//!   caller ──push──▶ regions: VecDeque<Arc<RegionTask>> ◀──front── workers
//!     │                          │
//!     └── drains its own region ─┴── cursor.claim() until exhausted
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{run_chunk, Backend, BackendKind, ErasedJob, Job, PanicSlot, PoolSettings};
use crate::error::Result;
use crate::partition::ChunkCursor;
use crate::Index;

const FLAVOR: &str = "native";

/// Fixed-size std::thread pool; the calling thread is worker 0.
///
/// The worker count is fixed once the threads exist. Later `initialize`
/// calls are ignored.
#[derive(Debug)]
pub struct NativeThreadPool {
    settings: PoolSettings,
    requested: AtomicUsize,
    init_lock: Mutex<()>,
    pool: OnceLock<Pool>,
}

#[derive(Debug)]
struct Pool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    threads: usize,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct Queue {
    regions: VecDeque<Arc<RegionTask>>,
    shutdown: bool,
}

/// One `execute` call as seen by the workers.
struct RegionTask {
    cursor: ChunkCursor,
    job: ErasedJob,
    pending: AtomicU64,
    done: Mutex<bool>,
    done_cv: Condvar,
    panics: PanicSlot,
}

impl std::fmt::Debug for RegionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionTask")
            .field("cursor", &self.cursor)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RegionTask {
    fn work(&self) {
        while let Some((first, last)) = self.cursor.claim() {
            // SAFETY: the chunk was claimed, so `pending` is non-zero and the
            // caller is still blocked in `execute` keeping the job alive.
            let settled = run_chunk(&self.cursor, &self.panics, first, last, |a, b| unsafe {
                self.job.call(a, b)
            });
            self.settle(settled);
        }
    }

    fn settle(&self, chunks: u64) {
        if self.pending.fetch_sub(chunks, Ordering::AcqRel) == chunks {
            let mut done = self.done.lock();
            *done = true;
            self.done_cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
    }
}

impl NativeThreadPool {
    pub(crate) fn new(settings: PoolSettings) -> Self {
        let requested = AtomicUsize::new(settings.threads.max(1));
        Self {
            settings,
            requested,
            init_lock: Mutex::new(()),
            pool: OnceLock::new(),
        }
    }

    /// Whether the worker threads have been spawned.
    pub fn is_started(&self) -> bool {
        self.pool.get().is_some()
    }

    fn pool(&self) -> Result<&Pool> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        let _guard = self.init_lock.lock();
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        let pool = self.spawn(self.requested.load(Ordering::Relaxed))?;
        Ok(self.pool.get_or_init(|| pool))
    }

    fn spawn(&self, threads: usize) -> Result<Pool> {
        let shared = Arc::new(Shared::default());
        let on_start = Arc::new(self.settings.workers.pool_start(FLAVOR));
        let mut handles = Vec::with_capacity(threads.saturating_sub(1));

        for index in 1..threads {
            let worker_shared = Arc::clone(&shared);
            let worker_start = Arc::clone(&on_start);
            let spawned = std::thread::Builder::new()
                .name(self.settings.workers.thread_name(FLAVOR, index))
                .spawn(move || {
                    worker_start();
                    worker_loop(&worker_shared);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shut_down(&shared, handles);
                    return Err(e.into());
                }
            }
        }

        debug!(
            prefix = %self.settings.workers.prefix(),
            threads,
            "native thread pool started"
        );
        Ok(Pool {
            shared,
            handles,
            threads,
        })
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                while queue
                    .regions
                    .front()
                    .is_some_and(|task| task.cursor.is_exhausted())
                {
                    queue.regions.pop_front();
                }
                if let Some(task) = queue.regions.front() {
                    break Arc::clone(task);
                }
                shared.wake.wait(&mut queue);
            }
        };
        task.work();
    }
}

fn shut_down(shared: &Shared, handles: Vec<JoinHandle<()>>) {
    shared.queue.lock().shutdown = true;
    shared.wake.notify_all();
    for handle in handles {
        let _ = handle.join();
    }
}

impl Backend for NativeThreadPool {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeThreadPool
    }

    fn initialize(&self, num_threads: usize) -> Result<()> {
        let threads = self.settings.resolve(num_threads);
        let _guard = self.init_lock.lock();
        match self.pool.get() {
            Some(pool) => {
                if pool.threads != threads {
                    debug!(
                        current = pool.threads,
                        requested = threads,
                        "native thread pool already running, ignoring resize"
                    );
                }
            }
            None => self.requested.store(threads, Ordering::Relaxed),
        }
        Ok(())
    }

    fn estimated_threads(&self) -> usize {
        self.pool
            .get()
            .map_or_else(|| self.requested.load(Ordering::Relaxed), |pool| pool.threads)
            .max(1)
    }

    fn execute(&self, first: Index, last: Index, grain: Index, job: &Job<'_>) -> Result<()> {
        let cursor = ChunkCursor::new(first, last, grain);
        let count = cursor.count();
        if count == 0 {
            return Ok(());
        }
        let pool = self.pool()?;

        let task = Arc::new(RegionTask {
            cursor,
            // SAFETY: `execute` does not return before `pending` reaches zero,
            // and the job is only called for claimed chunks.
            job: unsafe { ErasedJob::new(job) },
            pending: AtomicU64::new(count),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            panics: PanicSlot::default(),
        });

        let shared = &pool.shared;
        let published = pool.threads > 1 && count > 1;
        if published {
            shared.queue.lock().regions.push_back(Arc::clone(&task));
            shared.wake.notify_all();
        }

        task.work();
        task.wait();

        if published {
            shared
                .queue
                .lock()
                .regions
                .retain(|queued| !Arc::ptr_eq(queued, &task));
        }
        task.panics.resume();
        Ok(())
    }
}

impl Drop for NativeThreadPool {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            shut_down(&pool.shared, pool.handles);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{assert_panic_propagates, settings, standard_checks};
    use crate::context;
    use std::collections::HashSet;

    #[test]
    fn test_partitions_range() {
        standard_checks(&NativeThreadPool::new(settings(4)));
    }

    #[test]
    fn test_lazy_start_and_fixed_size() {
        let backend = NativeThreadPool::new(settings(2));
        assert!(!backend.is_started());
        backend.initialize(3).unwrap();
        assert_eq!(backend.estimated_threads(), 3);

        backend.execute(0, 10, 1, &|_, _| {}).unwrap();
        assert!(backend.is_started());

        backend.initialize(8).unwrap();
        assert_eq!(backend.estimated_threads(), 3);
    }

    #[test]
    fn test_caller_participates() {
        let backend = NativeThreadPool::new(settings(1));
        let caller = context::worker_slot();
        let seen = Mutex::new(HashSet::new());
        backend
            .execute(0, 100, 1, &|_, _| {
                seen.lock().insert(context::worker_slot());
            })
            .unwrap();
        assert_eq!(seen.into_inner(), HashSet::from([caller]));
    }

    #[test]
    fn test_uses_multiple_workers() {
        use std::sync::Barrier;

        let backend = NativeThreadPool::new(settings(4));
        // Every chunk waits until two distinct threads are inside it.
        let barrier = Barrier::new(2);
        let seen = Mutex::new(HashSet::new());
        backend
            .execute(0, 2, 1, &|_, _| {
                seen.lock().insert(std::thread::current().id());
                barrier.wait();
            })
            .unwrap();
        assert_eq!(seen.into_inner().len(), 2);
    }

    #[test]
    fn test_worker_thread_names() {
        let backend = NativeThreadPool::new(settings(3));
        let names = Mutex::new(HashSet::new());
        let barrier = std::sync::Barrier::new(3);
        backend
            .execute(0, 3, 1, &|_, _| {
                if let Some(name) = std::thread::current().name() {
                    names.lock().insert(name.to_string());
                }
                barrier.wait();
            })
            .unwrap();
        let names = names.into_inner();
        assert!(names.contains("test-native-0001"));
        assert!(names.contains("test-native-0002"));
    }

    #[test]
    fn test_panic_propagates() {
        let backend = NativeThreadPool::new(settings(4));
        assert_panic_propagates(&backend);
        // The pool is still usable afterwards.
        standard_checks(&backend);
    }

    #[test]
    fn test_nested_execute_on_same_pool() {
        let backend = NativeThreadPool::new(settings(2));
        let total = AtomicU64::new(0);
        backend
            .execute(0, 8, 1, &|_, _| {
                backend
                    .execute(0, 8, 1, &|a, b| {
                        total.fetch_add((b - a) as u64, Ordering::Relaxed);
                    })
                    .unwrap();
            })
            .unwrap();
        assert_eq!(total.into_inner(), 64);
    }
}
