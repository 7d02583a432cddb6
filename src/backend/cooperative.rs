//! Cooperative tasks on a tokio multi-thread runtime.
//!
//! A region becomes `min(workers, chunks)` tasks that claim chunks from a
//! shared cursor and yield to the scheduler between chunks. The runtime is
//! created once, on first use, and its worker count is read back from it.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tracing::debug;

use super::{run_chunk, Backend, BackendKind, ErasedJob, Job, PanicSlot, PoolSettings};
use crate::error::Result;
use crate::partition::ChunkCursor;
use crate::Index;

const FLAVOR: &str = "tokio";

/// Cooperative scheduler backed by a tokio runtime.
#[derive(Debug)]
pub struct CooperativeScheduler {
    settings: PoolSettings,
    requested: AtomicUsize,
    init_lock: Mutex<()>,
    runtime: OnceLock<Runtime>,
}

impl CooperativeScheduler {
    pub(crate) fn new(settings: PoolSettings) -> Self {
        let requested = AtomicUsize::new(settings.threads.max(1));
        Self {
            settings,
            requested,
            init_lock: Mutex::new(()),
            runtime: OnceLock::new(),
        }
    }

    fn runtime(&self) -> Result<&Runtime> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let _guard = self.init_lock.lock();
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = self.build(self.requested.load(Ordering::Relaxed))?;
        Ok(self.runtime.get_or_init(|| runtime))
    }

    fn build(&self, threads: usize) -> Result<Runtime> {
        let workers = self.settings.workers.clone();
        let counter = AtomicUsize::new(0);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(move || {
                workers.thread_name(FLAVOR, counter.fetch_add(1, Ordering::Relaxed))
            })
            .on_thread_start(self.settings.workers.pool_start(FLAVOR))
            .build()?;
        debug!(
            prefix = %self.settings.workers.prefix(),
            threads,
            "cooperative runtime started"
        );
        Ok(runtime)
    }
}

/// Drive `future` to completion on `runtime` from whatever context the
/// caller is in.
fn block_on<F>(runtime: &Runtime, future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| runtime.block_on(future))
        }
        // A current-thread runtime cannot give up its only thread, so the
        // wait happens on a helper thread outside of it.
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(future))
                .join()
                .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
        }),
        Err(_) => runtime.block_on(future),
    }
}

impl Backend for CooperativeScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::CooperativeScheduler
    }

    fn initialize(&self, num_threads: usize) -> Result<()> {
        let threads = self.settings.resolve(num_threads);
        let _guard = self.init_lock.lock();
        if self.runtime.get().is_none() {
            self.requested.store(threads, Ordering::Relaxed);
        } else {
            debug!(requested = threads, "cooperative runtime already running");
        }
        Ok(())
    }

    fn estimated_threads(&self) -> usize {
        self.runtime
            .get()
            .map_or_else(
                || self.requested.load(Ordering::Relaxed),
                |runtime| runtime.metrics().num_workers(),
            )
            .max(1)
    }

    fn execute(&self, first: Index, last: Index, grain: Index, job: &Job<'_>) -> Result<()> {
        let cursor = Arc::new(ChunkCursor::new(first, last, grain));
        if cursor.count() == 0 {
            return Ok(());
        }
        let runtime = self.runtime()?;
        let members = usize::try_from(cursor.count())
            .unwrap_or(usize::MAX)
            .min(runtime.metrics().num_workers())
            .max(1);

        // SAFETY: every task is awaited below before `execute` returns, and
        // the job is only called for claimed chunks.
        let job = unsafe { ErasedJob::new(job) };
        let panics = Arc::new(PanicSlot::default());

        let handles: Vec<_> = (0..members)
            .map(|_| {
                let cursor = Arc::clone(&cursor);
                let panics = Arc::clone(&panics);
                runtime.spawn(async move {
                    while let Some((a, b)) = cursor.claim() {
                        // SAFETY: see above.
                        run_chunk(&cursor, &panics, a, b, |a, b| unsafe { job.call(a, b) });
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let join_failure: Option<Box<dyn Any + Send>> = block_on(runtime, async move {
            let mut failure = None;
            for handle in handles {
                if let Err(e) = handle.await {
                    if failure.is_none() && e.is_panic() {
                        failure = Some(e.into_panic());
                    }
                }
            }
            failure
        });

        if let Some(payload) = join_failure {
            panics.record(payload);
        }
        panics.resume();
        Ok(())
    }
}

impl Drop for CooperativeScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
