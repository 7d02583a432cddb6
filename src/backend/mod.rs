//! Execution engines.
//!
//! Every engine implements [`Backend`]: given `[first, last)`, a grain and a
//! sub-range job, call the job over a partition of the range that covers each
//! index exactly once, with no sub-range longer than the grain. The call
//! returns only after every sub-range has returned.
//!
//! | Kind | Type | Feature |
//! |---|---|---|
//! | `sequential` | [`Sequential`] | always |
//! | `native` | [`NativeThreadPool`] | `native` |
//! | `stealing` | [`TaskStealingPool`] | `rayon` |
//! | `directive` | [`CompilerDirectiveLoop`] | `rayon` |
//! | `cooperative` | [`CooperativeScheduler`] | `tokio` |
//!
//! Parallel engines cut the range into chunks claimed through a shared
//! [`ChunkCursor`]. A panicking chunk abandons the chunks nobody has claimed
//! yet; its payload is resumed on the calling thread once the claimed ones
//! have returned.

mod kind;
mod sequential;

#[cfg(feature = "tokio")]
mod cooperative;
#[cfg(feature = "rayon")]
mod directive;
#[cfg(feature = "native")]
mod native;
#[cfg(feature = "rayon")]
mod stealing;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::affinity::WorkerStart;
use crate::error::Result;
use crate::partition::{self, ChunkCursor};
use crate::Index;

pub use kind::{BackendKind, UnknownBackend};
pub use sequential::Sequential;

#[cfg(feature = "tokio")]
pub use cooperative::CooperativeScheduler;
#[cfg(feature = "rayon")]
pub use directive::CompilerDirectiveLoop;
#[cfg(feature = "native")]
pub use native::NativeThreadPool;
#[cfg(feature = "rayon")]
pub use stealing::TaskStealingPool;

/// The sub-range callback handed to a backend.
pub type Job<'a> = dyn Fn(Index, Index) + Sync + 'a;

/// An execution engine for partitioned ranges.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Which engine this is.
    fn kind(&self) -> BackendKind;

    /// Request `num_threads` workers (0 = the engine's default).
    ///
    /// Engines that cannot be resized once their workers exist ignore later
    /// requests. Engines that can are rebuilt when the count changes.
    fn initialize(&self, num_threads: usize) -> Result<()>;

    /// Current worker-count estimate, at least 1.
    fn estimated_threads(&self) -> usize;

    /// Grain used when the caller passes a non-positive one.
    fn default_grain(&self, len: Index) -> Index {
        partition::default_grain(len, self.estimated_threads())
    }

    /// Run `job` over a partition of `[first, last)` and wait for it.
    ///
    /// Empty and inverted ranges make zero calls. `grain` is clamped to at
    /// least 1.
    ///
    /// # Errors
    ///
    /// Fails only if the engine's workers could not be started. Panics from
    /// `job` unwind out of this call instead.
    fn execute(&self, first: Index, last: Index, grain: Index, job: &Job<'_>) -> Result<()>;
}

/// Settings every pooled backend is built with.
#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    /// Worker count used until `initialize` asks for another.
    pub(crate) threads: usize,
    /// Worker count `initialize(0)` resets to.
    pub(crate) default_threads: usize,
    /// Cap applied to the default worker count.
    pub(crate) max_threads: Option<usize>,
    pub(crate) workers: WorkerStart,
}

impl PoolSettings {
    /// Resolve an `initialize` request to a concrete worker count.
    ///
    /// `max_threads` caps the default only; an explicit non-zero request
    /// overrides it.
    pub(crate) fn resolve(&self, requested: usize) -> usize {
        if requested > 0 {
            return requested;
        }
        self.max_threads
            .map_or(self.default_threads, |max| self.default_threads.min(max))
            .max(1)
    }
}

/// First panic payload raised by the chunks of one region.
#[derive(Default)]
pub(crate) struct PanicSlot(Mutex<Option<Box<dyn Any + Send>>>);

impl PanicSlot {
    pub(crate) fn record(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    pub(crate) fn take(&self) -> Option<Box<dyn Any + Send>> {
        self.0.lock().take()
    }

    /// Re-raise the recorded panic, if any, on the calling thread.
    pub(crate) fn resume(&self) {
        if let Some(payload) = self.take() {
            panic::resume_unwind(payload);
        }
    }
}

/// Run one claimed chunk.
///
/// A panic is recorded and abandons every unclaimed chunk. Returns how many
/// chunks this settled: the one that ran plus any it abandoned.
pub(crate) fn run_chunk(
    cursor: &ChunkCursor,
    panics: &PanicSlot,
    first: Index,
    last: Index,
    job: impl FnOnce(Index, Index),
) -> u64 {
    match panic::catch_unwind(AssertUnwindSafe(|| job(first, last))) {
        Ok(()) => 1,
        Err(payload) => {
            panics.record(payload);
            1 + cursor.abandon()
        }
    }
}

/// Claim and run chunks until the cursor is exhausted.
pub(crate) fn drain_chunks(cursor: &ChunkCursor, panics: &PanicSlot, job: &Job<'_>) {
    while let Some((first, last)) = cursor.claim() {
        run_chunk(cursor, panics, first, last, job);
    }
}

/// A [`Job`] reference with its lifetime erased.
///
/// Pools whose workers outlive a single call (std threads, tokio tasks) need a
/// `'static` handle to the caller's job.
#[derive(Clone, Copy)]
pub(crate) struct ErasedJob(*const Job<'static>);

// SAFETY: the pointee is `Sync`, and `ErasedJob::new` callers guarantee it is
// alive whenever `call` runs.
unsafe impl Send for ErasedJob {}
unsafe impl Sync for ErasedJob {}

impl ErasedJob {
    /// # Safety
    ///
    /// `job` must stay alive until every `call` through the returned handle
    /// (and its copies) has returned. Backends uphold this by calling only
    /// after a successful chunk claim and waiting for all claimed chunks to
    /// settle before `execute` returns.
    pub(crate) unsafe fn new(job: &Job<'_>) -> Self {
        let ptr: *const Job<'_> = job;
        Self(std::mem::transmute::<*const Job<'_>, *const Job<'static>>(ptr))
    }

    /// # Safety
    ///
    /// See [`ErasedJob::new`].
    pub(crate) unsafe fn call(self, first: Index, last: Index) {
        (*self.0)(first, last)
    }
}
