//! Per-thread execution context.
//!
//! Two pieces of thread-local state live here:
//!
//! - **Worker slots.** Every thread that touches the runtime gets a small
//!   integer slot id from a process-wide allocator. Ids are dense and are
//!   recycled when a thread exits, so per-worker storage can be an array
//!   indexed by slot. Pool workers acquire their slot when they start.
//! - **Region frames.** While a thread executes a chunk of a parallel region it
//!   carries a frame recording the nesting depth and the leader slot of the
//!   outermost region. [`is_parallel_scope`] and [`single_thread`] read it.
//!
//! # Leader rule
//!
//! The leader of an outermost region is the first thread to start one of its
//! chunks. Regions opened from inside a chunk inherit that leader, so
//! [`single_thread`] answers "am I the leader of the outermost active region".

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Process-wide allocator of worker slot ids.
struct SlotAllocator {
    next: usize,
    free: BinaryHeap<Reverse<usize>>,
}

static SLOTS: Mutex<SlotAllocator> = parking_lot::const_mutex(SlotAllocator {
    next: 0,
    free: BinaryHeap::new(),
});

impl SlotAllocator {
    fn acquire(&mut self) -> usize {
        match self.free.pop() {
            Some(Reverse(id)) => id,
            None => {
                let id = self.next;
                self.next += 1;
                id
            }
        }
    }

    fn release(&mut self, id: usize) {
        self.free.push(Reverse(id));
    }
}

/// Owns a slot id for the lifetime of its thread.
struct SlotGuard {
    id: usize,
}

impl SlotGuard {
    fn acquire() -> Self {
        Self {
            id: SLOTS.lock().acquire(),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        SLOTS.lock().release(self.id);
    }
}

/// What a thread knows about the region it is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionFrame {
    pub(crate) depth: u32,
    pub(crate) leader: usize,
}

thread_local! {
    static SLOT: SlotGuard = SlotGuard::acquire();
    static FRAME: Cell<Option<RegionFrame>> = const { Cell::new(None) };
}

/// The calling thread's worker slot id.
///
/// Assigned on first call and stable until the thread exits.
pub fn worker_slot() -> usize {
    SLOT.with(|slot| slot.id)
}

/// Eagerly acquire a slot for the current thread.
///
/// Called from pool start handlers so that workers get their slot at pool
/// creation rather than on first use.
pub(crate) fn attach_worker() -> usize {
    worker_slot()
}

/// Whether the calling thread is executing a chunk of a parallel region.
pub fn is_parallel_scope() -> bool {
    FRAME.with(|frame| frame.get().is_some())
}

/// Nesting depth of the region the calling thread executes (0 outside).
pub fn region_depth() -> u32 {
    FRAME.with(|frame| frame.get().map_or(0, |f| f.depth))
}

/// Whether the calling thread is the leader of the outermost active region.
///
/// Outside of any region the calling thread is trivially the only one, so
/// this returns `true`.
pub fn single_thread() -> bool {
    match FRAME.with(|frame| frame.get()) {
        Some(frame) => frame.leader == worker_slot(),
        None => true,
    }
}

const NO_LEADER: usize = usize::MAX;

/// Shared state of one dispatched region.
#[derive(Debug)]
pub(crate) struct Region {
    depth: u32,
    leader: AtomicUsize,
}

impl Region {
    /// Open a region from the calling thread's context.
    pub(crate) fn open() -> Self {
        match FRAME.with(|frame| frame.get()) {
            Some(parent) => Self {
                depth: parent.depth + 1,
                leader: AtomicUsize::new(parent.leader),
            },
            None => Self {
                depth: 1,
                leader: AtomicUsize::new(NO_LEADER),
            },
        }
    }

    /// Nesting depth of this region (1 for an outermost region).
    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    /// Run `f` as part of this region on the calling thread.
    ///
    /// The first thread to get here claims leadership of an outermost region.
    /// The previous frame is restored afterwards, also on unwind.
    pub(crate) fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let slot = worker_slot();
        let leader = match self.leader.compare_exchange(
            NO_LEADER,
            slot,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => slot,
            Err(current) => current,
        };

        let frame = RegionFrame {
            depth: self.depth,
            leader,
        };
        let _restore = FrameRestore(FRAME.with(|cell| cell.replace(Some(frame))));
        f()
    }
}

struct FrameRestore(Option<RegionFrame>);

impl Drop for FrameRestore {
    fn drop(&mut self) {
        let previous = self.0;
        FRAME.with(|cell| cell.set(previous));
    }
}
