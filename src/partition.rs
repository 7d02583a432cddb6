//! Range partitioning: grain heuristic and the shared chunk cursor.
//!
//! A range `[first, last)` with grain `g` is cut into `ceil((last - first) / g)`
//! chunks. Every chunk but the last has exactly `g` indices.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::Index;

/// Chunks scheduled per worker by [`default_grain`].
pub const CHUNKS_PER_THREAD: Index = 4;

/// Default grain for a range of `len` indices over `threads` workers.
///
/// Yields roughly [`CHUNKS_PER_THREAD`] chunks per worker so that uneven
/// workloads still balance. Always at least 1.
pub fn default_grain(len: Index, threads: usize) -> Index {
    grain_with_factor(len, threads, CHUNKS_PER_THREAD)
}

/// Like [`default_grain`] with an explicit chunks-per-worker factor.
pub fn grain_with_factor(len: Index, threads: usize, factor: Index) -> Index {
    let threads = Index::try_from(threads.max(1)).unwrap_or(Index::MAX);
    let divisor = threads.saturating_mul(factor.max(1));
    (len.max(0) / divisor).max(1)
}

/// Number of chunks `[first, last)` splits into with the given grain.
///
/// Zero for empty or inverted ranges. A non-positive grain counts as 1.
pub fn chunk_count(first: Index, last: Index, grain: Index) -> u64 {
    if last <= first {
        return 0;
    }
    let len = (last as i128) - (first as i128);
    let grain = grain.max(1) as i128;
    ((len + grain - 1) / grain) as u64
}

/// The `index`-th chunk of `[first, last)`, or `None` past the end.
pub fn chunk_bounds(first: Index, last: Index, grain: Index, index: u64) -> Option<(Index, Index)> {
    if index >= chunk_count(first, last, grain) {
        return None;
    }
    let grain = grain.max(1) as i128;
    let start = first as i128 + index as i128 * grain;
    let end = (start + grain).min(last as i128);
    Some((start as Index, end as Index))
}

/// A range split into chunks that workers claim one at a time.
///
/// Claiming goes through a single atomic chunk index, so chunks are handed out
/// exactly once, in increasing order, to whichever worker asks first.
#[derive(Debug)]
pub(crate) struct ChunkCursor {
    first: Index,
    last: Index,
    grain: Index,
    count: u64,
    next: AtomicU64,
}

impl ChunkCursor {
    pub(crate) fn new(first: Index, last: Index, grain: Index) -> Self {
        let grain = grain.max(1);
        Self {
            first,
            last,
            grain,
            count: chunk_count(first, last, grain),
            next: AtomicU64::new(0),
        }
    }

    /// Total number of chunks.
    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    /// Claim the next unclaimed chunk.
    pub(crate) fn claim(&self) -> Option<(Index, Index)> {
        if self.is_exhausted() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        chunk_bounds(self.first, self.last, self.grain, index)
    }

    /// Whether every chunk has been claimed.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.next.load(Ordering::Relaxed) >= self.count
    }

    /// Claim every remaining chunk without handing it out.
    ///
    /// Returns how many chunks were skipped.
    pub(crate) fn abandon(&self) -> u64 {
        let previous = self.next.swap(self.count, Ordering::Relaxed);
        self.count.saturating_sub(previous)
    }
}
