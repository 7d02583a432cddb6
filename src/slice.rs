//! Disjoint mutable access to one slice from several workers.

use std::marker::PhantomData;

/// A `&mut [T]` that workers carve into non-overlapping sub-slices.
///
/// Sound only because each sub-range of a parallel region is handed to
/// exactly one worker.
pub(crate) struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: workers only ever hold disjoint sub-slices, so this is as safe to
// share as handing each worker its own `&mut [T]`, which needs `T: Send`.
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Elements `[start, end)`.
    ///
    /// # Safety
    ///
    /// No other live reference may overlap `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn range_mut(&self, start: usize, end: usize) -> &'a mut [T] {
        assert!(start <= end && end <= self.len, "sub-slice {start}..{end} out of bounds");
        std::slice::from_raw_parts_mut(self.ptr.add(start), end - start)
    }
}
