//! Per-worker storage for lock-free accumulation inside parallel regions.
//!
//! # Layout
//!
//! ```text
//! ThreadLocalStore<T>
//!   └── buckets[b]: AtomicPtr -> [CachePadded<Entry<T>>; 2^b]
//!         slot s lives in bucket floor(log2(s + 1)) at offset s + 1 - 2^b
//! ```
//!
//! Buckets are allocated on demand and never move, so an entry reference stays
//! valid for the life of the store. The only lock is taken the first time a
//! bucket is allocated; materializing an entry inside an existing bucket only
//! touches the calling worker's own entry.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::context::worker_slot;

const BUCKETS: usize = usize::BITS as usize;

struct Entry<T> {
    present: AtomicBool,
    borrowed: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Entry<T> {
    fn vacant() -> Self {
        Self {
            present: AtomicBool::new(false),
            borrowed: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

type Initializer<T> = Box<dyn Fn() -> T + Send + Sync>;

/// One lazily created `T` per worker.
///
/// Workers reach their instance through [`local`](Self::local); the
/// controlling thread walks all instances with [`iter_mut`](Self::iter_mut)
/// once the parallel region has joined. Instances are never removed
/// individually.
///
/// # Examples
///
/// ```
/// use smp_rs::ThreadLocalStore;
///
/// let mut store: ThreadLocalStore<u64> = ThreadLocalStore::new();
/// std::thread::scope(|s| {
///     for _ in 0..4 {
///         s.spawn(|| *store.local() += 1);
///     }
/// });
/// assert_eq!(store.iter_mut().map(|v| *v).sum::<u64>(), 4);
/// ```
pub struct ThreadLocalStore<T: Send> {
    buckets: [AtomicPtr<CachePadded<Entry<T>>>; BUCKETS],
    init: Initializer<T>,
    len: AtomicUsize,
    grow: Mutex<()>,
}

// SAFETY: an entry is only touched by the thread owning its slot, or through
// `&mut self` once no worker holds a reference. Values move between threads,
// hence `T: Send`.
unsafe impl<T: Send> Sync for ThreadLocalStore<T> {}
unsafe impl<T: Send> Send for ThreadLocalStore<T> {}

impl<T: Send + Default + 'static> ThreadLocalStore<T> {
    /// Create a store whose instances start as `T::default()`.
    pub fn new() -> Self {
        Self::with_init(T::default)
    }
}

impl<T: Send + Default + 'static> Default for ThreadLocalStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + Clone + 'static> ThreadLocalStore<T> {
    /// Create a store whose instances start as clones of `exemplar`.
    pub fn with_exemplar(exemplar: T) -> Self {
        Self::with_init(move || exemplar.clone())
    }
}

impl<T: Send> ThreadLocalStore<T> {
    /// Create a store whose instances are produced by `init`.
    pub fn with_init<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            buckets: [const { AtomicPtr::new(ptr::null_mut()) }; BUCKETS],
            init: Box::new(init),
            len: AtomicUsize::new(0),
            grow: Mutex::new(()),
        }
    }

    /// The calling worker's instance, created on first access.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds a guard from this store.
    pub fn local(&self) -> Local<'_, T> {
        let entry = self.entry(worker_slot());
        if entry.borrowed.swap(true, Ordering::Acquire) {
            panic!("ThreadLocalStore::local called while this worker's instance is borrowed");
        }
        // Releases the borrow if `init` unwinds.
        let guard = Local {
            entry,
            _not_send: PhantomData,
        };
        if !entry.present.load(Ordering::Acquire) {
            let value = (self.init)();
            // SAFETY: only the owning thread writes a vacant entry.
            unsafe { (*entry.value.get()).write(value) };
            entry.present.store(true, Ordering::Release);
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        guard
    }

    /// Number of materialized instances.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether no worker has touched the store yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable traversal over all instances, in slot order.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        IterMut {
            store: self,
            slot: 0,
            remaining: self.len.load(Ordering::Acquire),
        }
    }

    /// Shared traversal over all instances, in slot order.
    ///
    /// Takes `&mut self` so that no worker can materialize an instance while
    /// the traversal is live.
    pub fn iter(&mut self) -> impl Iterator<Item = &T> + '_ {
        self.iter_mut().map(|value| &*value)
    }

    /// Consume the store, returning all instances in slot order.
    pub fn into_values(mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len());
        for (bucket, size) in bucket_sizes() {
            let base = *self.buckets[bucket].get_mut();
            if base.is_null() {
                continue;
            }
            for offset in 0..size {
                // SAFETY: base points to `size` initialized entries; the store is
                // owned, so nothing else can observe them.
                let entry = unsafe { &mut *base.add(offset) };
                if std::mem::replace(entry.present.get_mut(), false) {
                    values.push(unsafe { entry.value.get_mut().assume_init_read() });
                }
            }
        }
        *self.len.get_mut() = 0;
        values
    }

    fn entry(&self, slot: usize) -> &Entry<T> {
        let (bucket, offset) = locate(slot);
        let mut base = self.buckets[bucket].load(Ordering::Acquire);
        if base.is_null() {
            base = self.allocate_bucket(bucket);
        }
        // SAFETY: buckets are never freed while the store lives and offset is
        // within the bucket size.
        unsafe { &*base.add(offset) }
    }

    #[cold]
    fn allocate_bucket(&self, bucket: usize) -> *mut CachePadded<Entry<T>> {
        let _guard = self.grow.lock();
        let existing = self.buckets[bucket].load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }
        let entries: Box<[CachePadded<Entry<T>>]> = (0..1usize << bucket)
            .map(|_| CachePadded::new(Entry::vacant()))
            .collect();
        let base = Box::into_raw(entries) as *mut CachePadded<Entry<T>>;
        self.buckets[bucket].store(base, Ordering::Release);
        base
    }

    /// The entry at `slot` if its bucket exists and the entry is materialized.
    fn materialized(&self, slot: usize) -> Option<&Entry<T>> {
        let (bucket, offset) = locate(slot);
        let base = self.buckets[bucket].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // SAFETY: see `entry`.
        let entry: &Entry<T> = unsafe { &*base.add(offset) };
        entry.present.load(Ordering::Acquire).then_some(entry)
    }
}

impl<T: Send> Drop for ThreadLocalStore<T> {
    fn drop(&mut self) {
        for (bucket, size) in bucket_sizes() {
            let base = *self.buckets[bucket].get_mut();
            if base.is_null() {
                continue;
            }
            // SAFETY: base came from `Box::into_raw` of a slice of `size` entries.
            let mut entries = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, size)) };
            for entry in entries.iter_mut() {
                if *entry.present.get_mut() {
                    unsafe { entry.value.get_mut().assume_init_drop() };
                }
            }
        }
    }
}

impl<T: Send + fmt::Debug> fmt::Debug for ThreadLocalStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn locate(slot: usize) -> (usize, usize) {
    let position = slot + 1;
    let bucket = (usize::BITS - 1 - position.leading_zeros()) as usize;
    (bucket, position - (1usize << bucket))
}

fn bucket_sizes() -> impl Iterator<Item = (usize, usize)> {
    (0..BUCKETS).map(|bucket| (bucket, 1usize << bucket))
}

/// Mutable access to the calling worker's instance.
///
/// Not `Send`: the guard belongs to the worker that created it.
pub struct Local<'a, T> {
    entry: &'a Entry<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for Local<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the entry is present and exclusively borrowed by this guard.
        unsafe { (*self.entry.value.get()).assume_init_ref() }
    }
}

impl<T> DerefMut for Local<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`.
        unsafe { (*self.entry.value.get()).assume_init_mut() }
    }
}

impl<T> Drop for Local<'_, T> {
    fn drop(&mut self) {
        self.entry.borrowed.store(false, Ordering::Release);
    }
}

/// Iterator returned by [`ThreadLocalStore::iter_mut`].
pub struct IterMut<'a, T: Send> {
    store: &'a ThreadLocalStore<T>,
    slot: usize,
    remaining: usize,
}

impl<'a, T: Send> Iterator for IterMut<'a, T> {
    type Item = &'a mut T;

    fn next(&mut self) -> Option<&'a mut T> {
        while self.remaining > 0 {
            let slot = self.slot;
            self.slot += 1;
            if let Some(entry) = self.store.materialized(slot) {
                self.remaining -= 1;
                // SAFETY: the iterator was created from `&mut ThreadLocalStore`
                // and yields each entry once.
                return Some(unsafe { (*entry.value.get()).assume_init_mut() });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
