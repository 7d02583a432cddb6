//! Worker start-up: naming, slot attachment and optional CPU pinning.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use core_affinity::CoreId;
use tracing::{debug, warn};

use crate::context;
use crate::error::{Result, SmpError};

/// Pin the current thread to the specified CPU.
///
/// # Errors
///
/// Returns `SmpError::AffinityFailed` if the OS refuses the request.
pub fn pin_to_cpu(cpu_id: usize) -> Result<()> {
    if core_affinity::set_for_current(CoreId { id: cpu_id }) {
        debug!(cpu_id, "pinned thread to CPU");
        Ok(())
    } else {
        Err(SmpError::AffinityFailed(cpu_id))
    }
}

/// Hands out CPUs round-robin to the workers of one pool.
#[derive(Debug)]
pub struct CpuAllocator {
    cpus: Vec<usize>,
    next: AtomicUsize,
}

impl CpuAllocator {
    /// Create an allocator over `cpus`.
    ///
    /// # Panics
    ///
    /// Panics if `cpus` is empty.
    pub fn new(cpus: Vec<usize>) -> Self {
        assert!(!cpus.is_empty(), "CPU allocator requires at least one CPU");
        Self {
            cpus,
            next: AtomicUsize::new(0),
        }
    }

    /// The next CPU in round-robin order.
    pub fn allocate(&self) -> usize {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.cpus.len();
        self.cpus[index]
    }

    /// The CPUs handed out by this allocator.
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }
}

/// How a backend starts its worker threads.
///
/// Shared by every pool a runtime builds. Each pool build gets a fresh
/// [`WorkerStart::pool_start`] so that pinning restarts at the first CPU.
#[derive(Clone)]
pub(crate) struct WorkerStart {
    prefix: Arc<str>,
    pin_cpus: Option<Arc<[usize]>>,
}

impl WorkerStart {
    pub(crate) fn new(prefix: &str, pin_cpus: Option<Vec<usize>>) -> Self {
        Self {
            prefix: prefix.into(),
            pin_cpus: pin_cpus.filter(|cpus| !cpus.is_empty()).map(Into::into),
        }
    }

    /// Thread name for worker `index` of a pool of the given flavor.
    pub(crate) fn thread_name(&self, flavor: &str, index: usize) -> String {
        format!("{}-{}-{:04}", self.prefix, flavor, index)
    }

    pub(crate) fn prefix(&self) -> &Arc<str> {
        &self.prefix
    }

    /// Start handler for the threads of one freshly built pool.
    pub(crate) fn pool_start(&self, flavor: &'static str) -> impl Fn() + Send + Sync + 'static {
        let allocator = self
            .pin_cpus
            .as_ref()
            .map(|cpus| Arc::new(CpuAllocator::new(cpus.to_vec())));
        let prefix = Arc::clone(&self.prefix);
        move || {
            let slot = context::attach_worker();
            match &allocator {
                Some(allocator) => {
                    let cpu_id = allocator.allocate();
                    if let Err(e) = pin_to_cpu(cpu_id) {
                        warn!(%e, %prefix, flavor, slot, cpu_id, "failed to pin worker thread");
                    }
                }
                None => debug!(%prefix, flavor, slot, "worker thread starting"),
            }
        }
    }
}

impl fmt::Debug for WorkerStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerStart")
            .field("prefix", &self.prefix)
            .field("pin_cpus", &self.pin_cpus.as_deref())
            .finish()
    }
}
