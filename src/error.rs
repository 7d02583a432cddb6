//! Error types for smp-rs.

use thiserror::Error;

use crate::backend::BackendKind;

/// Errors that can occur when building a runtime or dispatching work.
///
/// Functor panics are not represented here: they unwind out of
/// `parallel_for` on the calling thread.
#[derive(Debug, Error)]
pub enum SmpError {
    /// Error parsing CPU set string.
    #[error("invalid cpuset format: {0}")]
    InvalidCpuSet(String),

    /// CPU ID is not available on this system.
    #[error("CPU {0} is not available on this system")]
    CpuNotAvailable(usize),

    /// No CPUs available after applying constraints.
    #[error("no CPUs available after applying constraints")]
    NoCpusAvailable,

    /// Error setting thread affinity.
    #[error("failed to set thread affinity for CPU {0}")]
    AffinityFailed(usize),

    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A worker thread (or the cooperative runtime) could not be started.
    #[error("failed to spawn worker threads: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// Error building a rayon thread pool.
    #[cfg(feature = "rayon")]
    #[error("failed to build rayon thread pool: {0}")]
    ThreadPoolBuild(#[from] rayon::ThreadPoolBuildError),

    /// The requested backend is not compiled into this binary.
    #[error("backend `{0}` is not compiled in")]
    BackendNotCompiled(BackendKind),
}

/// Result type alias for smp-rs operations.
pub type Result<T> = std::result::Result<T, SmpError>;
