//! The closed set of execution engines and their names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An execution engine that can run a partitioned range.
///
/// Which variants are usable depends on the cargo features the crate was
/// built with; see [`BackendKind::is_compiled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(u8)]
pub enum BackendKind {
    /// Runs the range on the calling thread.
    Sequential = 0,
    /// Fixed pool of native threads, the caller acting as worker 0.
    NativeThreadPool = 1,
    /// Work-stealing pool (rayon).
    TaskStealingPool = 2,
    /// Parallel loop with a team pulling chunks dynamically.
    CompilerDirectiveLoop = 3,
    /// Cooperative tasks on a managed runtime (tokio).
    CooperativeScheduler = 4,
}

impl BackendKind {
    /// All variants, in discriminant order.
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Sequential,
        BackendKind::NativeThreadPool,
        BackendKind::TaskStealingPool,
        BackendKind::CompilerDirectiveLoop,
        BackendKind::CooperativeScheduler,
    ];

    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Sequential => "sequential",
            BackendKind::NativeThreadPool => "native",
            BackendKind::TaskStealingPool => "stealing",
            BackendKind::CompilerDirectiveLoop => "directive",
            BackendKind::CooperativeScheduler => "cooperative",
        }
    }

    /// Whether this backend is compiled into the binary.
    pub const fn is_compiled(self) -> bool {
        match self {
            BackendKind::Sequential => true,
            BackendKind::NativeThreadPool => cfg!(feature = "native"),
            BackendKind::TaskStealingPool | BackendKind::CompilerDirectiveLoop => {
                cfg!(feature = "rayon")
            }
            BackendKind::CooperativeScheduler => cfg!(feature = "tokio"),
        }
    }

    /// The compiled-in backends, in discriminant order.
    pub fn compiled() -> impl Iterator<Item = BackendKind> {
        Self::ALL.into_iter().filter(|kind| kind.is_compiled())
    }

    /// The backend used when nothing is configured.
    ///
    /// Prefers the native pool, then the stealing pool, the directive loop and
    /// the cooperative scheduler, falling back to sequential execution.
    pub fn build_default() -> BackendKind {
        [
            BackendKind::NativeThreadPool,
            BackendKind::TaskStealingPool,
            BackendKind::CompilerDirectiveLoop,
            BackendKind::CooperativeScheduler,
        ]
        .into_iter()
        .find(|kind| kind.is_compiled())
        .unwrap_or(BackendKind::Sequential)
    }

    pub(crate) fn from_u8(value: u8) -> BackendKind {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(BackendKind::Sequential)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a backend name matches no known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBackend(pub String);

impl fmt::Display for UnknownBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown backend `{}`", self.0)
    }
}

impl std::error::Error for UnknownBackend {}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    /// Parses a backend name, ignoring case and surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "serial" | "seq" => BackendKind::Sequential,
            "native" | "stdthread" | "std_thread" | "simple" => BackendKind::NativeThreadPool,
            "stealing" | "tbb" | "rayon" => BackendKind::TaskStealingPool,
            "directive" | "openmp" | "omp" => BackendKind::CompilerDirectiveLoop,
            "cooperative" | "kaapi" | "tokio" => BackendKind::CooperativeScheduler,
            _ => return Err(UnknownBackend(s.to_string())),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for BackendKind {
    type Error = UnknownBackend;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}
