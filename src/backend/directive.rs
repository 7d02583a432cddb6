//! Parallel-loop backend in the style of a compiler directive.
//!
//! A team of `min(threads, chunks)` members runs inside a rayon scope. Each
//! member pulls the next unclaimed chunk from a shared cursor (a dynamic
//! schedule). The member that opens the scope works too.

use super::stealing::ReconfigurablePool;
use super::{drain_chunks, Backend, BackendKind, Job, PanicSlot, PoolSettings};
use crate::error::Result;
use crate::partition::ChunkCursor;
use crate::Index;

/// Team-based parallel loop on its own rayon pool.
#[derive(Debug)]
pub struct CompilerDirectiveLoop {
    team: ReconfigurablePool,
}

impl CompilerDirectiveLoop {
    pub(crate) fn new(settings: PoolSettings) -> Self {
        Self {
            team: ReconfigurablePool::new("directive", settings),
        }
    }
}

impl Backend for CompilerDirectiveLoop {
    fn kind(&self) -> BackendKind {
        BackendKind::CompilerDirectiveLoop
    }

    fn initialize(&self, num_threads: usize) -> Result<()> {
        self.team.resize(num_threads)
    }

    fn estimated_threads(&self) -> usize {
        self.team.threads()
    }

    fn execute(&self, first: Index, last: Index, grain: Index, job: &Job<'_>) -> Result<()> {
        let cursor = ChunkCursor::new(first, last, grain);
        if cursor.count() == 0 {
            return Ok(());
        }
        let pool = self.team.get()?;
        let members = usize::try_from(cursor.count())
            .unwrap_or(usize::MAX)
            .min(pool.current_num_threads())
            .max(1);

        let panics = PanicSlot::default();
        pool.scope(|scope| {
            for _ in 1..members {
                scope.spawn(|_| drain_chunks(&cursor, &panics, job));
            }
            drain_chunks(&cursor, &panics, job);
        });
        panics.resume();
        Ok(())
    }
}
