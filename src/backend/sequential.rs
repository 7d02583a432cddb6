use super::{Backend, BackendKind, Job};
use crate::error::Result;
use crate::partition::ChunkCursor;
use crate::Index;

/// Runs the range on the calling thread, one grain-sized chunk after another.
///
/// Always compiled in. Its default grain is the whole range, so a call
/// without an explicit grain is a single `job(first, last)`. Also used for
/// nested regions when nested parallelism is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl Backend for Sequential {
    fn kind(&self) -> BackendKind {
        BackendKind::Sequential
    }

    fn initialize(&self, _num_threads: usize) -> Result<()> {
        Ok(())
    }

    fn estimated_threads(&self) -> usize {
        1
    }

    fn default_grain(&self, len: Index) -> Index {
        len.max(1)
    }

    fn execute(&self, first: Index, last: Index, grain: Index, job: &Job<'_>) -> Result<()> {
        let cursor = ChunkCursor::new(first, last, grain);
        while let Some((a, b)) = cursor.claim() {
            job(a, b);
        }
        Ok(())
    }
}
