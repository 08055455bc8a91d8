//! Chunk planning: pure functions mapping a file size and a nominal chunk
//! size onto an ordered sequence of byte ranges.

use serde::{Deserialize, Serialize};

/// One contiguous byte range of the source, identified by `(index, hash)`
/// once its digest is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// Dense, 0-based position in the plan
    pub index: usize,
    /// Inclusive start offset
    pub start: u64,
    /// Exclusive end offset
    pub end: u64,
    /// `end - start`
    pub size: u64,
    /// Content address, filled after the per-chunk digest completes
    pub hash: Option<String>,
}

impl ChunkSpec {
    fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            size: end - start,
            hash: None,
        }
    }
}

/// Build a plan covering `[0, file_size)` exactly once.
///
/// Produces `ceil(file_size / chunk_size)` descriptors, the last possibly
/// short. A zero-length file yields an empty plan.
pub fn build_plan(file_size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
    assert!(chunk_size > 0, "chunk size must be positive");
    if file_size == 0 {
        return Vec::new();
    }

    let count = file_size.div_ceil(chunk_size) as usize;
    let mut plan = Vec::with_capacity(count);
    let mut start = 0u64;
    for index in 0..count {
        let end = (start + chunk_size).min(file_size);
        plan.push(ChunkSpec::new(index, start, end));
        start = end;
    }
    plan
}

/// Recompute the plan over the uncommitted suffix.
///
/// Descriptors before `first_unstarted` keep their boundaries and hashes;
/// the suffix beginning at that index is rebuilt with `new_chunk_size` and
/// reindexed densely. A `first_unstarted` at or past the end leaves the
/// plan unchanged.
pub fn replan_suffix(plan: &mut Vec<ChunkSpec>, first_unstarted: usize, new_chunk_size: u64) {
    assert!(new_chunk_size > 0, "chunk size must be positive");
    if first_unstarted >= plan.len() {
        return;
    }

    let suffix_start = plan[first_unstarted].start;
    let file_size = plan.last().map(|c| c.end).unwrap_or(suffix_start);
    plan.truncate(first_unstarted);

    let mut start = suffix_start;
    let mut index = first_unstarted;
    while start < file_size {
        let end = (start + new_chunk_size).min(file_size);
        plan.push(ChunkSpec::new(index, start, end));
        start = end;
        index += 1;
    }
}
