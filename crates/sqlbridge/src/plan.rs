//! Chunk planning for parallel reads
//!
//! A [`ChunkPlan`] splits `[0, total_rows)` into contiguous row ranges:
//!
//! - `chunk_size = max(baseline, total_rows / target_chunks)`
//! - ranges step from 0 by `chunk_size`
//! - the chunk count is capped at `target_chunks`; the last range takes the remainder
//! - `total_rows == 0` yields one empty range
//!
//! With the defaults (1000, 10): 500 rows → one chunk, 50 000 rows → ten chunks of
//! 5000, 12 345 rows → nine chunks of 1234 and a last chunk of 1239.

use serde::Serialize;

use crate::config::ChunkingConfig;

/// One contiguous row range of a result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkRange {
    /// Position of this range in the plan
    pub index: usize,
    /// First row (0-based)
    pub start: u64,
    /// Number of rows
    pub len: u64,
}

impl ChunkRange {
    /// One past the last row
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Whether the range covers no rows
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Row-range partition of one query's result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkPlan {
    total_rows: u64,
    chunk_size: u64,
    ranges: Vec<ChunkRange>,
}

impl ChunkPlan {
    /// Plan chunks for a result of `total_rows` rows
    pub fn new(total_rows: u64, config: &ChunkingConfig) -> Self {
        let baseline = config.baseline_chunk_size.max(1);
        let target = config.target_chunks.max(1);
        let chunk_size = baseline.max(total_rows / target);

        if total_rows == 0 {
            return Self {
                total_rows,
                chunk_size,
                ranges: vec![ChunkRange {
                    index: 0,
                    start: 0,
                    len: 0,
                }],
            };
        }

        let count = total_rows.div_ceil(chunk_size).min(target);
        let ranges = (0..count)
            .map(|i| {
                let start = i * chunk_size;
                let len = if i == count - 1 {
                    total_rows - start
                } else {
                    chunk_size
                };
                ChunkRange {
                    index: i as usize,
                    start,
                    len,
                }
            })
            .collect();

        Self {
            total_rows,
            chunk_size,
            ranges,
        }
    }

    /// Rows covered by the plan
    #[inline]
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Nominal chunk size (the last range may be longer)
    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Ranges in row order
    #[inline]
    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }

    /// Number of ranges
    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Always false; even an empty result has one range
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
