//! Shard router — maps batch identifiers to the endpoint that serves them.
//!
//! A shard map is validated once, at construction: the shard ranges must be
//! contiguous, disjoint, and together cover `[1, total_batches]` exactly.
//! After that, resolving a batch can only fail for identifiers outside the
//! configured range.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::BatchId;

/// A contiguous, inclusive range of batches bound to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub start: u32,
    pub end: u32,
    pub base_url: String,
}

impl Shard {
    pub fn new(start: u32, end: u32, base_url: impl Into<String>) -> Self {
        Self {
            start,
            end,
            base_url: base_url.into(),
        }
    }

    pub fn contains(&self, batch: BatchId) -> bool {
        (self.start..=self.end).contains(&batch.get())
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("total_batches must be at least 1")]
    NoBatches,

    #[error("no shards configured")]
    NoShards,

    #[error("shard {index} has an empty range {start}..={end}")]
    EmptyRange { index: usize, start: u32, end: u32 },

    #[error("shard {index} has an empty base url")]
    EmptyBaseUrl { index: usize },

    #[error("gap in shard map: batches {from}..={to} are not covered")]
    Gap { from: u32, to: u32 },

    #[error("shard map overlaps at batch {at}")]
    Overlap { at: u32 },

    #[error("shard map ends at {covered} but total_batches is {total}")]
    Overflow { covered: u32, total: u32 },

    #[error("batch {batch} is outside every configured shard range")]
    OutOfRange { batch: BatchId },
}

/// Validated partition of `[1, total_batches]` across endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMap {
    total_batches: u32,
    shards: Vec<Shard>,
}

impl ShardMap {
    /// Validate and build a shard map. Shards may be given in any order.
    pub fn new(total_batches: u32, mut shards: Vec<Shard>) -> Result<Self, ShardError> {
        if total_batches == 0 {
            return Err(ShardError::NoBatches);
        }
        if shards.is_empty() {
            return Err(ShardError::NoShards);
        }

        for (index, shard) in shards.iter().enumerate() {
            if shard.is_empty() || shard.start == 0 {
                return Err(ShardError::EmptyRange {
                    index,
                    start: shard.start,
                    end: shard.end,
                });
            }
            if shard.base_url.trim().is_empty() {
                return Err(ShardError::EmptyBaseUrl { index });
            }
        }

        shards.sort_by_key(|s| s.start);

        // Walk the sorted ranges; `next` is the first batch not yet covered.
        let mut next: u32 = 1;
        for shard in &shards {
            if shard.start > next {
                return Err(ShardError::Gap {
                    from: next,
                    to: shard.start - 1,
                });
            }
            if shard.start < next {
                return Err(ShardError::Overlap { at: shard.start });
            }
            next = shard.end.saturating_add(1);
        }

        let covered = next - 1;
        if covered < total_batches {
            return Err(ShardError::Gap {
                from: next,
                to: total_batches,
            });
        }
        if covered > total_batches {
            return Err(ShardError::Overflow {
                covered,
                total: total_batches,
            });
        }

        Ok(Self {
            total_batches,
            shards,
        })
    }

    /// Split `[1, total_batches]` into near-equal contiguous ranges, one per
    /// base url. Earlier shards absorb the remainder.
    pub fn even_split(total_batches: u32, base_urls: &[String]) -> Result<Self, ShardError> {
        if base_urls.is_empty() {
            return Err(ShardError::NoShards);
        }
        let count = base_urls.len() as u32;
        let size = total_batches / count;
        let remainder = total_batches % count;

        let mut shards = Vec::with_capacity(base_urls.len());
        let mut start = 1;
        for (i, url) in base_urls.iter().enumerate() {
            let len = size + u32::from((i as u32) < remainder);
            let end = start + len - 1;
            shards.push(Shard::new(start, end, url.clone()));
            start = end + 1;
        }

        Self::new(total_batches, shards)
    }

    /// Base url of the shard that owns `batch`.
    pub fn resolve_endpoint(&self, batch: BatchId) -> Result<&str, ShardError> {
        // Shards are sorted and contiguous, so a binary search over starts is exact.
        let idx = self.shards.partition_point(|s| s.start <= batch.get());
        idx.checked_sub(1)
            .map(|i| &self.shards[i])
            .filter(|s| s.contains(batch))
            .map(|s| s.base_url.as_str())
            .ok_or(ShardError::OutOfRange { batch })
    }

    pub fn total_batches(&self) -> u32 {
        self.total_batches
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Every batch id in `[1, total_batches]`.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        BatchId::range(self.total_batches).collect()
    }
}
