// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A heap allocator over a fixed-capacity device memory arena.

use rheo_core::transfer::api::locator::{Generation, PoolId, ResourceLocator};
use rheo_core::transfer::metrics::PoolMetrics;
use rheo_core::transfer::error::TransferError;
use std::collections::BTreeMap;

/// A live allocation inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveBlock {
    /// The block size in bytes.
    pub size: u64,
    /// The generation stamped on the locator that owns this block.
    pub generation: Generation,
}

/// A free gap between allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gap {
    offset: u64,
    size: u64,
}

impl Gap {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Book-keeping for one fixed-capacity arena of device memory.
///
/// The allocator tracks live blocks keyed by offset and a coalesced,
/// address-ordered free list. Placement is deterministic first-fit in
/// address order, so a given sequence of allocations and frees always
/// produces the same layout.
///
/// Every allocation is stamped with a generation drawn from a pool-wide
/// monotonic counter. Defragmentation relocates blocks and bumps their
/// generations; a locator carrying an old generation is rejected with
/// [`TransferError::StaleLocator`] rather than silently resolving to the
/// wrong bytes.
#[derive(Debug, Clone)]
pub struct PoolAllocator {
    id: PoolId,
    capacity: u64,
    live: BTreeMap<u64, LiveBlock>,
    gaps: Vec<Gap>,
    live_bytes: u64,
    next_generation: Generation,
    epoch: u64,
}

impl PoolAllocator {
    /// Creates an empty pool of `capacity` bytes.
    pub fn new(id: PoolId, capacity: u64) -> Self {
        let gaps = if capacity > 0 {
            vec![Gap { offset: 0, size: capacity }]
        } else {
            Vec::new()
        };
        Self {
            id,
            capacity,
            live: BTreeMap::new(),
            gaps,
            live_bytes: 0,
            next_generation: Generation::FIRST,
            epoch: 0,
        }
    }

    /// The pool this allocator manages.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The total arena capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The layout epoch, incremented every time a defragmentation pass
    /// relocates blocks. Plans computed against an older epoch are
    /// rejected at commit.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The size of the largest contiguous free gap.
    pub fn largest_free(&self) -> u64 {
        self.gaps.iter().map(|g| g.size).max().unwrap_or(0)
    }

    /// Carves `size` bytes out of the first gap large enough to hold them.
    pub fn allocate(&mut self, size: u64) -> Result<ResourceLocator, TransferError> {
        if size == 0 {
            return Err(TransferError::InvalidDescriptor(
                "cannot allocate a zero-sized block".to_string(),
            ));
        }
        let index = match self.gaps.iter().position(|g| g.size >= size) {
            Some(index) => index,
            None => {
                return Err(TransferError::OutOfSpace {
                    requested: size,
                    largest_free: self.largest_free(),
                })
            }
        };
        let offset = self.gaps[index].offset;
        self.gaps[index].offset += size;
        self.gaps[index].size -= size;
        if self.gaps[index].size == 0 {
            self.gaps.remove(index);
        }

        let generation = self.bump_generation();
        self.live.insert(offset, LiveBlock { size, generation });
        self.live_bytes += size;
        log::trace!(
            "Pool {}: allocated {size} bytes at offset {offset} (generation {})",
            self.id.0,
            generation.0
        );
        Ok(ResourceLocator {
            pool: self.id,
            offset,
            size,
            generation,
        })
    }

    /// Checks that `locator` still names a live block in this pool.
    pub fn verify(&self, locator: &ResourceLocator) -> Result<(), TransferError> {
        match self.live.get(&locator.offset) {
            None => Err(TransferError::InvalidDescriptor(format!(
                "no live allocation at pool {} offset {}",
                self.id.0, locator.offset
            ))),
            Some(block) if block.generation != locator.generation => {
                Err(TransferError::StaleLocator {
                    expected: block.generation,
                    found: locator.generation,
                })
            }
            Some(block) if block.size != locator.size => {
                Err(TransferError::InvalidDescriptor(format!(
                    "locator size {} disagrees with live block size {}",
                    locator.size, block.size
                )))
            }
            Some(_) => Ok(()),
        }
    }

    /// Returns a block to the free list, coalescing with its neighbours.
    pub fn free(&mut self, locator: &ResourceLocator) -> Result<(), TransferError> {
        self.verify(locator)?;
        self.live.remove(&locator.offset);
        self.live_bytes -= locator.size;
        self.insert_gap(locator.offset, locator.size);
        log::trace!(
            "Pool {}: freed {} bytes at offset {}",
            self.id.0,
            locator.size,
            locator.offset
        );
        Ok(())
    }

    /// Iterates live blocks in address order.
    pub fn iter_live(&self) -> impl Iterator<Item = (u64, &LiveBlock)> {
        self.live.iter().map(|(offset, block)| (*offset, block))
    }

    /// The number of live blocks.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Looks up the live block at `offset`.
    pub fn live_block(&self, offset: u64) -> Option<&LiveBlock> {
        self.live.get(&offset)
    }

    /// A snapshot of the pool's utilization.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            capacity: self.capacity,
            live_bytes: self.live_bytes,
            free_bytes: self.capacity - self.live_bytes,
            largest_free_block: self.largest_free(),
            live_blocks: self.live.len(),
            free_gaps: self.gaps.len(),
        }
    }

    /// Draws the next generation value from the pool-wide counter.
    pub(crate) fn bump_generation(&mut self) -> Generation {
        let generation = self.next_generation;
        self.next_generation = generation.next();
        generation
    }

    /// Replaces the live-block layout wholesale after a defragmentation
    /// pass, rebuilding the free list and advancing the epoch.
    pub(crate) fn install_layout(&mut self, live: BTreeMap<u64, LiveBlock>) {
        self.live = live;
        self.live_bytes = self.live.values().map(|b| b.size).sum();
        self.gaps.clear();
        let mut cursor = 0u64;
        for (offset, block) in &self.live {
            if *offset > cursor {
                self.gaps.push(Gap {
                    offset: cursor,
                    size: offset - cursor,
                });
            }
            cursor = offset + block.size;
        }
        if cursor < self.capacity {
            self.gaps.push(Gap {
                offset: cursor,
                size: self.capacity - cursor,
            });
        }
        self.epoch += 1;
    }

    fn insert_gap(&mut self, offset: u64, size: u64) {
        let index = self
            .gaps
            .partition_point(|g| g.offset < offset);

        let merges_prev = index > 0 && self.gaps[index - 1].end() == offset;
        let merges_next = index < self.gaps.len() && offset + size == self.gaps[index].offset;

        match (merges_prev, merges_next) {
            (true, true) => {
                self.gaps[index - 1].size += size + self.gaps[index].size;
                self.gaps.remove(index);
            }
            (true, false) => self.gaps[index - 1].size += size,
            (false, true) => {
                self.gaps[index].offset = offset;
                self.gaps[index].size += size;
            }
            (false, false) => self.gaps.insert(index, Gap { offset, size }),
        }
    }

    /// Verifies the structural invariants of the free list and live map.
    /// Used by tests after every mutation sequence.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut regions: Vec<(u64, u64, bool)> = self
            .live
            .iter()
            .map(|(o, b)| (*o, b.size, true))
            .chain(self.gaps.iter().map(|g| (g.offset, g.size, false)))
            .collect();
        regions.sort_by_key(|r| r.0);

        let mut cursor = 0u64;
        let mut previous_was_gap = false;
        for (offset, size, is_live) in regions {
            assert_eq!(offset, cursor, "regions must tile the arena exactly");
            assert!(size > 0, "zero-sized region at offset {offset}");
            if !is_live {
                assert!(!previous_was_gap, "adjacent gaps at offset {offset} not coalesced");
            }
            previous_was_gap = !is_live;
            cursor += size;
        }
        assert_eq!(cursor, self.capacity, "regions must cover the full capacity");
        assert_eq!(
            self.live_bytes,
            self.live.values().map(|b| b.size).sum::<u64>()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_fit_in_address_order() {
        let mut pool = PoolAllocator::new(PoolId(0), 256);
        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(64).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 64);
        assert_ne!(a.generation, b.generation);
        pool.check_invariants();

        // Freeing the first block exposes the lowest-address gap again.
        pool.free(&a).unwrap();
        let c = pool.allocate(32).unwrap();
        assert_eq!(c.offset, 0);
        pool.check_invariants();
    }

    #[test]
    fn free_coalesces_adjacent_gaps() {
        let mut pool = PoolAllocator::new(PoolId(0), 256);
        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(64).unwrap();
        let c = pool.allocate(64).unwrap();

        pool.free(&a).unwrap();
        pool.free(&c).unwrap();
        // The gap left by `c` merges with the arena tail immediately.
        assert_eq!(pool.metrics().free_gaps, 2);
        assert_eq!(pool.largest_free(), 128);

        pool.free(&b).unwrap();
        // Everything merges back into one arena-wide gap.
        let metrics = pool.metrics();
        assert_eq!(metrics.free_gaps, 1);
        assert_eq!(metrics.largest_free_block, 256);
        pool.check_invariants();
    }

    #[test]
    fn out_of_space_reports_largest_free_block() {
        let mut pool = PoolAllocator::new(PoolId(0), 256);
        let a = pool.allocate(64).unwrap();
        let _b = pool.allocate(32).unwrap();
        let _c = pool.allocate(64).unwrap();
        pool.free(&a).unwrap();

        // Free space totals 160 bytes but the largest single gap is 96.
        let err = pool.allocate(128).unwrap_err();
        assert_eq!(
            err,
            TransferError::OutOfSpace {
                requested: 128,
                largest_free: 96,
            }
        );
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = PoolAllocator::new(PoolId(0), 128);
        let a = pool.allocate(64).unwrap();
        pool.free(&a).unwrap();
        assert!(matches!(
            pool.free(&a),
            Err(TransferError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn generation_mismatch_is_stale() {
        let mut pool = PoolAllocator::new(PoolId(0), 128);
        let a = pool.allocate(64).unwrap();
        pool.free(&a).unwrap();
        let b = pool.allocate(64).unwrap();
        assert_eq!(b.offset, a.offset);

        // The recycled offset now carries a newer generation.
        let err = pool.verify(&a).unwrap_err();
        assert_eq!(
            err,
            TransferError::StaleLocator {
                expected: b.generation,
                found: a.generation,
            }
        );
    }

    #[test]
    fn zero_sized_allocation_is_rejected() {
        let mut pool = PoolAllocator::new(PoolId(0), 128);
        assert!(matches!(
            pool.allocate(0),
            Err(TransferError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn metrics_track_utilization() {
        let mut pool = PoolAllocator::new(PoolId(7), 1024);
        let a = pool.allocate(100).unwrap();
        let _b = pool.allocate(200).unwrap();
        pool.free(&a).unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.capacity, 1024);
        assert_eq!(metrics.live_bytes, 200);
        assert_eq!(metrics.free_bytes, 824);
        assert_eq!(metrics.live_blocks, 1);
        assert_eq!(metrics.free_gaps, 2);
        assert_eq!(metrics.largest_free_block, 724);
    }
}
