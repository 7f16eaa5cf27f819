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

//! Generation-checked handles identifying live pool allocations.

/// An opaque handle to a pool of GPU-backed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub usize);

/// A version counter on a pool allocation.
///
/// The generation is bumped whenever defragmentation relocates the
/// allocation. A locator whose generation no longer matches the pool's
/// record is stale and must be re-resolved, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation assigned to a freshly created allocation.
    pub const FIRST: Self = Self(1);

    /// Returns the next generation value.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A non-owning reference to a live allocation inside a pool.
///
/// Valid only as long as its `generation` matches the pool's current
/// generation for the allocation; defragmentation invalidates locators by
/// bumping the generation of every relocated block. Holding a stale locator
/// past a defrag cycle and using it is a caller bug which the pool surfaces
/// loudly as [`TransferError::StaleLocator`] instead of silently reading the
/// wrong bytes.
///
/// [`TransferError::StaleLocator`]: crate::transfer::error::TransferError::StaleLocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLocator {
    /// The pool holding the allocation.
    pub pool: PoolId,
    /// The byte offset of the allocation within the pool.
    pub offset: u64,
    /// The size of the allocation in bytes.
    pub size: u64,
    /// The allocation's generation at the time the locator was issued.
    pub generation: Generation,
}

impl ResourceLocator {
    /// Returns the exclusive end offset of the allocation.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_ordering() {
        let first = Generation::FIRST;
        assert!(first.next() > first);
        assert_eq!(first.next(), Generation(2));
    }

    #[test]
    fn locator_end() {
        let locator = ResourceLocator {
            pool: PoolId(0),
            offset: 64,
            size: 32,
            generation: Generation::FIRST,
        };
        assert_eq!(locator.end(), 96);
    }
}
