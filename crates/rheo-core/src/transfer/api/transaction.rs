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

//! Transfer transactions and their observable lifecycle.

use crate::transfer::api::locator::ResourceLocator;
use crate::transfer::error::TransferError;

/// A unique, monotonically assigned identifier for a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

/// The operation a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Create a destination resource and fill it with initial data.
    Create,
    /// Update a region of an existing resource.
    UpdateRegion,
    /// Read a resource's bytes back to the CPU.
    Readback,
    /// An internal defragmentation move batch.
    DefragCopy,
}

/// The internal lifecycle of a transaction.
///
/// Created `Pending` by the scheduler, advanced by the upload workers
/// (`Mapped` while the CPU-side copy runs, `Copying` while a GPU-side copy
/// is in flight), and finished by the completion tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Queued; no worker has picked the transaction up yet.
    Pending,
    /// A worker holds a CPU mapping and is copying into it.
    Mapped,
    /// The CPU-side copy is done; a GPU-side copy awaits its fence.
    Copying,
    /// All work retired; the result can be retrieved.
    Completed,
    /// The transaction failed; the error is reported through polling.
    Failed(TransferError),
}

/// The caller-visible result of polling a transaction.
///
/// Returned by value from the scheduler's non-blocking `poll`; errors are
/// never thrown across the producer/consumer boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// The transaction has not finished yet; poll again next frame.
    Pending,
    /// The transaction completed; the locator identifies the destination.
    Ready(ResourceLocator),
    /// The transaction failed and may be retried with a fresh submission.
    Failed(TransferError),
}

impl PollStatus {
    /// Returns `true` once the transaction has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_status_terminality() {
        assert!(!PollStatus::Pending.is_terminal());
        assert!(PollStatus::Failed(TransferError::Disconnected).is_terminal());
    }
}
