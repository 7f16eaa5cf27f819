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

//! Defines the error types of the transfer pipeline.

use crate::transfer::api::locator::Generation;
use crate::transfer::api::transaction::TransactionId;
use std::fmt;

/// An error produced by the transfer pipeline.
///
/// Worker-local failures never cross the producer/consumer boundary as
/// panics; they are recorded on the owning transaction and retrieved by
/// value through polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The request was malformed (caller bug): inconsistent descriptor
    /// dimensions, or a region box outside the resource extents. Rejected
    /// immediately with no partial effect.
    InvalidDescriptor(String),
    /// A pool allocation failed. Recoverable: trigger a defragmentation
    /// pass or grow the pool, then retry. Data is never silently dropped.
    OutOfSpace {
        /// The number of bytes requested.
        requested: u64,
        /// The largest contiguous free block at the time of the request.
        largest_free: u64,
    },
    /// A backend map or copy operation failed (e.g. device lost, or a
    /// resource stayed busy past the retry budget). The transaction is
    /// marked failed; the destination is left in its last-known-good state
    /// unless the failure hit mid-copy, in which case it is explicitly
    /// torn.
    DeviceUnavailable(String),
    /// A locator was used after a defragmentation cycle relocated its
    /// allocation. A programmer error surfaced loudly rather than silently
    /// reading the wrong offset.
    StaleLocator {
        /// The generation currently recorded by the pool.
        expected: Generation,
        /// The stale generation carried by the locator.
        found: Generation,
    },
    /// The transaction id is unknown: never issued, or already retired and
    /// its result retrieved.
    UnknownTransaction(TransactionId),
    /// The upload workers have shut down and can accept no further work.
    Disconnected,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::InvalidDescriptor(msg) => {
                write!(f, "Invalid transfer request: {msg}")
            }
            TransferError::OutOfSpace {
                requested,
                largest_free,
            } => {
                write!(
                    f,
                    "Pool out of space: requested {requested} bytes, largest free block is {largest_free} bytes"
                )
            }
            TransferError::DeviceUnavailable(msg) => {
                write!(f, "Device unavailable: {msg}")
            }
            TransferError::StaleLocator { expected, found } => {
                write!(
                    f,
                    "Stale resource locator: pool records generation {}, locator carries {}",
                    expected.0, found.0
                )
            }
            TransferError::UnknownTransaction(id) => {
                write!(f, "Unknown transaction id: {}", id.0)
            }
            TransferError::Disconnected => {
                write!(f, "The upload workers have shut down.")
            }
        }
    }
}

impl std::error::Error for TransferError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_space_display() {
        let err = TransferError::OutOfSpace {
            requested: 96,
            largest_free: 32,
        };
        assert_eq!(
            format!("{err}"),
            "Pool out of space: requested 96 bytes, largest free block is 32 bytes"
        );
    }

    #[test]
    fn stale_locator_display() {
        let err = TransferError::StaleLocator {
            expected: Generation(3),
            found: Generation(1),
        };
        assert_eq!(
            format!("{err}"),
            "Stale resource locator: pool records generation 3, locator carries 1"
        );
    }

    #[test]
    fn invalid_descriptor_display() {
        let err = TransferError::InvalidDescriptor("box outside extents".to_string());
        assert_eq!(format!("{err}"), "Invalid transfer request: box outside extents");
    }
}
