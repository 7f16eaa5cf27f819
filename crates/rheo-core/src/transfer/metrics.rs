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

//! Thread-safe counters and reporting snapshots for the transfer pipeline.
//!
//! The counters form a contract: the scheduler, workers, and completion
//! tracker increment them, and any thread may take a consistent-enough
//! snapshot to decide, for example, when pool fragmentation warrants a
//! defragmentation pass.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the pipeline.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    /// Transactions accepted by the scheduler.
    pub transactions_submitted: AtomicU64,
    /// Transactions that reached `Completed`.
    pub transactions_completed: AtomicU64,
    /// Transactions that reached `Failed`.
    pub transactions_failed: AtomicU64,
    /// Bytes copied CPU-side into mapped or staging memory.
    pub bytes_uploaded: AtomicU64,
    /// Staging resources created for the staging path.
    pub staging_allocations: AtomicU64,
    /// Staging resources released after their fence retired.
    pub staging_released: AtomicU64,
    /// Defragmentation passes committed.
    pub defrag_passes: AtomicU64,
    /// Bytes relocated by committed defragmentation passes.
    pub defrag_bytes_moved: AtomicU64,
}

impl TransferMetrics {
    /// Adds `bytes` to the uploaded-bytes counter, guarding against
    /// overflow.
    pub fn record_uploaded(&self, bytes: u64) {
        let previous = self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
        if previous.checked_add(bytes).is_none() {
            log::error!("Transfer metrics counter overflowed! Bytes: {bytes}");
        }
    }
}

/// Utilization and fragmentation statistics for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Total pool capacity in bytes.
    pub capacity: u64,
    /// Bytes held by live allocations.
    pub live_bytes: u64,
    /// Bytes available across all free gaps.
    pub free_bytes: u64,
    /// The largest single contiguous free gap.
    pub largest_free_block: u64,
    /// The number of live allocations.
    pub live_blocks: usize,
    /// The number of free gaps.
    pub free_gaps: usize,
}

impl PoolMetrics {
    /// Fragmentation in `[0, 1]`: zero when all free space is one
    /// contiguous block, approaching one as free space shatters.
    pub fn fragmentation(&self) -> f32 {
        if self.free_bytes == 0 {
            0.0
        } else {
            1.0 - (self.largest_free_block as f32 / self.free_bytes as f32)
        }
    }
}

/// A point-in-time snapshot of the whole pipeline, suitable for telemetry
/// export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferMetricsSnapshot {
    /// Transactions accepted by the scheduler.
    pub transactions_submitted: u64,
    /// Transactions that reached `Completed`.
    pub transactions_completed: u64,
    /// Transactions that reached `Failed`.
    pub transactions_failed: u64,
    /// Transactions still in flight.
    pub transactions_outstanding: u64,
    /// Bytes copied CPU-side into mapped or staging memory.
    pub bytes_uploaded: u64,
    /// Staging resources created for the staging path.
    pub staging_allocations: u64,
    /// Staging resources currently alive (created minus released).
    pub staging_outstanding: u64,
    /// Defragmentation passes committed.
    pub defrag_passes: u64,
    /// Bytes relocated by committed defragmentation passes.
    pub defrag_bytes_moved: u64,
    /// Per-pool utilization, keyed by pool id.
    pub pools: Vec<(usize, PoolMetrics)>,
}

impl TransferMetricsSnapshot {
    /// Builds the counter portion of a snapshot from live metrics.
    pub fn from_counters(metrics: &TransferMetrics) -> Self {
        let submitted = metrics.transactions_submitted.load(Ordering::Relaxed);
        let completed = metrics.transactions_completed.load(Ordering::Relaxed);
        let failed = metrics.transactions_failed.load(Ordering::Relaxed);
        let staged = metrics.staging_allocations.load(Ordering::Relaxed);
        let released = metrics.staging_released.load(Ordering::Relaxed);
        Self {
            transactions_submitted: submitted,
            transactions_completed: completed,
            transactions_failed: failed,
            transactions_outstanding: submitted.saturating_sub(completed + failed),
            bytes_uploaded: metrics.bytes_uploaded.load(Ordering::Relaxed),
            staging_allocations: staged,
            staging_outstanding: staged.saturating_sub(released),
            defrag_passes: metrics.defrag_passes.load(Ordering::Relaxed),
            defrag_bytes_moved: metrics.defrag_bytes_moved.load(Ordering::Relaxed),
            pools: Vec::new(),
        }
    }
}
