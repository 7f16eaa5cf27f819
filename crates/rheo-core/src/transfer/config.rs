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

//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Construction-time configuration of the transfer scheduler.
///
/// Passed explicitly rather than read from ambient global state, so every
/// behavioral switch is reproducible in tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// The number of background upload worker threads.
    pub worker_count: usize,
    /// How many times a worker retries a failed map call before failing the
    /// transaction with `DeviceUnavailable`.
    pub map_retry_budget: u32,
    /// The pause between map retries.
    pub map_retry_backoff: Duration,
    /// The capacity in bytes of the streaming pool backing linear-buffer
    /// allocations.
    pub streaming_pool_capacity: u64,
    /// The alignment applied to staging allocations.
    pub staging_alignment: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            map_retry_budget: 3,
            map_retry_backoff: Duration::from_millis(1),
            streaming_pool_capacity: 4 * 1024 * 1024,
            staging_alignment: 256,
        }
    }
}

impl TransferConfig {
    /// Rounds `size` up to the configured staging alignment.
    pub fn align_staging(&self, size: u64) -> u64 {
        let alignment = self.staging_alignment.max(1);
        size.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_alignment_rounds_up() {
        let config = TransferConfig::default();
        assert_eq!(config.align_staging(1), 256);
        assert_eq!(config.align_staging(256), 256);
        assert_eq!(config.align_staging(257), 512);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = TransferConfig {
            worker_count: 2,
            ..TransferConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: TransferConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
