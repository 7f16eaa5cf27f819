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

//! Provides the public, backend-agnostic contracts of the transfer pipeline.
//!
//! This module defines the "common language" for moving CPU-authored data
//! into GPU-resident resources. It contains the abstract traits (like
//! [`UploadContext`]), data structures (like [`ResourceDescriptor`] and
//! [`ResourceLocator`]), and the error types that form the stable,
//! public-facing API of the subsystem.
//!
//! This module defines the 'what' of uploading, while the 'how' is handled
//! by a concrete backend in the `rheo-infra` crate which implements these
//! traits. The scheduler and workers in `rheo-data` then use these traits to
//! perform their work without knowing the specifics of the underlying
//! graphics API.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod traits;

// Re-export the most important traits and types for easier use.
pub use self::api::*;
pub use self::config::TransferConfig;
pub use self::error::TransferError;
pub use self::metrics::{PoolMetrics, TransferMetrics, TransferMetricsSnapshot};
pub use self::traits::{MapToken, MappedRegion, UploadContext};
