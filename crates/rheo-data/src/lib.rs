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

//! # Rheo Data
//!
//! Data layouts, allocators, and streaming systems: the pool allocator
//! with online defragmentation and the asynchronous transfer scheduler
//! that moves CPU-authored data into GPU-resident resources without
//! stalling the render thread.

pub mod allocators;
pub mod streaming;

pub use allocators::{DefragPlan, DefragStep, PoolAllocator};
pub use streaming::{DefragOutcome, TransferScheduler};
