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

//! The asynchronous upload pipeline: scheduler, workers, completion
//! tracking, and the defragmentation driver.

pub mod defrag;
pub mod scheduler;

pub(crate) mod completion;
pub(crate) mod worker;

pub use defrag::DefragOutcome;
pub use scheduler::TransferScheduler;
