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

//! Completion markers on the device command timeline.

/// A monotonically increasing marker on the GPU command timeline.
///
/// Every submitted batch of commands is associated with a fence value; a
/// batch has completed once the device timeline has advanced past its value.
/// All higher-level "is this transaction done" queries reduce to a fence
/// comparison through
/// [`UploadContext::is_fence_complete`](crate::transfer::traits::UploadContext::is_fence_complete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceValue(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_values_order() {
        assert!(FenceValue(3) > FenceValue(2));
        assert!(FenceValue(0) < FenceValue(1));
    }
}
