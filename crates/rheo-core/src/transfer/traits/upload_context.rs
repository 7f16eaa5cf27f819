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

//! The device abstraction consumed by the streaming layer.

use crate::transfer::api::descriptor::{ResourceDescriptor, ResourceId};
use crate::transfer::api::fence::FenceValue;
use crate::transfer::api::packet::{Pitches, SubresourceIndex};
use crate::transfer::error::TransferError;
use std::fmt::Debug;

/// An opaque handle to an open CPU mapping of a subresource.
///
/// Issued by [`UploadContext::map_for_write`] and consumed by
/// [`UploadContext::unmap_after_write`]. Writes through a token that has
/// already been unmapped are rejected by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapToken(pub u64);

/// A successfully opened CPU mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// The handle used for subsequent writes and the final unmap.
    pub token: MapToken,
    /// The number of mapped bytes.
    pub size: u64,
    /// The backend's row and slice strides for the mapped subresource.
    ///
    /// May be wider than the tight packing of the source data, in which
    /// case the caller copies row by row.
    pub pitches: Pitches,
}

/// Abstract interface to a transfer-capable device backend.
///
/// The streaming layer in `rheo-data` is written entirely against this
/// trait; `rheo-infra` provides a software implementation backed by CPU
/// memory. Resources are referred to by [`ResourceId`] handles, never by
/// backend pointers.
///
/// Completion is expressed exclusively through fences: every submitted
/// command batch is tagged with a [`FenceValue`], and
/// [`is_fence_complete`](UploadContext::is_fence_complete) is the only
/// non-blocking completion primitive.
///
/// # Threading
///
/// Implementations must be safe to call from the scheduler thread and the
/// upload worker threads concurrently. [`map_for_write`]
/// (UploadContext::map_for_write) is the only call permitted to block
/// briefly (a busy resource), and only upload workers issue it.
pub trait UploadContext: Send + Sync + Debug {
    /// Creates a resource matching `desc` and returns its handle.
    fn create_resource(&self, desc: &ResourceDescriptor) -> Result<ResourceId, TransferError>;

    /// Destroys a resource. Destroying an id that is still referenced by
    /// unsubmitted commands is a caller bug.
    fn destroy_resource(&self, id: ResourceId) -> Result<(), TransferError>;

    /// Opens a CPU write mapping of one subresource, starting `offset`
    /// bytes into it.
    fn map_for_write(
        &self,
        id: ResourceId,
        sub: SubresourceIndex,
        offset: u64,
    ) -> Result<MappedRegion, TransferError>;

    /// Writes `data` into an open mapping at `offset` bytes from the start
    /// of the mapping. Returns the number of bytes written, which is the
    /// smaller of `data.len()` and the remaining mapped size. Never writes
    /// out of bounds.
    fn write_mapped(
        &self,
        token: &MapToken,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, TransferError>;

    /// Closes a mapping, making the written bytes visible to subsequent
    /// device commands.
    fn unmap_after_write(&self, token: MapToken) -> Result<(), TransferError>;

    /// Records a copy of `size` bytes between subresources into the open
    /// command batch. The copy executes when the batch is submitted.
    #[allow(clippy::too_many_arguments)]
    fn copy_region(
        &self,
        dst: ResourceId,
        dst_sub: SubresourceIndex,
        dst_offset: u64,
        src: ResourceId,
        src_sub: SubresourceIndex,
        src_offset: u64,
        size: u64,
    ) -> Result<(), TransferError>;

    /// Records a whole-resource copy into the open command batch. Both
    /// resources must share a layout.
    fn copy_resource(&self, dst: ResourceId, src: ResourceId) -> Result<(), TransferError>;

    /// Closes the open command batch, submits it, and returns the fence
    /// value that retires when the batch completes. Submitting an empty
    /// batch is valid and returns the most recently issued fence, so
    /// waiting on the result always covers every batch submitted so far.
    fn submit_and_fence(&self) -> Result<FenceValue, TransferError>;

    /// Returns `true` once the device timeline has passed `fence`.
    fn is_fence_complete(&self, fence: FenceValue) -> bool;

    /// Blocks until `fence` has completed. Used by flush and shutdown
    /// paths only; never called from the render thread's fast path.
    fn wait_fence(&self, fence: FenceValue);

    /// Reads one subresource's bytes back to the CPU. Only meaningful
    /// once all writes to the resource have retired.
    fn read_back(
        &self,
        id: ResourceId,
        sub: SubresourceIndex,
    ) -> Result<Vec<u8>, TransferError>;
}
