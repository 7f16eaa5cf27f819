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

//! The [`UploadContext`] reference implementation, backed by plain CPU
//! memory.
//!
//! `SoftwareDevice` models the timeline semantics real backends expose:
//! copies are recorded into an open batch, batches complete in submission
//! order, and nothing a copy wrote is observable before its fence
//! retires. In `auto_complete` mode every submitted batch completes
//! immediately; in manual mode the test owns the timeline through
//! [`SoftwareDevice::complete_through`] and [`SoftwareDevice::pump`] and
//! can hold fences open to exercise the pipeline's deferred paths.

use rheo_core::transfer::api::descriptor::{ResourceDescriptor, ResourceId, ResourceKind};
use rheo_core::transfer::api::fence::FenceValue;
use rheo_core::transfer::api::packet::SubresourceIndex;
use rheo_core::transfer::error::TransferError;
use rheo_core::transfer::traits::{MapToken, MappedRegion, UploadContext};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct SoftResource {
    desc: ResourceDescriptor,
    subresources: HashMap<SubresourceIndex, Vec<u8>>,
}

impl SoftResource {
    fn new(desc: &ResourceDescriptor) -> Self {
        let mut subresources = HashMap::new();
        match desc.kind {
            ResourceKind::LinearBuffer => {
                subresources.insert(SubresourceIndex::WHOLE, vec![0u8; desc.size as usize]);
            }
            ResourceKind::Texture => {
                for layer in 0..desc.array_layer_count {
                    for mip in 0..desc.mip_level_count {
                        subresources.insert(
                            SubresourceIndex::new(mip, layer),
                            vec![0u8; desc.subresource_size_bytes(mip) as usize],
                        );
                    }
                }
            }
        }
        Self {
            desc: desc.clone(),
            subresources,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenMap {
    resource: ResourceId,
    sub: SubresourceIndex,
    base: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct RecordedCopy {
    dst: ResourceId,
    dst_sub: SubresourceIndex,
    dst_offset: u64,
    src: ResourceId,
    src_sub: SubresourceIndex,
    src_offset: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct DeviceState {
    resources: HashMap<ResourceId, SoftResource>,
    next_resource: usize,
    maps: HashMap<u64, OpenMap>,
    next_token: u64,
    recorded: Vec<RecordedCopy>,
    submitted: BTreeMap<u64, Vec<RecordedCopy>>,
    next_fence: u64,
    completed_fence: u64,
    injected_map_failures: u32,
}

/// A transfer backend over CPU memory, for integration tests and as the
/// reference for backend implementers.
#[derive(Debug)]
pub struct SoftwareDevice {
    state: Mutex<DeviceState>,
    auto_complete: bool,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    /// A device whose submitted batches complete immediately.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                next_fence: 1,
                ..DeviceState::default()
            }),
            auto_complete: true,
        }
    }

    /// A device whose timeline only advances through
    /// [`SoftwareDevice::complete_through`] or [`SoftwareDevice::pump`].
    pub fn manual() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                next_fence: 1,
                ..DeviceState::default()
            }),
            auto_complete: false,
        }
    }

    /// Executes every submitted batch with a fence at or below `fence`,
    /// in submission order.
    pub fn complete_through(&self, fence: FenceValue) {
        let mut state = self.state.lock().unwrap();
        Self::execute_through(&mut state, fence.0);
    }

    /// Executes every submitted batch.
    pub fn pump(&self) {
        let mut state = self.state.lock().unwrap();
        let latest = state.submitted.keys().next_back().copied();
        if let Some(latest) = latest {
            Self::execute_through(&mut state, latest);
        }
    }

    /// Makes the next `count` map attempts fail with a transient
    /// `DeviceUnavailable`, exercising callers' retry paths.
    pub fn inject_map_failures(&self, count: u32) {
        self.state.lock().unwrap().injected_map_failures = count;
    }

    /// The number of live resources, staging included.
    pub fn resource_count(&self) -> usize {
        self.state.lock().unwrap().resources.len()
    }

    fn execute_through(state: &mut DeviceState, fence: u64) {
        let due: Vec<u64> = state
            .submitted
            .range(..=fence)
            .map(|(f, _)| *f)
            .collect();
        for batch_fence in due {
            if let Some(copies) = state.submitted.remove(&batch_fence) {
                for copy in copies {
                    Self::execute_copy(state, &copy);
                }
            }
        }
        state.completed_fence = state.completed_fence.max(fence);
    }

    fn execute_copy(state: &mut DeviceState, copy: &RecordedCopy) {
        let bytes = match state
            .resources
            .get(&copy.src)
            .and_then(|r| r.subresources.get(&copy.src_sub))
        {
            Some(src) => {
                let start = copy.src_offset.min(src.len() as u64) as usize;
                let end = (copy.src_offset + copy.size).min(src.len() as u64) as usize;
                src[start..end].to_vec()
            }
            None => {
                log::error!(
                    "Recorded copy reads from missing resource {} at execution time",
                    copy.src.0
                );
                return;
            }
        };
        match state
            .resources
            .get_mut(&copy.dst)
            .and_then(|r| r.subresources.get_mut(&copy.dst_sub))
        {
            Some(dst) => {
                let start = copy.dst_offset.min(dst.len() as u64) as usize;
                let end = (start + bytes.len()).min(dst.len());
                dst[start..end].copy_from_slice(&bytes[..end - start]);
            }
            None => log::error!(
                "Recorded copy writes to missing resource {} at execution time",
                copy.dst.0
            ),
        }
    }
}

impl UploadContext for SoftwareDevice {
    fn create_resource(&self, desc: &ResourceDescriptor) -> Result<ResourceId, TransferError> {
        desc.validate()?;
        let mut state = self.state.lock().unwrap();
        let id = ResourceId(state.next_resource);
        state.next_resource += 1;
        state.resources.insert(id, SoftResource::new(desc));
        log::trace!(
            "Created resource {} ({:?}, {} bytes)",
            id.0,
            desc.kind,
            desc.total_size_bytes()
        );
        Ok(id)
    }

    fn destroy_resource(&self, id: ResourceId) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.resources.remove(&id).ok_or_else(|| {
            TransferError::InvalidDescriptor(format!("destroy of unknown resource {}", id.0))
        })?;
        Ok(())
    }

    fn map_for_write(
        &self,
        id: ResourceId,
        sub: SubresourceIndex,
        offset: u64,
    ) -> Result<MappedRegion, TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.injected_map_failures > 0 {
            state.injected_map_failures -= 1;
            return Err(TransferError::DeviceUnavailable(
                "injected transient map refusal".into(),
            ));
        }
        if state
            .maps
            .values()
            .any(|m| m.resource == id && m.sub == sub)
        {
            return Err(TransferError::DeviceUnavailable(format!(
                "subresource ({}, {}) of resource {} is already mapped",
                sub.mip, sub.layer, id.0
            )));
        }
        let resource = state.resources.get(&id).ok_or_else(|| {
            TransferError::InvalidDescriptor(format!("map of unknown resource {}", id.0))
        })?;
        let len = resource
            .subresources
            .get(&sub)
            .map(|b| b.len() as u64)
            .ok_or_else(|| {
                TransferError::InvalidDescriptor(format!(
                    "resource {} has no subresource (mip {}, layer {})",
                    id.0, sub.mip, sub.layer
                ))
            })?;
        if offset > len {
            return Err(TransferError::InvalidDescriptor(format!(
                "map offset {offset} exceeds subresource size {len}"
            )));
        }
        let pitches = resource.desc.tight_pitches(sub.mip);

        let token = MapToken(state.next_token);
        state.next_token += 1;
        state.maps.insert(
            token.0,
            OpenMap {
                resource: id,
                sub,
                base: offset,
                size: len - offset,
            },
        );
        Ok(MappedRegion {
            token,
            size: len - offset,
            pitches,
        })
    }

    fn write_mapped(
        &self,
        token: &MapToken,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, TransferError> {
        let mut state = self.state.lock().unwrap();
        let map = *state.maps.get(&token.0).ok_or_else(|| {
            TransferError::DeviceUnavailable(format!("write through closed map token {}", token.0))
        })?;
        let bytes = state
            .resources
            .get_mut(&map.resource)
            .and_then(|r| r.subresources.get_mut(&map.sub))
            .ok_or_else(|| {
                TransferError::DeviceUnavailable(format!(
                    "mapped resource {} no longer exists",
                    map.resource.0
                ))
            })?;

        if offset >= map.size {
            return Ok(0);
        }
        let writable = (map.size - offset).min(data.len() as u64) as usize;
        let start = (map.base + offset) as usize;
        bytes[start..start + writable].copy_from_slice(&data[..writable]);
        Ok(writable as u64)
    }

    fn unmap_after_write(&self, token: MapToken) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.maps.remove(&token.0).ok_or_else(|| {
            TransferError::DeviceUnavailable(format!("unmap of closed map token {}", token.0))
        })?;
        Ok(())
    }

    fn copy_region(
        &self,
        dst: ResourceId,
        dst_sub: SubresourceIndex,
        dst_offset: u64,
        src: ResourceId,
        src_sub: SubresourceIndex,
        src_offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if !state.resources.contains_key(&dst) {
            return Err(TransferError::InvalidDescriptor(format!(
                "copy into unknown resource {}",
                dst.0
            )));
        }
        if !state.resources.contains_key(&src) {
            return Err(TransferError::InvalidDescriptor(format!(
                "copy from unknown resource {}",
                src.0
            )));
        }
        state.recorded.push(RecordedCopy {
            dst,
            dst_sub,
            dst_offset,
            src,
            src_sub,
            src_offset,
            size,
        });
        Ok(())
    }

    fn copy_resource(&self, dst: ResourceId, src: ResourceId) -> Result<(), TransferError> {
        let subresources: Vec<(SubresourceIndex, u64)> = {
            let state = self.state.lock().unwrap();
            let source = state.resources.get(&src).ok_or_else(|| {
                TransferError::InvalidDescriptor(format!("copy from unknown resource {}", src.0))
            })?;
            if !state.resources.contains_key(&dst) {
                return Err(TransferError::InvalidDescriptor(format!(
                    "copy into unknown resource {}",
                    dst.0
                )));
            }
            source
                .subresources
                .iter()
                .map(|(sub, bytes)| (*sub, bytes.len() as u64))
                .collect()
        };
        for (sub, size) in subresources {
            self.copy_region(dst, sub, 0, src, sub, 0, size)?;
        }
        Ok(())
    }

    fn submit_and_fence(&self) -> Result<FenceValue, TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.recorded.is_empty() {
            // No new batch: hand back the last issued fence, which covers
            // every batch already on the timeline, retired or not.
            return Ok(FenceValue(state.next_fence - 1));
        }
        let fence = state.next_fence;
        state.next_fence += 1;
        let batch = std::mem::take(&mut state.recorded);
        state.submitted.insert(fence, batch);
        if self.auto_complete {
            Self::execute_through(&mut state, fence);
        }
        Ok(FenceValue(fence))
    }

    fn is_fence_complete(&self, fence: FenceValue) -> bool {
        self.state.lock().unwrap().completed_fence >= fence.0
    }

    fn wait_fence(&self, fence: FenceValue) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if self.auto_complete {
                    Self::execute_through(&mut state, fence.0);
                }
                if state.completed_fence >= fence.0 {
                    return;
                }
            }
            // Manual mode: another thread owns the timeline.
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    fn read_back(
        &self,
        id: ResourceId,
        sub: SubresourceIndex,
    ) -> Result<Vec<u8>, TransferError> {
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(&id)
            .and_then(|r| r.subresources.get(&sub))
            .cloned()
            .ok_or_else(|| {
                TransferError::InvalidDescriptor(format!(
                    "readback of unknown resource {} (mip {}, layer {})",
                    id.0, sub.mip, sub.layer
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rheo_core::transfer::api::descriptor::ResourceUsage;

    fn buffer_desc(size: u64) -> ResourceDescriptor {
        ResourceDescriptor::buffer(None, size, ResourceUsage::MAP_WRITE | ResourceUsage::COPY_SRC)
    }

    #[test]
    fn mapped_writes_truncate_at_the_boundary() {
        let device = SoftwareDevice::new();
        let id = device.create_resource(&buffer_desc(8)).unwrap();

        let mapped = device
            .map_for_write(id, SubresourceIndex::WHOLE, 0)
            .unwrap();
        assert_eq!(mapped.size, 8);
        let written = device
            .write_mapped(&mapped.token, 4, &[1, 2, 3, 4, 5, 6])
            .unwrap();
        assert_eq!(written, 4);
        device.unmap_after_write(mapped.token).unwrap();

        let bytes = device.read_back(id, SubresourceIndex::WHOLE).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn double_map_reports_busy() {
        let device = SoftwareDevice::new();
        let id = device.create_resource(&buffer_desc(8)).unwrap();

        let first = device
            .map_for_write(id, SubresourceIndex::WHOLE, 0)
            .unwrap();
        assert!(matches!(
            device.map_for_write(id, SubresourceIndex::WHOLE, 0),
            Err(TransferError::DeviceUnavailable(_))
        ));
        device.unmap_after_write(first.token).unwrap();
        assert!(device.map_for_write(id, SubresourceIndex::WHOLE, 0).is_ok());
    }

    #[test]
    fn copies_are_invisible_until_the_fence_retires() {
        let device = SoftwareDevice::manual();
        let src = device.create_resource(&buffer_desc(4)).unwrap();
        let dst = device.create_resource(&buffer_desc(4)).unwrap();

        let mapped = device
            .map_for_write(src, SubresourceIndex::WHOLE, 0)
            .unwrap();
        device
            .write_mapped(&mapped.token, 0, &[7, 7, 7, 7])
            .unwrap();
        device.unmap_after_write(mapped.token).unwrap();

        device
            .copy_region(
                dst,
                SubresourceIndex::WHOLE,
                0,
                src,
                SubresourceIndex::WHOLE,
                0,
                4,
            )
            .unwrap();
        let fence = device.submit_and_fence().unwrap();

        assert!(!device.is_fence_complete(fence));
        assert_eq!(
            device.read_back(dst, SubresourceIndex::WHOLE).unwrap(),
            vec![0, 0, 0, 0]
        );

        device.complete_through(fence);
        assert!(device.is_fence_complete(fence));
        assert_eq!(
            device.read_back(dst, SubresourceIndex::WHOLE).unwrap(),
            vec![7, 7, 7, 7]
        );
    }

    #[test]
    fn whole_resource_copy_covers_every_subresource() {
        use rheo_core::math::Extent3D;
        use rheo_core::transfer::api::descriptor::TexelFormat;

        let device = SoftwareDevice::new();
        let desc = ResourceDescriptor::texture_2d(
            None,
            Extent3D::new(4, 4, 1),
            2,
            1,
            TexelFormat::R8Unorm,
            ResourceUsage::MAP_WRITE | ResourceUsage::COPY_SRC | ResourceUsage::COPY_DST,
        );
        let src = device.create_resource(&desc).unwrap();
        let dst = device.create_resource(&desc).unwrap();

        for (mip, value) in [(0u32, 0xAAu8), (1, 0xBB)] {
            let sub = SubresourceIndex::new(mip, 0);
            let mapped = device.map_for_write(src, sub, 0).unwrap();
            device
                .write_mapped(&mapped.token, 0, &vec![value; mapped.size as usize])
                .unwrap();
            device.unmap_after_write(mapped.token).unwrap();
        }

        device.copy_resource(dst, src).unwrap();
        let fence = device.submit_and_fence().unwrap();
        assert!(device.is_fence_complete(fence));

        let mip0 = device.read_back(dst, SubresourceIndex::new(0, 0)).unwrap();
        let mip1 = device.read_back(dst, SubresourceIndex::new(1, 0)).unwrap();
        assert_eq!(mip0, vec![0xAA; 16]);
        assert_eq!(mip1, vec![0xBB; 4]);
    }

    #[test]
    fn empty_submission_yields_a_completed_fence() {
        let device = SoftwareDevice::manual();
        let fence = device.submit_and_fence().unwrap();
        assert!(device.is_fence_complete(fence));
    }

    #[test]
    fn empty_submission_fences_behind_submitted_batches() {
        let device = SoftwareDevice::manual();
        let src = device.create_resource(&buffer_desc(4)).unwrap();
        let dst = device.create_resource(&buffer_desc(4)).unwrap();

        device
            .copy_region(
                dst,
                SubresourceIndex::WHOLE,
                0,
                src,
                SubresourceIndex::WHOLE,
                0,
                4,
            )
            .unwrap();
        let pending = device.submit_and_fence().unwrap();

        // An empty submission must not report completion ahead of a batch
        // still in flight on the timeline.
        let fence = device.submit_and_fence().unwrap();
        assert_eq!(fence, pending);
        assert!(!device.is_fence_complete(fence));

        device.pump();
        assert!(device.is_fence_complete(fence));
    }

    #[test]
    fn injected_map_failures_are_transient() {
        let device = SoftwareDevice::new();
        let id = device.create_resource(&buffer_desc(8)).unwrap();
        device.inject_map_failures(2);

        assert!(device.map_for_write(id, SubresourceIndex::WHOLE, 0).is_err());
        assert!(device.map_for_write(id, SubresourceIndex::WHOLE, 0).is_err());
        assert!(device.map_for_write(id, SubresourceIndex::WHOLE, 0).is_ok());
    }

    #[test]
    fn batches_complete_in_submission_order() {
        let device = SoftwareDevice::manual();
        let src = device.create_resource(&buffer_desc(4)).unwrap();
        let dst = device.create_resource(&buffer_desc(4)).unwrap();

        // Batch 1 writes ones, batch 2 writes twos to the same range.
        for value in [1u8, 2] {
            let mapped = device
                .map_for_write(src, SubresourceIndex::WHOLE, 0)
                .unwrap();
            device
                .write_mapped(&mapped.token, 0, &[value; 4])
                .unwrap();
            device.unmap_after_write(mapped.token).unwrap();
            device
                .copy_region(
                    dst,
                    SubresourceIndex::WHOLE,
                    0,
                    src,
                    SubresourceIndex::WHOLE,
                    0,
                    4,
                )
                .unwrap();
            device.submit_and_fence().unwrap();
        }

        device.pump();
        // The later batch's bytes win; note both batches read `src` at
        // execution time, so this checks ordering of the copies only.
        assert_eq!(
            device.read_back(dst, SubresourceIndex::WHOLE).unwrap(),
            vec![2, 2, 2, 2]
        );
    }
}
