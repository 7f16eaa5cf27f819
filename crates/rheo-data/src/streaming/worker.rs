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

//! Background upload workers and the per-destination ordering gate.

use crate::streaming::completion::RetireAction;
use crate::streaming::scheduler::SchedulerShared;
use rheo_core::transfer::api::descriptor::{
    RegionBox, ResourceDescriptor, ResourceId, ResourceKind, ResourceUsage,
};
use rheo_core::transfer::api::locator::PoolId;
use rheo_core::transfer::api::packet::{DataPacket, Pitches, SubresourceIndex};
use rheo_core::transfer::api::transaction::{TransactionId, TransactionStatus};
use rheo_core::transfer::error::TransferError;
use rheo_core::transfer::traits::MappedRegion;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// Identifies the logical destination a job writes to. Jobs with the same
/// key must execute in submission order.
pub(crate) type DestinationKey = (PoolId, u64);

/// A command handed to the worker threads over the job channel.
pub(crate) enum WorkerCommand {
    /// Execute an upload job.
    Execute(UploadJob),
    /// Stop the receiving worker thread.
    Shutdown,
}

/// One unit of background transfer work.
pub(crate) struct UploadJob {
    pub id: TransactionId,
    pub key: DestinationKey,
    pub payload: JobPayload,
}

pub(crate) enum JobPayload {
    /// Create a dedicated resource and fill it through direct mapping.
    CreateDedicated {
        desc: ResourceDescriptor,
        packet: Arc<dyn DataPacket>,
        pool: PoolId,
    },
    /// Write bytes into a sub-range of a pool's backing buffer through a
    /// staging round-trip.
    UploadPooled {
        backing: ResourceId,
        offset: u64,
        size: u64,
        packet: Arc<dyn DataPacket>,
    },
    /// Update a dedicated resource, boxed or whole.
    UpdateDedicated {
        resource: ResourceId,
        desc: ResourceDescriptor,
        packet: Arc<dyn DataPacket>,
        region: Option<RegionBox>,
    },
    /// Read a subresource (or a byte range of it) back to the CPU.
    Readback {
        resource: ResourceId,
        sub: SubresourceIndex,
        range: Option<Range<u64>>,
    },
}

/// Serializes jobs that target the same destination.
///
/// A lane exists for every destination with work in flight. The first job
/// for a key dispatches immediately and marks the lane busy; later jobs
/// park in the lane's queue. When a worker finishes a job it asks the
/// gate for the next parked job on that lane and runs it inline, so
/// per-destination submission order survives any number of workers.
#[derive(Default)]
pub(crate) struct DestinationGate {
    lanes: Mutex<HashMap<DestinationKey, VecDeque<UploadJob>>>,
}

impl DestinationGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Admits `job` for its destination. Returns the job back when the
    /// lane was idle (the caller dispatches it); otherwise the job is
    /// parked and `None` is returned.
    pub(crate) fn admit(&self, job: UploadJob) -> Option<UploadJob> {
        let mut lanes = self.lanes.lock().unwrap();
        match lanes.get_mut(&job.key) {
            Some(parked) => {
                parked.push_back(job);
                None
            }
            None => {
                lanes.insert(job.key, VecDeque::new());
                Some(job)
            }
        }
    }

    /// Marks the lane's active job finished and returns the next parked
    /// job, if any. The lane disappears once it runs dry.
    pub(crate) fn release(&self, key: DestinationKey) -> Option<UploadJob> {
        let mut lanes = self.lanes.lock().unwrap();
        let parked = lanes.get_mut(&key)?;
        match parked.pop_front() {
            Some(job) => Some(job),
            None => {
                lanes.remove(&key);
                None
            }
        }
    }

    /// Whether any lane has work active or parked.
    pub(crate) fn is_idle(&self) -> bool {
        self.lanes.lock().unwrap().is_empty()
    }
}

/// The body of one upload worker thread.
pub(crate) fn worker_loop(
    shared: Arc<SchedulerShared>,
    receiver: flume::Receiver<WorkerCommand>,
    index: usize,
) {
    log::debug!("Upload worker {index} started");
    while let Ok(command) = receiver.recv() {
        match command {
            WorkerCommand::Execute(job) => {
                let mut next = Some(job);
                while let Some(job) = next.take() {
                    let key = job.key;
                    run_job(&shared, job);
                    next = shared.gate.release(key);
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    log::debug!("Upload worker {index} stopped");
}

fn run_job(shared: &SchedulerShared, job: UploadJob) {
    let id = job.id;
    if let Err(err) = execute_job(shared, job) {
        log::warn!("Transaction {} failed: {err}", id.0);
        shared.fail_transaction(id, err);
    }
}

fn execute_job(shared: &SchedulerShared, job: UploadJob) -> Result<(), TransferError> {
    match job.payload {
        JobPayload::CreateDedicated { desc, packet, pool } => {
            let resource = shared.device.create_resource(&desc)?;
            shared.set_status(job.id, TransactionStatus::Mapped);
            let result = write_direct(shared, resource, &desc, packet.as_ref());
            match result {
                Ok(()) => {
                    shared.publish_dedicated_resource(pool, resource);
                    shared.complete_transaction(job.id);
                    Ok(())
                }
                Err(err) => {
                    // The half-written resource must not become visible.
                    if let Err(destroy_err) = shared.device.destroy_resource(resource) {
                        log::warn!(
                            "Failed to destroy abandoned resource {}: {destroy_err}",
                            resource.0
                        );
                    }
                    Err(err)
                }
            }
        }
        JobPayload::UploadPooled {
            backing,
            offset,
            size,
            packet,
        } => upload_pooled(shared, job.id, backing, offset, size, packet.as_ref()),
        JobPayload::UpdateDedicated {
            resource,
            desc,
            packet,
            region,
        } => update_dedicated(shared, job.id, resource, &desc, packet.as_ref(), region),
        JobPayload::Readback {
            resource,
            sub,
            range,
        } => {
            // Fencing the timeline and waiting on it guarantees every copy
            // submitted into the source before this point, by any worker,
            // has landed.
            let fence = shared.device.submit_and_fence()?;
            shared.device.wait_fence(fence);
            let mut bytes = shared.device.read_back(resource, sub)?;
            if let Some(range) = range {
                let start = range.start.min(bytes.len() as u64) as usize;
                let end = range.end.min(bytes.len() as u64) as usize;
                bytes = bytes[start..end].to_vec();
            }
            shared.stash_readback(job.id, bytes);
            shared.complete_transaction(job.id);
            Ok(())
        }
    }
}

/// Fills every packet-provided subresource of `resource` through direct
/// CPU mapping. Subresources the packet has no data for are skipped.
fn write_direct(
    shared: &SchedulerShared,
    resource: ResourceId,
    desc: &ResourceDescriptor,
    packet: &dyn DataPacket,
) -> Result<(), TransferError> {
    for layer in 0..desc.array_layer_count {
        for mip in 0..desc.mip_level_count {
            let sub = SubresourceIndex::new(mip, layer);
            let Some(bytes) = packet.data(sub) else {
                continue;
            };
            let mapped = map_with_retry(shared, resource, sub, 0)?;
            let written = copy_rows(
                shared,
                &mapped,
                bytes,
                packet.pitches(sub),
                desc.row_size_bytes(mip),
                row_count(desc, mip),
            );
            match written {
                Ok(written) => {
                    shared.device.unmap_after_write(mapped.token)?;
                    shared.metrics.record_uploaded(written);
                }
                Err(err) => {
                    // Best-effort unmap so the resource is not left busy.
                    let _ = shared.device.unmap_after_write(mapped.token);
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

fn upload_pooled(
    shared: &SchedulerShared,
    id: TransactionId,
    backing: ResourceId,
    offset: u64,
    size: u64,
    packet: &dyn DataPacket,
) -> Result<(), TransferError> {
    let data = packet
        .data(SubresourceIndex::WHOLE)
        .ok_or_else(|| {
            TransferError::InvalidDescriptor("packet carries no data for the buffer".into())
        })?;
    let copy_size = size.min(data.len() as u64);

    let staging_desc = ResourceDescriptor::buffer(
        Some("[staging]"),
        shared.config.align_staging(copy_size),
        ResourceUsage::MAP_WRITE | ResourceUsage::COPY_SRC,
    );
    let staging = shared.device.create_resource(&staging_desc)?;
    shared
        .metrics
        .staging_allocations
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    shared.set_status(id, TransactionStatus::Mapped);
    let staged = (|| -> Result<u64, TransferError> {
        let mapped = map_with_retry(shared, staging, SubresourceIndex::WHOLE, 0)?;
        let written = shared
            .device
            .write_mapped(&mapped.token, 0, &data[..copy_size as usize])?;
        shared.device.unmap_after_write(mapped.token)?;
        Ok(written)
    })();

    let written = match staged {
        Ok(written) => written,
        Err(err) => {
            if let Err(destroy_err) = shared.device.destroy_resource(staging) {
                log::warn!(
                    "Failed to destroy staging resource {}: {destroy_err}",
                    staging.0
                );
            }
            return Err(err);
        }
    };

    shared.set_status(id, TransactionStatus::Copying);
    shared.device.copy_region(
        backing,
        SubresourceIndex::WHOLE,
        offset,
        staging,
        SubresourceIndex::WHOLE,
        0,
        written,
    )?;
    let fence = shared.device.submit_and_fence()?;
    shared.metrics.record_uploaded(written);
    shared.completion.register(
        fence,
        vec![
            RetireAction::ReleaseStaging(staging),
            RetireAction::CompleteTransaction(id),
        ],
    );
    Ok(())
}

fn update_dedicated(
    shared: &SchedulerShared,
    id: TransactionId,
    resource: ResourceId,
    desc: &ResourceDescriptor,
    packet: &dyn DataPacket,
    region: Option<RegionBox>,
) -> Result<(), TransferError> {
    // A box covering the whole extent degenerates to a whole update.
    let full_coverage = region.map_or(true, |r| r.is_full(&desc.extent));
    let direct = desc.usage.contains(ResourceUsage::MAP_WRITE)
        || (desc.kind == ResourceKind::Texture && full_coverage);

    match (direct, region) {
        (true, _) => {
            shared.set_status(id, TransactionStatus::Mapped);
            write_direct(shared, resource, desc, packet)?;
            shared.complete_transaction(id);
            Ok(())
        }
        (false, Some(region)) => update_boxed(shared, id, resource, desc, packet, &region),
        // A GPU-only buffer destination: stage the whole range.
        (false, None) => upload_pooled(shared, id, resource, 0, desc.size, packet),
    }
}

/// Boxed texture update through a region-shaped staging texture.
///
/// The box is expressed at mip level 0 and shifted down for every mip
/// the packet carries data for; layers map one to one. Pairs without
/// packet data are skipped.
fn update_boxed(
    shared: &SchedulerShared,
    id: TransactionId,
    resource: ResourceId,
    desc: &ResourceDescriptor,
    packet: &dyn DataPacket,
    region: &RegionBox,
) -> Result<(), TransferError> {
    let staging_desc = desc.staging_descriptor(Some(region));
    let staging = shared.device.create_resource(&staging_desc)?;
    shared
        .metrics
        .staging_allocations
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    shared.set_status(id, TransactionStatus::Mapped);
    let result = (|| -> Result<(), TransferError> {
        let texel_size = desc.format.bytes_per_texel() as u64;

        let mut any_written = false;
        for layer in 0..staging_desc.array_layer_count {
            for mip in 0..staging_desc.mip_level_count {
                let sub = SubresourceIndex::new(mip, layer);
                let Some(bytes) = packet.data(sub) else {
                    continue;
                };
                any_written = true;

                let boxed = region.mip_level(mip);
                let mapped = map_with_retry(shared, staging, sub, 0)?;
                let written = copy_rows(
                    shared,
                    &mapped,
                    bytes,
                    packet.pitches(sub),
                    boxed.extent.width as u64 * texel_size,
                    boxed.extent.height,
                )?;
                shared.device.unmap_after_write(mapped.token)?;
                shared.metrics.record_uploaded(written);
            }
        }
        if !any_written {
            return Err(TransferError::InvalidDescriptor(
                "packet carries no data for the boxed update".into(),
            ));
        }

        shared.set_status(id, TransactionStatus::Copying);
        // A boxed destination is not contiguous; record one copy per row.
        for layer in 0..staging_desc.array_layer_count {
            for mip in 0..staging_desc.mip_level_count {
                let sub = SubresourceIndex::new(mip, layer);
                if packet.data(sub).is_none() {
                    continue;
                }
                let boxed = region.mip_level(mip);
                let region_row = boxed.extent.width as u64 * texel_size;
                let dest_row = desc.row_size_bytes(mip);
                for row in 0..boxed.extent.height {
                    let dst_offset = (boxed.origin.y as u64 + row as u64) * dest_row
                        + boxed.origin.x as u64 * texel_size;
                    let src_offset = row as u64 * region_row;
                    shared.device.copy_region(
                        resource,
                        sub,
                        dst_offset,
                        staging,
                        sub,
                        src_offset,
                        region_row,
                    )?;
                }
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            let fence = shared.device.submit_and_fence()?;
            shared.completion.register(
                fence,
                vec![
                    RetireAction::ReleaseStaging(staging),
                    RetireAction::CompleteTransaction(id),
                ],
            );
            Ok(())
        }
        Err(err) => {
            if let Err(destroy_err) = shared.device.destroy_resource(staging) {
                log::warn!(
                    "Failed to destroy staging resource {}: {destroy_err}",
                    staging.0
                );
            }
            Err(err)
        }
    }
}

/// Maps a subresource, retrying transient device refusals within the
/// configured budget.
fn map_with_retry(
    shared: &SchedulerShared,
    resource: ResourceId,
    sub: SubresourceIndex,
    offset: u64,
) -> Result<MappedRegion, TransferError> {
    let mut attempt = 0u32;
    loop {
        match shared.device.map_for_write(resource, sub, offset) {
            Ok(mapped) => return Ok(mapped),
            Err(TransferError::DeviceUnavailable(reason))
                if attempt < shared.config.map_retry_budget =>
            {
                attempt += 1;
                log::debug!(
                    "Map of resource {} refused (attempt {attempt}/{}): {reason}",
                    resource.0,
                    shared.config.map_retry_budget
                );
                std::thread::sleep(shared.config.map_retry_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Copies `bytes` into an open mapping, row by row when the source and
/// mapped pitches disagree, in one write when they match. Returns the
/// number of payload bytes written.
fn copy_rows(
    shared: &SchedulerShared,
    mapped: &MappedRegion,
    bytes: &[u8],
    source: Pitches,
    row_size: u64,
    rows: u32,
) -> Result<u64, TransferError> {
    let dest = mapped.pitches;
    if source.row_pitch as u64 == row_size && dest.row_pitch as u64 == row_size {
        return shared.device.write_mapped(&mapped.token, 0, bytes);
    }

    let mut total = 0u64;
    for row in 0..rows as u64 {
        let src_start = (row * source.row_pitch as u64) as usize;
        let src_end = (src_start + row_size as usize).min(bytes.len());
        if src_start >= src_end {
            break;
        }
        let dst_offset = row * dest.row_pitch as u64;
        total += shared
            .device
            .write_mapped(&mapped.token, dst_offset, &bytes[src_start..src_end])?;
    }
    Ok(total)
}

fn row_count(desc: &ResourceDescriptor, mip: u32) -> u32 {
    match desc.kind {
        ResourceKind::LinearBuffer => 1,
        ResourceKind::Texture => {
            let extent = desc.mip_extent(mip);
            extent.height * extent.depth_or_array_layers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readback_job(id: u64, key: DestinationKey) -> UploadJob {
        UploadJob {
            id: TransactionId(id),
            key,
            payload: JobPayload::Readback {
                resource: ResourceId(0),
                sub: SubresourceIndex::WHOLE,
                range: None,
            },
        }
    }

    #[test]
    fn gate_dispatches_first_job_and_parks_the_rest() {
        let gate = DestinationGate::new();
        let key = (PoolId(0), 64);

        let first = gate.admit(readback_job(1, key));
        assert!(first.is_some());
        assert!(gate.admit(readback_job(2, key)).is_none());
        assert!(gate.admit(readback_job(3, key)).is_none());

        // Released jobs come back in submission order.
        assert_eq!(gate.release(key).unwrap().id, TransactionId(2));
        assert_eq!(gate.release(key).unwrap().id, TransactionId(3));
        assert!(gate.release(key).is_none());
        assert!(gate.is_idle());
    }

    #[test]
    fn gate_lanes_are_independent() {
        let gate = DestinationGate::new();
        let a = (PoolId(0), 0);
        let b = (PoolId(0), 128);

        assert!(gate.admit(readback_job(1, a)).is_some());
        assert!(gate.admit(readback_job(2, b)).is_some());
        assert!(gate.admit(readback_job(3, a)).is_none());

        assert!(gate.release(b).is_none());
        assert!(!gate.is_idle());
        assert_eq!(gate.release(a).unwrap().id, TransactionId(3));
        assert!(gate.release(a).is_none());
        assert!(gate.is_idle());
    }
}
