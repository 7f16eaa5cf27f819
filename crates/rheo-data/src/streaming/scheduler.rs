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

//! The front end of the transfer pipeline.
//!
//! [`TransferScheduler`] is the producer-side API: submit a transfer, get
//! a [`TransactionId`] back immediately, and poll it each frame until it
//! reports [`PollStatus::Ready`] or [`PollStatus::Failed`]. All device
//! traffic happens on background worker threads; the submit and poll
//! calls themselves never map, copy, or wait.

use crate::allocators::PoolAllocator;
use crate::streaming::completion::{CompletionTracker, RetireAction};
use crate::streaming::defrag::{commit_streaming_defrag, start_streaming_defrag, DefragOutcome};
use crate::streaming::worker::{
    worker_loop, DestinationGate, DestinationKey, JobPayload, UploadJob, WorkerCommand,
};
use rheo_core::transfer::api::descriptor::{
    RegionBox, ResourceDescriptor, ResourceId, ResourceKind, ResourceUsage,
};
use rheo_core::transfer::api::locator::{Generation, PoolId, ResourceLocator};
use rheo_core::transfer::api::packet::{DataPacket, SubresourceIndex};
use rheo_core::transfer::api::transaction::{
    PollStatus, TransactionId, TransactionKind, TransactionStatus,
};
use rheo_core::transfer::config::TransferConfig;
use rheo_core::transfer::error::TransferError;
use rheo_core::transfer::metrics::{TransferMetrics, TransferMetricsSnapshot};
use rheo_core::transfer::traits::UploadContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// The pool that sub-allocates GPU-only linear buffers.
pub(crate) const STREAMING_POOL: PoolId = PoolId(0);

/// A managed arena: many allocations share one backing buffer.
pub(crate) struct ManagedPool {
    pub allocator: PoolAllocator,
    pub backing: ResourceId,
    /// Transactions targeting the pool, reads included, that have not
    /// reached a terminal state. Defragmentation only starts at zero.
    pub outstanding_transactions: usize,
    pub defrag_in_flight: bool,
    /// Frees that arrived while a pass was in flight; applied at commit.
    pub pending_frees: Vec<ResourceLocator>,
    /// Old locator identity to new locator, for every block a committed
    /// pass has relocated.
    pub remaps: HashMap<(u64, Generation), ResourceLocator>,
}

/// A destination that owns a whole backend resource (textures, and
/// CPU-mappable buffers). Lives in the pool namespace so every completed
/// transfer resolves to a [`ResourceLocator`] the same way.
pub(crate) struct DedicatedEntry {
    /// Filled in by the worker once the backend resource exists.
    pub resource: Option<ResourceId>,
    pub desc: ResourceDescriptor,
    pub generation: Generation,
}

pub(crate) enum PoolEntry {
    Managed(ManagedPool),
    Dedicated(DedicatedEntry),
}

/// All destinations the scheduler knows about, keyed by pool id.
pub(crate) struct PoolTable {
    entries: HashMap<PoolId, PoolEntry>,
    next_pool: usize,
}

impl PoolTable {
    fn new(streaming: ManagedPool) -> Self {
        let mut entries = HashMap::new();
        entries.insert(STREAMING_POOL, PoolEntry::Managed(streaming));
        Self {
            entries,
            next_pool: STREAMING_POOL.0 + 1,
        }
    }

    pub(crate) fn entry(&self, pool: PoolId) -> Option<&PoolEntry> {
        self.entries.get(&pool)
    }

    pub(crate) fn entry_mut(&mut self, pool: PoolId) -> Option<&mut PoolEntry> {
        self.entries.get_mut(&pool)
    }

    pub(crate) fn managed_mut(&mut self, pool: PoolId) -> Result<&mut ManagedPool, TransferError> {
        match self.entries.get_mut(&pool) {
            Some(PoolEntry::Managed(entry)) => Ok(entry),
            _ => Err(TransferError::InvalidDescriptor(format!(
                "pool {} is not a managed arena",
                pool.0
            ))),
        }
    }

    fn register_dedicated(&mut self, desc: ResourceDescriptor) -> PoolId {
        let pool = PoolId(self.next_pool);
        self.next_pool += 1;
        self.entries.insert(
            pool,
            PoolEntry::Dedicated(DedicatedEntry {
                resource: None,
                desc,
                generation: Generation::FIRST,
            }),
        );
        pool
    }

    fn remove(&mut self, pool: PoolId) -> Option<PoolEntry> {
        self.entries.remove(&pool)
    }

    fn iter(&self) -> impl Iterator<Item = (&PoolId, &PoolEntry)> {
        self.entries.iter()
    }
}

/// Checks a locator against a managed pool, upgrading the error for
/// blocks a committed defragmentation pass has relocated: those report
/// [`TransferError::StaleLocator`] carrying the block's new generation,
/// which callers can resolve through the remap table.
fn verify_pooled(entry: &ManagedPool, locator: &ResourceLocator) -> Result<(), TransferError> {
    match entry.allocator.verify(locator) {
        Ok(()) => Ok(()),
        Err(err) => match entry.remaps.get(&(locator.offset, locator.generation)) {
            Some(new) => Err(TransferError::StaleLocator {
                expected: new.generation,
                found: locator.generation,
            }),
            None => Err(err),
        },
    }
}

/// One submitted transfer, tracked until its result is retrieved.
struct TransactionRecord {
    kind: TransactionKind,
    status: TransactionStatus,
    locator: ResourceLocator,
    holds_pool_slot: bool,
}

/// State shared between the scheduler handle, the workers, and the
/// completion path.
pub(crate) struct SchedulerShared {
    pub(crate) device: Arc<dyn UploadContext>,
    pub(crate) config: TransferConfig,
    pub(crate) pools: Mutex<PoolTable>,
    pub(crate) completion: CompletionTracker,
    pub(crate) metrics: TransferMetrics,
    pub(crate) gate: DestinationGate,
    transactions: Mutex<HashMap<TransactionId, TransactionRecord>>,
    readbacks: Mutex<HashMap<TransactionId, Vec<u8>>>,
    next_transaction: AtomicU64,
}

impl SchedulerShared {
    /// The descriptor of a managed pool's backing buffer.
    pub(crate) fn backing_descriptor(capacity: u64) -> ResourceDescriptor {
        ResourceDescriptor::buffer(
            Some("streaming pool"),
            capacity,
            ResourceUsage::COPY_SRC | ResourceUsage::COPY_DST,
        )
    }

    fn next_transaction_id(&self) -> TransactionId {
        TransactionId(self.next_transaction.fetch_add(1, Ordering::Relaxed))
    }

    /// Tracks a transaction that is not dispatched through the worker
    /// channel, such as a defragmentation pass.
    pub(crate) fn register_transaction(
        &self,
        kind: TransactionKind,
        locator: ResourceLocator,
    ) -> TransactionId {
        let id = self.next_transaction_id();
        self.transactions.lock().unwrap().insert(
            id,
            TransactionRecord {
                kind,
                status: TransactionStatus::Pending,
                locator,
                holds_pool_slot: false,
            },
        );
        self.metrics
            .transactions_submitted
            .fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Runs every retire action whose fence has completed.
    pub(crate) fn drive_completions(&self) {
        let device = &self.device;
        let actions = self
            .completion
            .take_retired(|fence| device.is_fence_complete(fence));
        for action in actions {
            match action {
                RetireAction::CompleteTransaction(id) => self.complete_transaction(id),
                RetireAction::ReleaseStaging(resource) => {
                    if let Err(err) = self.device.destroy_resource(resource) {
                        log::warn!(
                            "Failed to release staging resource {}: {err}",
                            resource.0
                        );
                    }
                    self.metrics.staging_released.fetch_add(1, Ordering::Relaxed);
                }
                RetireAction::CommitDefrag {
                    pool,
                    plan,
                    transaction,
                    old_backing,
                    new_backing,
                } => commit_streaming_defrag(self, pool, plan, transaction, old_backing, new_backing),
            }
        }
    }

    pub(crate) fn set_status(&self, id: TransactionId, status: TransactionStatus) {
        let mut transactions = self.transactions.lock().unwrap();
        if let Some(record) = transactions.get_mut(&id) {
            record.status = status;
        }
    }

    /// Marks a transaction completed and releases its pool slot.
    pub(crate) fn complete_transaction(&self, id: TransactionId) {
        let holds_pool_slot = {
            let mut transactions = self.transactions.lock().unwrap();
            match transactions.get_mut(&id) {
                Some(record) => {
                    record.status = TransactionStatus::Completed;
                    record.holds_pool_slot
                }
                None => return,
            }
        };
        self.metrics
            .transactions_completed
            .fetch_add(1, Ordering::Relaxed);
        if holds_pool_slot {
            self.release_pool_slot();
        }
    }

    /// Marks a transaction failed, releasing its pool slot and, for a
    /// failed create, its pool allocation.
    pub(crate) fn fail_transaction(&self, id: TransactionId, err: TransferError) {
        let info = {
            let mut transactions = self.transactions.lock().unwrap();
            match transactions.get_mut(&id) {
                Some(record) => {
                    let info = (record.kind, record.locator, record.holds_pool_slot);
                    record.status = TransactionStatus::Failed(err);
                    info
                }
                None => return,
            }
        };
        let (kind, locator, holds_pool_slot) = info;
        self.metrics
            .transactions_failed
            .fetch_add(1, Ordering::Relaxed);
        if holds_pool_slot {
            self.release_pool_slot();
        }

        // Updates and readbacks leave their destination alone; a failed
        // create reclaims the destination it was going to fill.
        if kind != TransactionKind::Create {
            return;
        }
        let mut pools = self.pools.lock().unwrap();
        if holds_pool_slot {
            if let Ok(entry) = pools.managed_mut(locator.pool) {
                if entry.defrag_in_flight {
                    entry.pending_frees.push(locator);
                } else if let Err(free_err) = entry.allocator.free(&locator) {
                    log::warn!(
                        "Failed to reclaim allocation of failed transaction {}: {free_err}",
                        id.0
                    );
                }
            }
        } else {
            // The worker already destroyed any half-created resource.
            pools.remove(locator.pool);
        }
    }

    fn release_pool_slot(&self) {
        let mut pools = self.pools.lock().unwrap();
        if let Ok(entry) = pools.managed_mut(STREAMING_POOL) {
            entry.outstanding_transactions = entry.outstanding_transactions.saturating_sub(1);
        }
    }

    /// Records the backend resource a worker created for a dedicated
    /// destination.
    pub(crate) fn publish_dedicated_resource(&self, pool: PoolId, resource: ResourceId) {
        let mut pools = self.pools.lock().unwrap();
        if let Some(PoolEntry::Dedicated(entry)) = pools.entry_mut(pool) {
            entry.resource = Some(resource);
        }
    }

    /// Stores readback bytes for retrieval via `take_readback`.
    pub(crate) fn stash_readback(&self, id: TransactionId, bytes: Vec<u8>) {
        self.readbacks.lock().unwrap().insert(id, bytes);
    }
}

/// The producer-side handle to the upload pipeline.
///
/// Owns the worker threads; dropping the scheduler shuts them down after
/// they finish the jobs already accepted.
pub struct TransferScheduler {
    shared: Arc<SchedulerShared>,
    sender: flume::Sender<WorkerCommand>,
    workers: Vec<JoinHandle<()>>,
}

impl TransferScheduler {
    /// Creates a scheduler over `device`, allocating the streaming pool's
    /// backing buffer and spawning the upload workers.
    pub fn new(
        device: Arc<dyn UploadContext>,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        let backing =
            device.create_resource(&SchedulerShared::backing_descriptor(
                config.streaming_pool_capacity,
            ))?;
        let streaming = ManagedPool {
            allocator: PoolAllocator::new(STREAMING_POOL, config.streaming_pool_capacity),
            backing,
            outstanding_transactions: 0,
            defrag_in_flight: false,
            pending_frees: Vec::new(),
            remaps: HashMap::new(),
        };

        let (sender, receiver) = flume::unbounded();
        let shared = Arc::new(SchedulerShared {
            device,
            config: config.clone(),
            pools: Mutex::new(PoolTable::new(streaming)),
            completion: CompletionTracker::new(),
            metrics: TransferMetrics::default(),
            gate: DestinationGate::new(),
            transactions: Mutex::new(HashMap::new()),
            readbacks: Mutex::new(HashMap::new()),
            next_transaction: AtomicU64::new(1),
        });

        let worker_count = config.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = Arc::clone(&shared);
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rheo-upload-{index}"))
                .spawn(move || worker_loop(shared, receiver, index))
                .map_err(|err| {
                    TransferError::DeviceUnavailable(format!(
                        "failed to spawn upload worker: {err}"
                    ))
                })?;
            workers.push(handle);
        }
        log::info!(
            "Transfer scheduler started: {worker_count} workers, {} byte streaming pool",
            config.streaming_pool_capacity
        );

        Ok(Self {
            shared,
            sender,
            workers,
        })
    }

    /// Submits a create-and-fill transfer.
    ///
    /// GPU-only linear buffers are sub-allocated from the streaming pool;
    /// textures and CPU-mappable buffers get a dedicated resource. The
    /// destination becomes addressable through the locator that
    /// [`TransferScheduler::poll`] reports once the transfer completes.
    pub fn create(
        &self,
        desc: ResourceDescriptor,
        packet: Arc<dyn DataPacket>,
    ) -> Result<TransactionId, TransferError> {
        desc.validate()?;
        let pooled = desc.kind == ResourceKind::LinearBuffer
            && !desc.usage.contains(ResourceUsage::MAP_WRITE);

        let (locator, key, payload) = if pooled {
            let mut pools = self.shared.pools.lock().unwrap();
            let entry = pools.managed_mut(STREAMING_POOL)?;
            if entry.defrag_in_flight {
                return Err(TransferError::OutOfSpace {
                    requested: desc.size,
                    largest_free: entry.allocator.largest_free(),
                });
            }
            let locator = entry.allocator.allocate(desc.size)?;
            entry.outstanding_transactions += 1;
            let key: DestinationKey = (STREAMING_POOL, locator.offset);
            let payload = JobPayload::UploadPooled {
                backing: entry.backing,
                offset: locator.offset,
                size: locator.size,
                packet,
            };
            (locator, key, payload)
        } else {
            let mut pools = self.shared.pools.lock().unwrap();
            let size = desc.total_size_bytes();
            let pool = pools.register_dedicated(desc.clone());
            let locator = ResourceLocator {
                pool,
                offset: 0,
                size,
                generation: Generation::FIRST,
            };
            let key: DestinationKey = (pool, 0);
            let payload = JobPayload::CreateDedicated { desc, packet, pool };
            (locator, key, payload)
        };

        self.submit(TransactionKind::Create, locator, pooled, key, payload)
    }

    /// Submits an update of an existing destination.
    ///
    /// `region` restricts a texture update to a box at mip level 0; pass
    /// `None` to rewrite the destination wholesale. Updates to one
    /// destination are applied in submission order.
    pub fn update(
        &self,
        locator: &ResourceLocator,
        packet: Arc<dyn DataPacket>,
        region: Option<RegionBox>,
    ) -> Result<TransactionId, TransferError> {
        let (holds_pool_slot, key, payload) = {
            let mut pools = self.shared.pools.lock().unwrap();
            match pools.entry_mut(locator.pool) {
                Some(PoolEntry::Managed(entry)) => {
                    verify_pooled(entry, locator)?;
                    if region.is_some() {
                        return Err(TransferError::InvalidDescriptor(
                            "region boxes apply to textures, not pooled buffers".into(),
                        ));
                    }
                    if entry.defrag_in_flight {
                        // A write submitted now would land in the backing
                        // resource the pass is abandoning.
                        return Err(TransferError::DeviceUnavailable(
                            "pool is defragmenting; resubmit after the pass commits".into(),
                        ));
                    }
                    entry.outstanding_transactions += 1;
                    let payload = JobPayload::UploadPooled {
                        backing: entry.backing,
                        offset: locator.offset,
                        size: locator.size,
                        packet,
                    };
                    (true, (locator.pool, locator.offset), payload)
                }
                Some(PoolEntry::Dedicated(entry)) => {
                    if entry.generation != locator.generation {
                        return Err(TransferError::StaleLocator {
                            expected: entry.generation,
                            found: locator.generation,
                        });
                    }
                    let resource = entry.resource.ok_or_else(|| {
                        TransferError::InvalidDescriptor(
                            "destination resource has not finished creating".into(),
                        )
                    })?;
                    if let Some(region) = &region {
                        region.validate_against(&entry.desc)?;
                    }
                    let payload = JobPayload::UpdateDedicated {
                        resource,
                        desc: entry.desc.clone(),
                        packet,
                        region,
                    };
                    (false, (locator.pool, 0), payload)
                }
                None => {
                    return Err(TransferError::InvalidDescriptor(format!(
                        "unknown pool {}",
                        locator.pool.0
                    )))
                }
            }
        };

        self.submit(
            TransactionKind::UpdateRegion,
            *locator,
            holds_pool_slot,
            key,
            payload,
        )
    }

    /// Submits an asynchronous readback of a destination.
    ///
    /// Poll the returned transaction; once it reports `Ready`, retrieve
    /// the bytes with [`TransferScheduler::take_readback`]. Pooled
    /// readbacks hold the pool open: a defragmentation pass will not
    /// start until they retire, so the bytes always come from the backing
    /// the locator was issued against.
    pub fn read_back(
        &self,
        locator: &ResourceLocator,
        sub: SubresourceIndex,
    ) -> Result<TransactionId, TransferError> {
        let (holds_pool_slot, key, payload) = {
            let mut pools = self.shared.pools.lock().unwrap();
            match pools.entry_mut(locator.pool) {
                Some(PoolEntry::Managed(entry)) => {
                    verify_pooled(entry, locator)?;
                    if entry.defrag_in_flight {
                        // The bytes would come from a backing resource the
                        // pass is abandoning.
                        return Err(TransferError::DeviceUnavailable(
                            "pool is defragmenting; resubmit after the pass commits".into(),
                        ));
                    }
                    entry.outstanding_transactions += 1;
                    let payload = JobPayload::Readback {
                        resource: entry.backing,
                        sub: SubresourceIndex::WHOLE,
                        range: Some(locator.offset..locator.end()),
                    };
                    (true, (locator.pool, locator.offset), payload)
                }
                Some(PoolEntry::Dedicated(entry)) => {
                    if entry.generation != locator.generation {
                        return Err(TransferError::StaleLocator {
                            expected: entry.generation,
                            found: locator.generation,
                        });
                    }
                    let resource = entry.resource.ok_or_else(|| {
                        TransferError::InvalidDescriptor(
                            "destination resource has not finished creating".into(),
                        )
                    })?;
                    let payload = JobPayload::Readback {
                        resource,
                        sub,
                        range: None,
                    };
                    (false, (locator.pool, 0), payload)
                }
                None => {
                    return Err(TransferError::InvalidDescriptor(format!(
                        "unknown pool {}",
                        locator.pool.0
                    )))
                }
            }
        };

        self.submit(TransactionKind::Readback, *locator, holds_pool_slot, key, payload)
    }

    /// Non-blocking progress query. A `Ready` or `Failed` answer retires
    /// the transaction; polling it again reports `UnknownTransaction`.
    pub fn poll(&self, id: TransactionId) -> PollStatus {
        self.shared.drive_completions();
        let mut transactions = self.shared.transactions.lock().unwrap();
        let Some(record) = transactions.remove(&id) else {
            return PollStatus::Failed(TransferError::UnknownTransaction(id));
        };
        match record.status {
            TransactionStatus::Completed => PollStatus::Ready(record.locator),
            TransactionStatus::Failed(err) => PollStatus::Failed(err),
            _ => {
                transactions.insert(id, record);
                PollStatus::Pending
            }
        }
    }

    /// Retrieves the bytes of a completed readback transaction.
    pub fn take_readback(&self, id: TransactionId) -> Option<Vec<u8>> {
        self.shared.readbacks.lock().unwrap().remove(&id)
    }

    /// Reserves raw space in the streaming pool without uploading.
    pub fn allocate(&self, size: u64) -> Result<ResourceLocator, TransferError> {
        let mut pools = self.shared.pools.lock().unwrap();
        let entry = pools.managed_mut(STREAMING_POOL)?;
        if entry.defrag_in_flight {
            return Err(TransferError::OutOfSpace {
                requested: size,
                largest_free: entry.allocator.largest_free(),
            });
        }
        entry.allocator.allocate(size)
    }

    /// Releases a destination.
    ///
    /// Pool allocations return to the free list (deferred to commit time
    /// while a defragmentation pass is in flight); dedicated resources
    /// are destroyed.
    pub fn free(&self, locator: &ResourceLocator) -> Result<(), TransferError> {
        let mut pools = self.shared.pools.lock().unwrap();
        match pools.entry_mut(locator.pool) {
            Some(PoolEntry::Managed(entry)) => {
                verify_pooled(entry, locator)?;
                if entry.defrag_in_flight {
                    entry.pending_frees.push(*locator);
                    Ok(())
                } else {
                    entry.allocator.free(locator)
                }
            }
            Some(PoolEntry::Dedicated(entry)) => {
                if entry.generation != locator.generation {
                    return Err(TransferError::StaleLocator {
                        expected: entry.generation,
                        found: locator.generation,
                    });
                }
                let resource = entry.resource;
                pools.remove(locator.pool);
                if let Some(resource) = resource {
                    self.shared.device.destroy_resource(resource)?;
                }
                Ok(())
            }
            None => Err(TransferError::InvalidDescriptor(format!(
                "unknown pool {}",
                locator.pool.0
            ))),
        }
    }

    /// Compacts the streaming pool if it is quiescent.
    ///
    /// Returns [`DefragOutcome::Deferred`] while transactions on the pool
    /// are outstanding or a previous pass has not committed; call again
    /// after polling those transactions to completion.
    pub fn run_defragmentation(&self) -> Result<DefragOutcome, TransferError> {
        self.shared.drive_completions();
        start_streaming_defrag(&self.shared)
    }

    /// Resolves a locator invalidated by defragmentation to its current
    /// replacement, if the block still exists.
    pub fn resolve_relocated(&self, old: &ResourceLocator) -> Option<ResourceLocator> {
        let pools = self.shared.pools.lock().unwrap();
        match pools.entry(old.pool) {
            Some(PoolEntry::Managed(entry)) => {
                entry.remaps.get(&(old.offset, old.generation)).copied()
            }
            _ => None,
        }
    }

    /// Blocks until every accepted transfer has reached a terminal state
    /// and all deferred retirement work has run.
    pub fn flush(&self) {
        loop {
            self.shared.drive_completions();

            let workers_busy = !self.shared.gate.is_idle();
            let transactions_busy = {
                let transactions = self.shared.transactions.lock().unwrap();
                transactions.values().any(|record| {
                    !matches!(
                        record.status,
                        TransactionStatus::Completed | TransactionStatus::Failed(_)
                    )
                })
            };
            let completions_busy = !self.shared.completion.is_idle();
            if !workers_busy && !transactions_busy && !completions_busy {
                return;
            }

            if let Some(fence) = self.shared.completion.highest_pending() {
                self.shared.device.wait_fence(fence);
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
    }

    /// A point-in-time snapshot of pipeline counters and pool utilization.
    pub fn metrics(&self) -> TransferMetricsSnapshot {
        let mut snapshot = TransferMetricsSnapshot::from_counters(&self.shared.metrics);
        let pools = self.shared.pools.lock().unwrap();
        for (id, entry) in pools.iter() {
            if let PoolEntry::Managed(entry) = entry {
                snapshot.pools.push((id.0, entry.allocator.metrics()));
            }
        }
        snapshot.pools.sort_by_key(|(id, _)| *id);
        snapshot
    }

    fn submit(
        &self,
        kind: TransactionKind,
        locator: ResourceLocator,
        holds_pool_slot: bool,
        key: DestinationKey,
        payload: JobPayload,
    ) -> Result<TransactionId, TransferError> {
        let id = self.shared.next_transaction_id();
        {
            let mut transactions = self.shared.transactions.lock().unwrap();
            transactions.insert(
                id,
                TransactionRecord {
                    kind,
                    status: TransactionStatus::Pending,
                    locator,
                    holds_pool_slot,
                },
            );
        }
        self.shared
            .metrics
            .transactions_submitted
            .fetch_add(1, Ordering::Relaxed);

        let job = UploadJob { id, key, payload };
        if let Some(job) = self.shared.gate.admit(job) {
            self.sender
                .send(WorkerCommand::Execute(job))
                .map_err(|_| TransferError::Disconnected)?;
        }
        log::trace!("Submitted transaction {} ({kind:?})", id.0);
        Ok(id)
    }
}

impl Drop for TransferScheduler {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(WorkerCommand::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("An upload worker panicked during shutdown");
            }
        }
        self.shared.drive_completions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_table_assigns_distinct_dedicated_ids() {
        let streaming = ManagedPool {
            allocator: PoolAllocator::new(STREAMING_POOL, 1024),
            backing: ResourceId(0),
            outstanding_transactions: 0,
            defrag_in_flight: false,
            pending_frees: Vec::new(),
            remaps: HashMap::new(),
        };
        let mut table = PoolTable::new(streaming);
        let desc = ResourceDescriptor::buffer(None, 64, ResourceUsage::MAP_WRITE);

        let a = table.register_dedicated(desc.clone());
        let b = table.register_dedicated(desc);
        assert_ne!(a, b);
        assert_ne!(a, STREAMING_POOL);
        assert!(matches!(table.entry(a), Some(PoolEntry::Dedicated(_))));
        assert!(table.managed_mut(a).is_err());
        assert!(table.managed_mut(STREAMING_POOL).is_ok());
    }
}
