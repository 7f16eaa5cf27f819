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

//! Drives online defragmentation of the streaming pool.
//!
//! A pass copies every live block into a freshly created backing resource
//! at its compacted offset, then hands the commit to the completion
//! tracker. Until the copy fence retires the old layout stays
//! authoritative: frees queue up, and new transactions on the pool are
//! refused. The swap to the new backing, the generation bumps, and the
//! remap table all land atomically at commit.

use crate::allocators::{commit_defragmentation, plan_defragmentation, DefragPlan};
use crate::streaming::completion::RetireAction;
use crate::streaming::scheduler::{PoolEntry, SchedulerShared, STREAMING_POOL};
use rheo_core::transfer::api::descriptor::ResourceId;
use rheo_core::transfer::api::locator::{Generation, PoolId, ResourceLocator};
use rheo_core::transfer::api::packet::SubresourceIndex;
use rheo_core::transfer::api::transaction::{TransactionId, TransactionKind, TransactionStatus};
use rheo_core::transfer::error::TransferError;

/// What a requested defragmentation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragOutcome {
    /// The pool is already compact; nothing was copied.
    Idle,
    /// The pass was postponed: transactions are outstanding on the pool,
    /// or a previous pass has not committed yet. Ask again later.
    Deferred,
    /// Copies were submitted; the layout swaps when their fence retires.
    Started {
        /// The transaction tracking the pass; poll it to observe the
        /// commit.
        transaction: TransactionId,
        /// The number of blocks changing address.
        relocations: usize,
        /// The number of bytes belonging to relocated blocks.
        bytes: u64,
    },
}

/// Plans and submits a defragmentation pass over the streaming pool.
pub(crate) fn start_streaming_defrag(
    shared: &SchedulerShared,
) -> Result<DefragOutcome, TransferError> {
    let mut pools = shared.pools.lock().unwrap();
    let entry = pools.managed_mut(STREAMING_POOL)?;

    if entry.defrag_in_flight {
        log::debug!("Defragmentation deferred: a pass is already in flight");
        return Ok(DefragOutcome::Deferred);
    }
    if entry.outstanding_transactions > 0 {
        log::debug!(
            "Defragmentation deferred: {} transactions outstanding on the pool",
            entry.outstanding_transactions
        );
        return Ok(DefragOutcome::Deferred);
    }

    let plan = plan_defragmentation(&entry.allocator, |_, _| false);
    if plan.is_noop() {
        return Ok(DefragOutcome::Idle);
    }
    let relocations = plan.relocations();
    let bytes = plan.bytes_relocated();

    let new_backing = shared
        .device
        .create_resource(&SchedulerShared::backing_descriptor(
            entry.allocator.capacity(),
        ))?;
    let copied = (|| -> Result<(), TransferError> {
        for step in &plan.moves {
            shared.device.copy_region(
                new_backing,
                SubresourceIndex::WHOLE,
                step.destination_offset,
                entry.backing,
                SubresourceIndex::WHOLE,
                step.source_offset,
                step.size,
            )?;
        }
        Ok(())
    })();
    if let Err(err) = copied {
        if let Err(destroy_err) = shared.device.destroy_resource(new_backing) {
            log::warn!(
                "Failed to destroy abandoned backing resource {}: {destroy_err}",
                new_backing.0
            );
        }
        return Err(err);
    }

    let fence = shared.device.submit_and_fence()?;
    entry.defrag_in_flight = true;
    let old_backing = entry.backing;
    let pool = entry.allocator.id();
    let capacity = entry.allocator.capacity();
    drop(pools);

    let transaction = shared.register_transaction(
        TransactionKind::DefragCopy,
        ResourceLocator {
            pool,
            offset: 0,
            size: capacity,
            generation: Generation::FIRST,
        },
    );
    shared.set_status(transaction, TransactionStatus::Copying);

    log::info!(
        "Defragmentation pass started: {relocations} blocks ({bytes} bytes) relocating, fence {}",
        fence.0
    );
    shared.completion.register(
        fence,
        vec![RetireAction::CommitDefrag {
            pool,
            plan,
            transaction,
            old_backing,
            new_backing,
        }],
    );
    Ok(DefragOutcome::Started {
        transaction,
        relocations,
        bytes,
    })
}

/// Applies a retired [`RetireAction::CommitDefrag`].
pub(crate) fn commit_streaming_defrag(
    shared: &SchedulerShared,
    pool: PoolId,
    plan: DefragPlan,
    transaction: TransactionId,
    old_backing: ResourceId,
    new_backing: ResourceId,
) {
    let committed = {
        let mut pools = shared.pools.lock().unwrap();
        let entry = match pools.entry_mut(pool) {
            Some(PoolEntry::Managed(entry)) => entry,
            _ => {
                log::error!("Defragmentation commit targets unknown pool {}", pool.0);
                return;
            }
        };

        match commit_defragmentation(&mut entry.allocator, &plan) {
            Ok(remaps) => {
                for (old, new) in remaps {
                    entry
                        .remaps
                        .insert((old.offset, old.generation), new);
                }
                entry.backing = new_backing;
                entry.defrag_in_flight = false;

                // Frees that arrived mid-pass named pre-move locators;
                // remap them onto the new layout before returning the
                // space.
                let deferred = std::mem::take(&mut entry.pending_frees);
                for locator in deferred {
                    let resolved = entry
                        .remaps
                        .get(&(locator.offset, locator.generation))
                        .copied()
                        .unwrap_or(locator);
                    if let Err(err) = entry.allocator.free(&resolved) {
                        log::warn!(
                            "Deferred free of offset {} failed after defragmentation: {err}",
                            locator.offset
                        );
                    }
                }
                Ok(())
            }
            Err(err) => {
                // Allocations were refused for the whole pass, so a
                // commit failure means internal state corruption. Keep
                // the old layout and surface the problem loudly.
                entry.defrag_in_flight = false;
                Err(err)
            }
        }
    };

    match committed {
        Ok(()) => {
            let bytes = plan.bytes_relocated();
            if let Err(err) = shared.device.destroy_resource(old_backing) {
                log::warn!(
                    "Failed to destroy old backing resource {}: {err}",
                    old_backing.0
                );
            }
            shared
                .metrics
                .defrag_passes
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            shared
                .metrics
                .defrag_bytes_moved
                .fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
            shared.complete_transaction(transaction);
            log::info!("Defragmentation pass committed: {bytes} bytes relocated");
        }
        Err(err) => {
            log::error!("Defragmentation commit rejected: {err}");
            if let Err(destroy_err) = shared.device.destroy_resource(new_backing) {
                log::warn!(
                    "Failed to destroy abandoned backing resource {}: {destroy_err}",
                    new_backing.0
                );
            }
            shared.fail_transaction(transaction, err);
        }
    }
}
