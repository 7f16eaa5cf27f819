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

//! Fence-ordered retirement of deferred pipeline work.

use crate::allocators::DefragPlan;
use rheo_core::transfer::api::descriptor::ResourceId;
use rheo_core::transfer::api::fence::FenceValue;
use rheo_core::transfer::api::locator::PoolId;
use rheo_core::transfer::api::transaction::TransactionId;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Work to perform once a fence retires.
#[derive(Debug)]
pub(crate) enum RetireAction {
    /// Mark a transaction completed and make its result pollable.
    CompleteTransaction(TransactionId),
    /// Destroy a staging resource whose copy has landed.
    ReleaseStaging(ResourceId),
    /// Swap a pool onto its compacted backing resource.
    CommitDefrag {
        /// The pool being defragmented.
        pool: PoolId,
        /// The plan whose copies the fence covers.
        plan: DefragPlan,
        /// The transaction tracking the pass.
        transaction: TransactionId,
        /// The backing resource being abandoned.
        old_backing: ResourceId,
        /// The freshly written backing resource.
        new_backing: ResourceId,
    },
}

/// Associates deferred actions with the fence that gates them.
///
/// Workers and the defragmentation driver register actions against the
/// fence returned by their command submission; the scheduler drains
/// retired actions on every poll and flush. Actions retire in fence
/// order, which matches device submission order, so a staging release is
/// never processed before the copy that reads from it.
#[derive(Debug, Default)]
pub(crate) struct CompletionTracker {
    pending: Mutex<BTreeMap<FenceValue, Vec<RetireAction>>>,
}

impl CompletionTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `actions` to run once `fence` completes.
    pub(crate) fn register(&self, fence: FenceValue, actions: Vec<RetireAction>) {
        if actions.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        pending.entry(fence).or_default().extend(actions);
    }

    /// Removes and returns the actions of every retired fence, in fence
    /// order. `is_complete` is queried once per distinct fence.
    pub(crate) fn take_retired<F>(&self, is_complete: F) -> Vec<RetireAction>
    where
        F: Fn(FenceValue) -> bool,
    {
        let mut pending = self.pending.lock().unwrap();
        let retired_fences: Vec<FenceValue> = pending
            .keys()
            .take_while(|fence| is_complete(**fence))
            .copied()
            .collect();
        let mut actions = Vec::new();
        for fence in retired_fences {
            if let Some(batch) = pending.remove(&fence) {
                actions.extend(batch);
            }
        }
        actions
    }

    /// The highest fence with actions still outstanding.
    pub(crate) fn highest_pending(&self) -> Option<FenceValue> {
        self.pending.lock().unwrap().keys().next_back().copied()
    }

    /// Whether any actions are outstanding.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retires_in_fence_order_up_to_the_timeline() {
        let tracker = CompletionTracker::new();
        tracker.register(
            FenceValue(2),
            vec![RetireAction::ReleaseStaging(ResourceId(2))],
        );
        tracker.register(
            FenceValue(1),
            vec![RetireAction::CompleteTransaction(TransactionId(1))],
        );
        tracker.register(
            FenceValue(3),
            vec![RetireAction::CompleteTransaction(TransactionId(3))],
        );

        let retired = tracker.take_retired(|fence| fence <= FenceValue(2));
        assert_eq!(retired.len(), 2);
        assert!(matches!(
            retired[0],
            RetireAction::CompleteTransaction(TransactionId(1))
        ));
        assert!(matches!(
            retired[1],
            RetireAction::ReleaseStaging(ResourceId(2))
        ));

        assert!(!tracker.is_idle());
        assert_eq!(tracker.highest_pending(), Some(FenceValue(3)));

        let rest = tracker.take_retired(|_| true);
        assert_eq!(rest.len(), 1);
        assert!(tracker.is_idle());
    }

    #[test]
    fn stops_at_the_first_incomplete_fence() {
        let tracker = CompletionTracker::new();
        tracker.register(
            FenceValue(1),
            vec![RetireAction::CompleteTransaction(TransactionId(1))],
        );
        tracker.register(
            FenceValue(2),
            vec![RetireAction::CompleteTransaction(TransactionId(2))],
        );

        // Fence 1 incomplete: nothing retires even if fence 2 somehow
        // reported complete, because retirement is a prefix scan.
        let retired = tracker.take_retired(|fence| fence == FenceValue(2));
        assert!(retired.is_empty());
    }

    #[test]
    fn merges_actions_registered_against_one_fence() {
        let tracker = CompletionTracker::new();
        tracker.register(
            FenceValue(1),
            vec![RetireAction::ReleaseStaging(ResourceId(9))],
        );
        tracker.register(
            FenceValue(1),
            vec![RetireAction::CompleteTransaction(TransactionId(4))],
        );

        let retired = tracker.take_retired(|_| true);
        assert_eq!(retired.len(), 2);
    }
}
