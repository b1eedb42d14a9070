// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use moraine_core::OperationId;
use protocols::{Operation, OperationState, OperationStatus};
use std::collections::HashMap;
use tracing::debug;

/// Tracks resource operations by uuid until their terminal status is
/// acknowledged. Speculative operations pass through briefly: applied,
/// reported finished, and dropped. Non-speculative operations stay pending
/// until the resource provider reports back.
#[derive(Debug, Default)]
pub struct OperationTracker {
    operations: HashMap<OperationId, Operation>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, operation: Operation) {
        assert!(
            !self.operations.contains_key(&operation.operation_id),
            "operation {} tracked twice",
            operation.operation_id
        );
        debug!(operation = %operation.operation_id, "Tracking operation");
        self.operations
            .insert(operation.operation_id, operation);
    }

    pub fn get(&self, operation_id: &OperationId) -> Option<&Operation> {
        self.operations.get(operation_id)
    }

    pub fn record_status(&mut self, status: OperationStatus) -> Option<&Operation> {
        let operation = self.operations.get_mut(&status.operation_id)?;
        operation.record_status(status);
        Some(operation)
    }

    /// Removes an operation once the acknowledgement for a terminal status
    /// arrives. Unknown ids are tolerated: a duplicate ack races removal.
    pub fn acknowledge(&mut self, operation_id: &OperationId) -> Option<Operation> {
        let operation = self.operations.get(operation_id)?;
        if !operation.latest_status.state.is_terminal() {
            debug!(
                operation = %operation_id,
                state = ?operation.latest_status.state,
                "Ignoring acknowledgement for non-terminal operation"
            );
            return None;
        }
        self.operations.remove(operation_id)
    }

    pub fn remove(&mut self, operation_id: &OperationId) -> Option<Operation> {
        self.operations.remove(operation_id)
    }

    /// Operations the master asked to reconcile; unknown ids yield a
    /// dropped status so the master can clean up.
    pub fn reconcile(&self, operation_ids: &[OperationId]) -> Vec<OperationStatus> {
        operation_ids
            .iter()
            .map(|operation_id| match self.operations.get(operation_id) {
                Some(operation) => operation.latest_status.clone(),
                None => OperationStatus::new(*operation_id, OperationState::Dropped),
            })
            .collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.operations
            .values()
            .filter(|operation| !operation.latest_status.state.is_terminal())
    }

    pub fn all(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moraine_core::{AgentId, Resources};
    use protocols::OperationInfo;

    fn operation() -> Operation {
        Operation::pending(
            OperationId::generate(),
            None,
            AgentId::new("agent"),
            OperationInfo::Reserve {
                resources: Resources::new(),
            },
        )
    }

    #[test]
    fn terminal_status_enables_acknowledgement() {
        let mut tracker = OperationTracker::new();
        let op = operation();
        let id = op.operation_id;
        tracker.track(op);

        assert!(tracker.acknowledge(&id).is_none(), "pending is not ackable");

        tracker.record_status(OperationStatus::new(id, OperationState::Finished));
        assert!(tracker.acknowledge(&id).is_some());
        assert!(tracker.get(&id).is_none());
    }

    #[test]
    fn reconciliation_reports_dropped_for_unknown_ids() {
        let tracker = OperationTracker::new();
        let unknown = OperationId::generate();
        let statuses = tracker.reconcile(&[unknown]);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, OperationState::Dropped);
    }
}
