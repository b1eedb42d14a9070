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

use chrono::{DateTime, Utc};
use moraine_core::{AgentId, ContainerId, ExecutorId, FrameworkId, TaskId, UpdateUuid};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Error,
    Lost,
    Dropped,
    Unreachable,
    Gone,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Error
                | TaskState::Lost
                | TaskState::Dropped
                | TaskState::Gone
        )
    }
}

/// Which component synthesised an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSource {
    Master,
    Agent,
    Executor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusUpdateReason {
    Reconciliation,
    ContainerLaunchFailed,
    ContainerUpdateFailed,
    ContainerPreempted,
    ExecutorTerminated,
    ExecutorRegistrationTimeout,
    ExecutorReregistrationTimeout,
    AgentRestarted,
    TaskKilledDuringLaunch,
    TaskUnauthorized,
    TaskGroupUnauthorized,
    GarbageCollectionError,
    ResourcesUnknown,
    InvalidOffers,
    FrameworkRemoved,
    AgentDisconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub source: UpdateSource,
    pub reason: Option<StatusUpdateReason>,
    pub message: Option<String>,
    pub executor_id: Option<ExecutorId>,
    pub agent_id: Option<AgentId>,
    pub container_id: Option<ContainerId>,
    pub uuid: Option<UpdateUuid>,
    pub timestamp: DateTime<Utc>,
    pub healthy: Option<bool>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState, source: UpdateSource) -> Self {
        Self {
            task_id,
            state,
            source,
            reason: None,
            message: None,
            executor_id: None,
            agent_id: None,
            container_id: None,
            uuid: None,
            timestamp: Utc::now(),
            healthy: None,
        }
    }

    pub fn with_reason(mut self, reason: StatusUpdateReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A status update as carried between agent and master: the status plus the
/// stream identity and the latest known state of the task, which may be
/// ahead of the acknowledged stream position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub latest_state: Option<TaskState>,
}

impl StatusUpdate {
    pub fn uuid(&self) -> Option<UpdateUuid> {
        self.status.uuid
    }

    pub fn task_id(&self) -> &TaskId {
        &self.status.task_id
    }
}
