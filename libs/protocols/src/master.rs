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

use crate::info::{
    AgentInfo, ExecutorInfo, FrameworkInfo, KillPolicy, TaskGroupInfo, TaskInfo,
};
use crate::operation::{Operation, OperationStatus};
use crate::status::{StatusUpdate, TaskState};
use moraine_core::{
    AgentCapabilities, AgentId, ExecutorId, FrameworkId, OperationId, ProviderId, ResourceVersion,
    Resources, TaskId, UpdateUuid,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Resource versions in force on an agent: the agent-default version plus
/// one per connected resource provider. A mismatch between a launch request
/// and these versions invalidates the offer the launch was based on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersions {
    pub agent_default: Option<ResourceVersion>,
    pub providers: BTreeMap<ProviderId, ResourceVersion>,
}

impl ResourceVersions {
    pub fn matches(&self, other: &ResourceVersions) -> bool {
        if other.agent_default.is_some() && other.agent_default != self.agent_default {
            return false;
        }
        other
            .providers
            .iter()
            .all(|(provider, version)| self.providers.get(provider) == Some(version))
    }
}

/// Summary of a live task carried in re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: TaskInfo,
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentToMaster {
    Register {
        info: AgentInfo,
        capabilities: AgentCapabilities,
        checkpointed_resources: Resources,
        resource_version: ResourceVersion,
    },
    Reregister {
        info: AgentInfo,
        capabilities: AgentCapabilities,
        checkpointed_resources: Resources,
        resource_version: ResourceVersion,
        tasks: Vec<TaskSummary>,
        executors: Vec<ExecutorInfo>,
        frameworks: Vec<FrameworkInfo>,
        completed_frameworks: Vec<FrameworkId>,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
    ExitedExecutor {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    },
    UpdateAgent {
        agent_id: AgentId,
        total_resources: Option<Resources>,
        resource_versions: ResourceVersions,
        operations: Vec<Operation>,
    },
    UpdateOperationStatus {
        agent_id: AgentId,
        framework_id: Option<FrameworkId>,
        status: OperationStatus,
    },
    Unregister {
        agent_id: AgentId,
    },
}

/// The framework's answer to an inverse offer, reported back into the
/// allocator. `None` (timeout or rescind) clears the outstanding record
/// without recording a stance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverseOfferResponse {
    Accept,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MasterToAgent {
    Registered {
        agent_id: AgentId,
        ping_timeout: Duration,
    },
    Reregistered {
        agent_id: AgentId,
        ping_timeout: Duration,
    },
    RegistrationRefused {
        message: String,
    },
    RunTask {
        framework: FrameworkInfo,
        executor: Option<ExecutorInfo>,
        task: TaskInfo,
        resource_versions: ResourceVersions,
    },
    RunTaskGroup {
        framework: FrameworkInfo,
        executor: ExecutorInfo,
        task_group: TaskGroupInfo,
        resource_versions: ResourceVersions,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
        kill_policy: Option<KillPolicy>,
    },
    ShutdownExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    ShutdownFramework {
        framework_id: FrameworkId,
    },
    CheckpointResources {
        resources: Resources,
    },
    ApplyOperation {
        operation: Operation,
    },
    ReconcileOperations {
        operation_ids: Vec<OperationId>,
    },
    AcknowledgeOperationStatus {
        operation_id: OperationId,
        status_uuid: UpdateUuid,
    },
    StatusUpdateAcknowledgement {
        agent_id: AgentId,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    },
    UpdateFramework {
        framework: FrameworkInfo,
    },
    /// Tasks the master believes are running on this agent; any it knows
    /// that the agent does not triggers a reconciliation update.
    ReconcileTasks {
        tasks: Vec<(FrameworkId, TaskId)>,
    },
    Ping {
        connected: bool,
    },
    Shutdown {
        message: Option<String>,
    },
}
