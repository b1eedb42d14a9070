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
use crate::status::StatusUpdate;
use moraine_core::{AgentId, ContainerId, ExecutorId, FrameworkId, TaskId, UpdateUuid};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentToExecutor {
    /// Reply to a successful subscription or registration.
    Subscribed {
        executor: ExecutorInfo,
        framework: FrameworkInfo,
        agent: AgentInfo,
        container_id: ContainerId,
    },
    RunTask {
        framework_id: FrameworkId,
        task: TaskInfo,
    },
    LaunchGroup {
        framework_id: FrameworkId,
        task_group: TaskGroupInfo,
    },
    KillTask {
        task_id: TaskId,
        kill_policy: Option<KillPolicy>,
    },
    StatusUpdateAcknowledgement {
        task_id: TaskId,
        uuid: UpdateUuid,
    },
    Shutdown {
        grace_period: Duration,
    },
    /// Sent during agent recovery to pid-based executors so they re-link.
    Reconnect {
        agent_id: AgentId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutorToAgent {
    /// HTTP-based executors subscribe, replaying anything the agent may
    /// have lost across a restart.
    Subscribe {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        unacknowledged_updates: Vec<StatusUpdate>,
        unacknowledged_tasks: Vec<TaskInfo>,
    },
    /// Pid-based executors register (first connection) or re-register
    /// (after agent restart).
    Register {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    Reregister {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<TaskInfo>,
        unacknowledged_updates: Vec<StatusUpdate>,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
}
