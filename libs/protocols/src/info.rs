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
use moraine_core::{
    AgentCapabilities, AgentId, ExecutorId, FrameworkCapabilities, FrameworkId, Resources,
    RoleName, TaskId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDomain {
    pub region: String,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub fault_domain: FaultDomain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: Option<AgentId>,
    pub hostname: String,
    pub port: u16,
    pub domain: Option<DomainInfo>,
    pub resources: Resources,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub id: Option<FrameworkId>,
    pub name: String,
    pub user: String,
    pub roles: Vec<RoleName>,
    pub capabilities: FrameworkCapabilities,
    pub checkpoint: bool,
    pub principal: Option<String>,
}

impl FrameworkInfo {
    /// The role set in force: multi-role frameworks subscribe to `roles`,
    /// legacy frameworks to a single role.
    pub fn role_set(&self) -> Vec<RoleName> {
        self.roles.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: Option<String>,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub shell: bool,
    pub user: Option<String>,
}

impl Default for CommandInfo {
    fn default() -> Self {
        Self {
            value: None,
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            shell: true,
            user: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorKind {
    /// The agent-provided executor that runs task groups directly.
    Default,
    /// A framework-supplied executor binary.
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub framework_id: FrameworkId,
    pub kind: ExecutorKind,
    pub resources: Resources,
    pub command: CommandInfo,
    /// Overrides the agent-wide shutdown grace period.
    pub shutdown_grace_period: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillPolicy {
    pub grace_period: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub resources: Resources,
    pub command: Option<CommandInfo>,
    pub kill_policy: Option<KillPolicy>,
    pub labels: BTreeMap<String, String>,
}

/// Tasks launched atomically under one executor. A kill of any member
/// before delivery cascades to the whole group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupInfo {
    pub tasks: Vec<TaskInfo>,
}

impl TaskGroupInfo {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|task| task.task_id.clone()).collect()
    }
}

/// A maintenance window on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unavailability {
    pub start: DateTime<Utc>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnavailableResources {
    pub resources: Resources,
    pub unavailability: Unavailability,
}

/// Capability payload carried at registration, mirrored from
/// `moraine_core::AgentCapabilities` for the wire.
pub type AgentCapabilityFlags = AgentCapabilities;
