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

use indexmap::IndexMap;
use moraine_core::{ContainerId, ExecutorId, FrameworkId, Resources, TaskId};
use protocols::{
    AgentToExecutor, ExecutorInfo, FrameworkInfo, StatusUpdateReason, TaskGroupInfo, TaskInfo,
    TaskState, TaskStatus,
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::mpsc;

const MAX_COMPLETED_TASKS_PER_EXECUTOR: usize = 200;
pub const MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK: usize = 150;
pub const MAX_COMPLETED_FRAMEWORKS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Registering,
    Running,
    Terminating,
    Terminated,
}

/// How the agent reaches the executor process: a pid-addressed channel for
/// driver-based executors, an HTTP pipe for subscribed v1 executors, or
/// nothing yet for a recovered executor awaiting re-subscription.
#[derive(Debug)]
pub enum ExecutorConnection {
    Pid {
        pid: u32,
        channel: mpsc::UnboundedSender<AgentToExecutor>,
    },
    Http {
        channel: mpsc::UnboundedSender<AgentToExecutor>,
    },
    None,
}

impl ExecutorConnection {
    pub fn send(&self, message: AgentToExecutor) -> bool {
        match self {
            ExecutorConnection::Pid { channel, .. } | ExecutorConnection::Http { channel } => {
                channel.send(message).is_ok()
            }
            ExecutorConnection::None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self, ExecutorConnection::None)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ExecutorConnection::Http { .. })
    }
}

/// A task known to the agent, from queueing until its terminal update is
/// acknowledged.
#[derive(Debug, Clone)]
pub struct LiveTask {
    pub info: TaskInfo,
    pub state: TaskState,
    pub latest_status: Option<TaskStatus>,
}

impl LiveTask {
    pub fn new(info: TaskInfo) -> Self {
        Self {
            info,
            state: TaskState::Staging,
            latest_status: None,
        }
    }
}

/// Work accepted but not yet delivered to the executor. A group launches and
/// dies as one unit.
#[derive(Debug, Clone)]
pub enum QueuedItem {
    Task(TaskInfo),
    Group(TaskGroupInfo),
}

impl QueuedItem {
    pub fn tasks(&self) -> Vec<&TaskInfo> {
        match self {
            QueuedItem::Task(task) => vec![task],
            QueuedItem::Group(group) => group.tasks.iter().collect(),
        }
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks().iter().any(|task| &task.task_id == task_id)
    }
}

/// The terminal verdict to apply to an executor's remaining tasks when its
/// container is gone, recorded when the termination was agent-initiated.
#[derive(Debug, Clone)]
pub struct PendingTermination {
    pub state: TaskState,
    pub reason: StatusUpdateReason,
    pub message: String,
}

#[derive(Debug)]
pub struct Executor {
    pub id: ExecutorId,
    pub framework_id: FrameworkId,
    pub container_id: ContainerId,
    pub info: ExecutorInfo,
    pub state: ExecutorState,
    pub connection: ExecutorConnection,
    /// Launch-ordered items awaiting delivery to the executor.
    pub queued: Vec<QueuedItem>,
    pub launched: IndexMap<TaskId, LiveTask>,
    /// Terminal but not yet acknowledged by the scheduler.
    pub terminated: HashMap<TaskId, LiveTask>,
    pub completed: VecDeque<LiveTask>,
    pub pending_termination: Option<PendingTermination>,
    pub checkpoint: bool,
    pub directory: PathBuf,
    pub user: Option<String>,
}

impl Executor {
    pub fn new(
        info: ExecutorInfo,
        container_id: ContainerId,
        directory: PathBuf,
        checkpoint: bool,
        user: Option<String>,
    ) -> Self {
        Self {
            id: info.executor_id.clone(),
            framework_id: info.framework_id.clone(),
            container_id,
            info,
            state: ExecutorState::Registering,
            connection: ExecutorConnection::None,
            queued: Vec::new(),
            launched: IndexMap::new(),
            terminated: HashMap::new(),
            completed: VecDeque::new(),
            pending_termination: None,
            checkpoint,
            directory,
            user,
        }
    }

    pub fn queue(&mut self, item: QueuedItem) {
        self.queued.push(item);
    }

    pub fn queued_task_ids(&self) -> Vec<TaskId> {
        self.queued
            .iter()
            .flat_map(|item| item.tasks().into_iter().map(|task| task.task_id.clone()))
            .collect()
    }

    pub fn has_queued(&self, task_id: &TaskId) -> bool {
        self.queued.iter().any(|item| item.contains(task_id))
    }

    /// Removes the queued item containing `task_id` whole: killing one task
    /// of a group removes every task of the group.
    pub fn dequeue_item_containing(&mut self, task_id: &TaskId) -> Option<QueuedItem> {
        let index = self.queued.iter().position(|item| item.contains(task_id))?;
        Some(self.queued.remove(index))
    }

    pub fn take_queued(&mut self) -> Vec<QueuedItem> {
        std::mem::take(&mut self.queued)
    }

    pub fn contains_task(&self, task_id: &TaskId) -> bool {
        self.has_queued(task_id)
            || self.launched.contains_key(task_id)
            || self.terminated.contains_key(task_id)
            || self.is_retired(task_id)
    }

    /// Whether the task finished its lifetime here: terminal update
    /// acknowledged and the record moved into the completed ring. Task ids
    /// stay unique for the lifetime plus the acknowledgement window, so the
    /// bounded ring is an adequate record.
    pub fn is_retired(&self, task_id: &TaskId) -> bool {
        self.completed
            .iter()
            .any(|task| &task.info.task_id == task_id)
    }

    /// Moves a launched task to the terminated table.
    pub fn terminate_task(&mut self, task_id: &TaskId) -> Option<LiveTask> {
        let task = self.launched.shift_remove(task_id)?;
        self.terminated.insert(task_id.clone(), task.clone());
        Some(task)
    }

    /// Drops a terminated task after its terminal update was acknowledged,
    /// retiring it into the bounded completed ring.
    pub fn complete_task(&mut self, task_id: &TaskId) -> bool {
        let Some(task) = self.terminated.remove(task_id) else {
            return false;
        };
        if self.completed.len() >= MAX_COMPLETED_TASKS_PER_EXECUTOR {
            self.completed.pop_front();
        }
        self.completed.push_back(task);
        true
    }

    /// Everything the executor currently holds against the agent's
    /// resources: its own envelope plus queued and launched tasks.
    pub fn allocated_resources(&self) -> Resources {
        let mut total = self.info.resources.clone();
        for item in &self.queued {
            for task in item.tasks() {
                total += &task.resources;
            }
        }
        for task in self.launched.values() {
            total += &task.info.resources;
        }
        total
    }

    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.launched.is_empty() && self.terminated.is_empty()
    }

    pub fn shutdown_grace_period(&self, agent_default: std::time::Duration) -> std::time::Duration {
        self.info.shutdown_grace_period.unwrap_or(agent_default)
    }
}

/// Tasks accepted but still working through GC unscheduling and
/// authorization; not yet queued on any executor.
#[derive(Debug)]
pub struct PendingLaunch {
    pub executor: ExecutorInfo,
    pub tasks: Vec<TaskInfo>,
    pub as_group: bool,
}

impl PendingLaunch {
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.iter().any(|task| &task.task_id == task_id)
    }
}

#[derive(Debug)]
pub struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub executors: HashMap<ExecutorId, Executor>,
    pub pending: Vec<PendingLaunch>,
    pub completed_executors: VecDeque<ExecutorId>,
    /// Set by ShutdownFramework; suppresses ExitedExecutor noise and new
    /// launches while executors drain.
    pub terminating: bool,
}

impl Framework {
    pub fn new(id: FrameworkId, info: FrameworkInfo) -> Self {
        Self {
            id,
            info,
            executors: HashMap::new(),
            pending: Vec::new(),
            completed_executors: VecDeque::new(),
            terminating: false,
        }
    }

    pub fn executor_of_task(&self, task_id: &TaskId) -> Option<&ExecutorId> {
        self.executors
            .values()
            .find(|executor| executor.contains_task(task_id))
            .map(|executor| &executor.id)
    }

    pub fn pending_launch_containing(&self, task_id: &TaskId) -> Option<usize> {
        self.pending.iter().position(|launch| launch.contains(task_id))
    }

    pub fn has_task(&self, task_id: &TaskId) -> bool {
        self.pending_launch_containing(task_id).is_some()
            || self.executor_of_task(task_id).is_some()
    }

    pub fn retire_executor(&mut self, executor_id: &ExecutorId) {
        if self.completed_executors.len() >= MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK {
            self.completed_executors.pop_front();
        }
        self.completed_executors.push_back(executor_id.clone());
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.executors.is_empty()
    }
}
