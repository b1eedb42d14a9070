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

//! The agent side of the cluster: a state-machined worker that registers
//! with a master, recovers executors across restarts, launches and kills
//! task groups, and reliably forwards status updates.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod containerizer;
pub mod executor;
pub mod gc;
pub mod operation;
pub mod recovery;
pub mod runtime;
pub mod status_update;

pub use agent::{
    checkpointed_portion, command_executor_info, Agent, AgentContext, AgentEffect,
    AgentLifecycleState, AgentTimer, PermissiveAuthorizer, TaskAuthorizer,
};
pub use checkpoint::{AgentPaths, CheckpointError, ResourcesCheckpoint};
pub use config::{AgentFlags, ConfigError, ReconfigurationPolicy, RecoveryMode};
pub use containerizer::{
    ContainerLaunchConfig, ContainerStatus, ContainerTermination, Containerizer,
    ContainerizerError, ContainerizerResult,
};
pub use executor::{Executor, ExecutorConnection, ExecutorState, Framework, LiveTask, QueuedItem};
pub use gc::DirectoryGarbageCollector;
pub use operation::OperationTracker;
pub use recovery::{RecoveryEngine, RecoveryError};
pub use runtime::{AgentHandle, AgentMessage, AgentRuntime};
pub use status_update::{AckOutcome, StatusUpdateManager};
