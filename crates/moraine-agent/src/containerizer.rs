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

use async_trait::async_trait;
use moraine_core::{ContainerId, Resources};
use protocols::{CommandInfo, ExecutorInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerizerError {
    #[error("Container {0} launch failed: {1}")]
    LaunchFailed(ContainerId, String),
    #[error("Container {0} update failed: {1}")]
    UpdateFailed(ContainerId, String),
    #[error("Container {0} is unknown")]
    UnknownContainer(ContainerId),
    #[error("Containerizer recovery failed: {0}")]
    RecoveryFailed(String),
}

pub type ContainerizerResult<T> = Result<T, ContainerizerError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLaunchConfig {
    pub container_id: ContainerId,
    pub executor: ExecutorInfo,
    pub command: CommandInfo,
    pub directory: PathBuf,
    pub user: Option<String>,
    pub resources: Resources,
}

/// How a container came to an end, reported by `wait`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerTermination {
    /// Process exit status when the container exited on its own.
    pub exit_status: Option<i32>,
    /// Set when the containerizer itself killed the container (OOM,
    /// preemption, isolation limits) and carries the user-facing message.
    pub killed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub executor_pid: Option<u32>,
}

/// The opaque process/container isolator the agent delegates to. Launching,
/// isolation, and teardown internals are out of scope; the agent only
/// depends on this contract.
#[async_trait]
pub trait Containerizer: Send + Sync {
    async fn recover(&self, known: Vec<ContainerId>) -> ContainerizerResult<Vec<ContainerId>>;

    async fn launch(&self, config: ContainerLaunchConfig) -> ContainerizerResult<()>;

    /// Adjusts the resource envelope of a running container.
    async fn update(
        &self,
        container_id: &ContainerId,
        resources: &Resources,
    ) -> ContainerizerResult<()>;

    /// Resolves when the container terminates. Must be idempotent against a
    /// racing `destroy`.
    async fn wait(&self, container_id: &ContainerId) -> ContainerizerResult<ContainerTermination>;

    async fn destroy(&self, container_id: &ContainerId) -> ContainerizerResult<()>;

    async fn status(&self, container_id: &ContainerId) -> ContainerizerResult<ContainerStatus>;

    async fn usage(&self, container_id: &ContainerId) -> ContainerizerResult<Resources>;

    async fn containers(&self) -> ContainerizerResult<Vec<ContainerId>>;
}
