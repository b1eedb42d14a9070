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

//! A minimal process-spawning containerizer: executors run as plain child
//! processes in their sandbox directory. Resource isolation is out of
//! scope; this exists so the daemon is operable without an external
//! containerizer integration.

use async_trait::async_trait;
use moraine_agent::{
    ContainerLaunchConfig, ContainerStatus, ContainerTermination, Containerizer,
    ContainerizerError, ContainerizerResult,
};
use moraine_core::{ContainerId, Resources};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

struct RunningContainer {
    pid: Option<u32>,
    terminated_rx: Option<oneshot::Receiver<ContainerTermination>>,
}

#[derive(Default)]
pub struct ProcessContainerizer {
    containers: Arc<Mutex<HashMap<ContainerId, RunningContainer>>>,
}

impl ProcessContainerizer {
    pub fn new() -> Self {
        Self::default()
    }

    async fn reap(
        containers: Arc<Mutex<HashMap<ContainerId, RunningContainer>>>,
        container_id: ContainerId,
        mut child: Child,
        terminated_tx: oneshot::Sender<ContainerTermination>,
    ) {
        let termination = match child.wait().await {
            Ok(status) => ContainerTermination {
                exit_status: status.code(),
                killed: status.code().is_none(),
                message: None,
            },
            Err(e) => ContainerTermination {
                exit_status: None,
                killed: true,
                message: Some(format!("wait failed: {e}")),
            },
        };

        debug!(container = %container_id, status = ?termination.exit_status, "Container exited");

        let mut table = containers.lock().await;
        if let Some(container) = table.get_mut(&container_id) {
            container.pid = None;
        }
        drop(table);

        let _ = terminated_tx.send(termination);
    }
}

#[async_trait]
impl Containerizer for ProcessContainerizer {
    async fn recover(&self, _known: Vec<ContainerId>) -> ContainerizerResult<Vec<ContainerId>> {
        // Child processes do not survive the daemon; nothing is alive after
        // a restart.
        Ok(Vec::new())
    }

    async fn launch(&self, config: ContainerLaunchConfig) -> ContainerizerResult<()> {
        let Some(value) = config.command.value.clone() else {
            return Err(ContainerizerError::LaunchFailed(
                config.container_id,
                "executor command has no value".to_string(),
            ));
        };

        tokio::fs::create_dir_all(&config.directory)
            .await
            .map_err(|e| {
                ContainerizerError::LaunchFailed(config.container_id.clone(), e.to_string())
            })?;

        let mut command = if config.command.shell {
            let mut shell = Command::new("/bin/sh");
            shell.arg("-c").arg(&value);
            shell
        } else {
            let mut direct = Command::new(&value);
            direct.args(&config.command.arguments);
            direct
        };
        command.current_dir(&config.directory);
        command.envs(config.command.environment.clone());

        let child = command.spawn().map_err(|e| {
            ContainerizerError::LaunchFailed(config.container_id.clone(), e.to_string())
        })?;
        let pid = child.id();

        let (terminated_tx, terminated_rx) = oneshot::channel();
        self.containers.lock().await.insert(
            config.container_id.clone(),
            RunningContainer {
                pid,
                terminated_rx: Some(terminated_rx),
            },
        );

        tokio::spawn(Self::reap(
            Arc::clone(&self.containers),
            config.container_id,
            child,
            terminated_tx,
        ));

        Ok(())
    }

    async fn update(
        &self,
        container_id: &ContainerId,
        _resources: &Resources,
    ) -> ContainerizerResult<()> {
        // No isolation, so nothing to adjust; unknown ids still error.
        if !self.containers.lock().await.contains_key(container_id) {
            return Err(ContainerizerError::UnknownContainer(container_id.clone()));
        }
        Ok(())
    }

    async fn wait(&self, container_id: &ContainerId) -> ContainerizerResult<ContainerTermination> {
        let rx = {
            let mut table = self.containers.lock().await;
            table
                .get_mut(container_id)
                .ok_or_else(|| ContainerizerError::UnknownContainer(container_id.clone()))?
                .terminated_rx
                .take()
        };

        match rx {
            Some(rx) => rx.await.map_err(|_| {
                ContainerizerError::UnknownContainer(container_id.clone())
            }),
            // A second waiter (a destroy racing the reap) sees the
            // container already gone.
            None => Ok(ContainerTermination {
                exit_status: None,
                killed: true,
                message: Some("container already reaped".to_string()),
            }),
        }
    }

    async fn destroy(&self, container_id: &ContainerId) -> ContainerizerResult<()> {
        let pid = self
            .containers
            .lock()
            .await
            .get(container_id)
            .and_then(|container| container.pid);

        if let Some(pid) = pid {
            debug!(container = %container_id, pid, "Killing container process");
            let result = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
            if let Err(e) = result {
                warn!(container = %container_id, error = %e, "Failed to signal container");
            }
        }

        Ok(())
    }

    async fn status(&self, container_id: &ContainerId) -> ContainerizerResult<ContainerStatus> {
        let table = self.containers.lock().await;
        let container = table
            .get(container_id)
            .ok_or_else(|| ContainerizerError::UnknownContainer(container_id.clone()))?;
        Ok(ContainerStatus {
            container_id: container_id.clone(),
            executor_pid: container.pid,
        })
    }

    async fn usage(&self, _container_id: &ContainerId) -> ContainerizerResult<Resources> {
        Ok(Resources::new())
    }

    async fn containers(&self) -> ContainerizerResult<Vec<ContainerId>> {
        Ok(self.containers.lock().await.keys().cloned().collect())
    }
}
