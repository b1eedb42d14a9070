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

use crate::agent::{Agent, AgentTimer};
use crate::checkpoint::{self, AgentPaths, CheckpointError, ResourcesCheckpoint};
use crate::config::{ReconfigurationPolicy, RecoveryMode};
use crate::executor::{Executor, ExecutorConnection, ExecutorState, Framework, LiveTask};
use moraine_core::{AgentId, ContainerId, ExecutorId, FrameworkId, Resource, Resources, TaskId};
use protocols::{AgentInfo, ExecutorInfo, FrameworkInfo, TaskInfo};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Checkpoint error during recovery: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Agent info is incompatible with checkpointed state: {0}")]
    IncompatibleInfo(String),
    #[error("Containerizer recovery failed: {0}")]
    Containerizer(String),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Reconstructs agent state from the checkpoint tree: resources first (the
/// target may need re-applying), then identity, then the
/// framework/executor/run/task hierarchy, then the containerizer's own
/// state. Ends by arming the executor re-registration sweep or, in cleanup
/// mode, shutting everything down.
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub async fn recover(agent: &mut Agent) -> RecoveryResult<()> {
        let paths = agent.paths().clone();
        let flags = agent.context().flags.clone();

        // Resources come first: a crash mid-commit left a target that must
        // be re-applied before anything reads the committed state.
        let resources_checkpoint = ResourcesCheckpoint::new(paths.clone());
        if let Some(target) = resources_checkpoint.recover_target().await? {
            info!(resources = %target, "Re-applied interrupted resources checkpoint");
        }
        let checkpointed = resources_checkpoint.committed().await?;
        if !checkpointed.is_empty() {
            info!(resources = %checkpointed, "Recovered checkpointed resources");
        }
        agent.set_recovered_resources(checkpointed);

        // Identity: the `latest` symlink names the agent id of the previous
        // run; absent means a fresh agent.
        let Some(agent_id) = read_latest_agent(&paths).await? else {
            info!("No checkpointed agent state found; starting as a new agent");
            return Self::finish(agent, Vec::new()).await;
        };

        let previous_info: Option<AgentInfo> =
            checkpoint::read_json_if_exists(&paths.agent_info(&agent_id)).await?;

        let rebooted = match checkpoint::read_boot_id(&paths).await? {
            Some(previous) => previous != agent.context().boot_id,
            None => false,
        };

        if let Some(previous) = &previous_info {
            if let Err(reason) = check_compatibility(
                previous,
                &agent.context().info,
                flags.reconfiguration_policy,
            ) {
                if rebooted {
                    // A reboot wiped every container anyway; the safe
                    // fallback is a fresh identity.
                    warn!(
                        %reason,
                        "Agent info changed across a reboot; starting as a new agent"
                    );
                    fs::remove_file(paths.latest_agent_symlink())
                        .await
                        .map_err(|e| CheckpointError::Io {
                            path: paths.latest_agent_symlink(),
                            source: e,
                        })?;
                    return Self::finish(agent, Vec::new()).await;
                }
                return Err(RecoveryError::IncompatibleInfo(reason));
            }
        }

        info!(agent = %agent_id, "Recovering agent state");
        agent.set_recovered_identity(agent_id.clone());

        // Rebuild the framework/executor/task tables from the meta tree.
        let mut known_containers = Vec::new();
        let framework_ids = list_dir(&paths.agent_meta(&agent_id).join("frameworks")).await?;
        for framework_name in framework_ids {
            let framework_id = FrameworkId::new(framework_name);
            match Self::recover_framework(agent, &paths, &agent_id, &framework_id).await? {
                Some((framework, containers)) => {
                    known_containers.extend(containers);
                    agent.restore_framework(framework);
                }
                None => {
                    warn!(
                        framework = %framework_id,
                        "Skipping framework with incomplete checkpoint"
                    );
                }
            }
        }

        Self::finish(agent, known_containers).await
    }

    async fn recover_framework(
        agent: &mut Agent,
        paths: &AgentPaths,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
    ) -> RecoveryResult<Option<(Framework, Vec<ContainerId>)>> {
        let info: Option<FrameworkInfo> =
            checkpoint::read_json_if_exists(&paths.framework_info(agent_id, framework_id)).await?;
        let Some(info) = info else {
            return Ok(None);
        };

        let mut framework = Framework::new(framework_id.clone(), info.clone());
        let mut containers = Vec::new();

        let executors_dir = paths
            .framework_meta(agent_id, framework_id)
            .join("executors");
        for executor_name in list_dir(&executors_dir).await? {
            let executor_id = ExecutorId::new(executor_name);

            // The latest symlink selects the live run; older runs are only
            // garbage.
            let latest = paths.latest_run_symlink(agent_id, framework_id, &executor_id);
            let Ok(run_path) = fs::read_link(&latest).await else {
                warn!(executor = %executor_id, "Executor has no latest run; skipping");
                continue;
            };
            let Some(container_name) = run_path.file_name().and_then(|name| name.to_str())
            else {
                continue;
            };
            let container_id = ContainerId::new(container_name);

            let executor_info: Option<ExecutorInfo> = checkpoint::read_json_if_exists(
                &paths.executor_info(agent_id, framework_id, &executor_id, &container_id),
            )
            .await?;
            let Some(mut executor_info) = executor_info else {
                warn!(executor = %executor_id, "Executor run has no info; skipping");
                continue;
            };

            // Multi-role compatibility: resources checkpointed before the
            // allocation-role field need it injected; re-checkpoint only
            // when touched.
            let default_role = info.roles.first().cloned();
            if inject_role(&mut executor_info.resources, &default_role) {
                checkpoint::checkpoint_json(
                    &paths.executor_info(agent_id, framework_id, &executor_id, &container_id),
                    &executor_info,
                )
                .await?;
            }

            let directory =
                paths.executor_work_dir(agent_id, framework_id, &executor_id, &container_id);
            let mut executor = Executor::new(
                executor_info,
                container_id.clone(),
                directory,
                info.checkpoint,
                None,
            );
            executor.state = ExecutorState::Registering;
            executor.connection = ExecutorConnection::None;

            // Tasks of the live run. A sentinel marks a fully acknowledged
            // task; those need no further work.
            let tasks_dir = paths
                .run_meta(agent_id, framework_id, &executor_id, &container_id)
                .join("tasks");
            for task_name in list_dir(&tasks_dir).await? {
                let task_id = TaskId::new(task_name);
                let sentinel = paths.task_sentinel(
                    agent_id,
                    framework_id,
                    &executor_id,
                    &container_id,
                    &task_id,
                );
                if fs::try_exists(&sentinel).await.unwrap_or(false) {
                    continue;
                }

                let task_info: Option<TaskInfo> = checkpoint::read_json_if_exists(
                    &paths.task_info(agent_id, framework_id, &executor_id, &container_id, &task_id),
                )
                .await?;
                let Some(mut task_info) = task_info else {
                    continue;
                };

                if inject_role(&mut task_info.resources, &default_role) {
                    checkpoint::checkpoint_json(
                        &paths.task_info(
                            agent_id,
                            framework_id,
                            &executor_id,
                            &container_id,
                            &task_id,
                        ),
                        &task_info,
                    )
                    .await?;
                }

                let updates_path = paths.task_updates(
                    agent_id,
                    framework_id,
                    &executor_id,
                    &container_id,
                    &task_id,
                );
                let recovered_state = agent
                    .status_updates_mut()
                    .recover_stream(framework_id.clone(), task_id.clone(), updates_path)
                    .await?;

                let mut task = LiveTask::new(task_info);
                if let Some(state) = recovered_state {
                    task.state = state;
                }

                if task.state.is_terminal() {
                    executor.terminated.insert(task_id, task);
                } else {
                    executor.launched.insert(task_id, task);
                }
            }

            containers.push(container_id);
            framework.executors.insert(executor_id, executor);
        }

        Ok(Some((framework, containers)))
    }

    /// Containerizer reconciliation and the per-mode endgame.
    async fn finish(agent: &mut Agent, known_containers: Vec<ContainerId>) -> RecoveryResult<()> {
        let containerizer = agent.containerizer();
        let alive = containerizer
            .recover(known_containers.clone())
            .await
            .map_err(|e| RecoveryError::Containerizer(e.to_string()))?;

        // Orphans: containers the containerizer knows but no checkpoint
        // claims. They are destroyed now; the destroy and any concurrent
        // wait completion are both idempotent.
        for container_id in &alive {
            if !known_containers.contains(container_id) {
                warn!(container = %container_id, "Destroying orphaned container");
                let _ = containerizer.destroy(container_id).await;
            }
        }

        // Executors whose container is already gone will never re-register;
        // synthesise their termination instead of waiting out the timeout.
        let mut dead_runs = Vec::new();
        for (framework_id, framework) in &agent.frameworks {
            for (executor_id, executor) in &framework.executors {
                if !alive.contains(&executor.container_id) {
                    dead_runs.push((
                        framework_id.clone(),
                        executor_id.clone(),
                        executor.container_id.clone(),
                    ));
                }
            }
        }
        for (framework_id, executor_id, container_id) in dead_runs {
            agent
                .handle_container_terminated(framework_id, executor_id, container_id, None, None)
                .await;
        }

        let flags = agent.context().flags.clone();
        match flags.recover {
            RecoveryMode::Reconnect => {
                agent.schedule_timer(
                    flags.executor_reregistration_timeout,
                    AgentTimer::ExecutorReregistrationTimeout,
                );
                if flags.executor_reregistration_retry_interval.is_some() {
                    agent.schedule_timer(
                        std::time::Duration::ZERO,
                        AgentTimer::ExecutorReconnectRetry,
                    );
                }
                agent.finish_recovery();
            }
            RecoveryMode::Cleanup => {
                info!("Cleanup recovery: shutting down all recovered executors");
                agent.finish_recovery();
                agent.shutdown().await;
            }
        }

        Ok(())
    }
}

async fn read_latest_agent(paths: &AgentPaths) -> RecoveryResult<Option<AgentId>> {
    match fs::read_link(paths.latest_agent_symlink()).await {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|name| name.to_str())
            .map(AgentId::new)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CheckpointError::Io {
            path: paths.latest_agent_symlink(),
            source: e,
        }
        .into()),
    }
}

async fn list_dir(path: &Path) -> RecoveryResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source: e,
            }
            .into())
        }
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| CheckpointError::Io {
        path: path.to_path_buf(),
        source: e,
    })? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Compares the configured agent info against the checkpointed one.
fn check_compatibility(
    previous: &AgentInfo,
    current: &AgentInfo,
    policy: ReconfigurationPolicy,
) -> Result<(), String> {
    match policy {
        ReconfigurationPolicy::Equal => {
            let mut previous = previous.clone();
            previous.id = None;
            let mut current = current.clone();
            current.id = None;
            if previous != current {
                return Err("agent info differs and the policy is 'equal'".to_string());
            }
            Ok(())
        }
        ReconfigurationPolicy::Additive => {
            for (key, value) in &previous.attributes {
                match current.attributes.get(key) {
                    Some(now) if now == value => {}
                    Some(_) => {
                        return Err(format!("attribute '{key}' changed value"));
                    }
                    None => {
                        return Err(format!("attribute '{key}' was removed"));
                    }
                }
            }
            if !current.resources.contains(&previous.resources) {
                return Err("resources shrank under the 'additive' policy".to_string());
            }
            Ok(())
        }
    }
}

fn inject_role(
    resources: &mut Resources,
    default_role: &Option<moraine_core::RoleName>,
) -> bool {
    let Some(role) = default_role else {
        return false;
    };
    if resources.iter().all(|r| r.allocation_role.is_some()) {
        return false;
    }
    let injected: Vec<Resource> = resources
        .iter()
        .map(|resource| {
            let mut resource = resource.clone();
            if resource.allocation_role.is_none() {
                resource.allocation_role = Some(role.clone());
            }
            resource
        })
        .collect();
    *resources = Resources::from(injected);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn info(attributes: &[(&str, &str)], cpus: f64) -> AgentInfo {
        AgentInfo {
            id: None,
            hostname: "host".to_string(),
            port: 5051,
            domain: None,
            resources: Resources::from(vec![Resource::scalar("cpus", cpus)]),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn equal_policy_rejects_any_change() {
        let previous = info(&[("rack", "r1")], 4.0);
        let same = info(&[("rack", "r1")], 4.0);
        let changed = info(&[("rack", "r2")], 4.0);

        assert!(check_compatibility(&previous, &same, ReconfigurationPolicy::Equal).is_ok());
        assert!(check_compatibility(&previous, &changed, ReconfigurationPolicy::Equal).is_err());
    }

    #[test]
    fn additive_policy_allows_growth_only() {
        let previous = info(&[("rack", "r1")], 4.0);
        let grown = info(&[("rack", "r1"), ("pool", "batch")], 8.0);
        let shrunk = info(&[("rack", "r1")], 2.0);
        let removed = info(&[], 4.0);

        assert!(check_compatibility(&previous, &grown, ReconfigurationPolicy::Additive).is_ok());
        assert!(check_compatibility(&previous, &shrunk, ReconfigurationPolicy::Additive).is_err());
        assert!(check_compatibility(&previous, &removed, ReconfigurationPolicy::Additive).is_err());
    }
}
