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

use moraine_core::{
    AgentId, ContainerId, DiskSource, ExecutorId, FrameworkId, Resource, Resources, TaskId,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The agent's on-disk layout. The meta tree holds checkpointed state, the
/// work tree holds sandboxes; both mirror
/// `agents/<aid>/frameworks/<fid>/executors/<eid>/runs/<cid>`.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub work_dir: PathBuf,
    pub meta_dir: PathBuf,
}

impl AgentPaths {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let meta_dir = work_dir.join("meta");
        Self { work_dir, meta_dir }
    }

    pub fn boot_id(&self) -> PathBuf {
        self.meta_dir.join("boot_id")
    }

    pub fn latest_agent_symlink(&self) -> PathBuf {
        self.meta_dir.join("agents").join("latest")
    }

    pub fn agent_meta(&self, agent_id: &AgentId) -> PathBuf {
        self.meta_dir.join("agents").join(agent_id.as_str())
    }

    pub fn agent_info(&self, agent_id: &AgentId) -> PathBuf {
        self.agent_meta(agent_id).join("agent.info")
    }

    pub fn framework_meta(&self, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
        self.agent_meta(agent_id)
            .join("frameworks")
            .join(framework_id.as_str())
    }

    pub fn framework_info(&self, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
        self.framework_meta(agent_id, framework_id)
            .join("framework.info")
    }

    pub fn executor_meta(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> PathBuf {
        self.framework_meta(agent_id, framework_id)
            .join("executors")
            .join(executor_id.as_str())
    }

    pub fn latest_run_symlink(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> PathBuf {
        self.executor_meta(agent_id, framework_id, executor_id)
            .join("latest")
    }

    pub fn run_meta(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
    ) -> PathBuf {
        self.executor_meta(agent_id, framework_id, executor_id)
            .join("runs")
            .join(container_id.as_str())
    }

    pub fn executor_info(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
    ) -> PathBuf {
        self.run_meta(agent_id, framework_id, executor_id, container_id)
            .join("executor.info")
    }

    pub fn http_marker(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
    ) -> PathBuf {
        self.run_meta(agent_id, framework_id, executor_id, container_id)
            .join("http.marker")
    }

    pub fn forked_pid(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
    ) -> PathBuf {
        self.run_meta(agent_id, framework_id, executor_id, container_id)
            .join("forked.pid")
    }

    pub fn task_meta(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
        task_id: &TaskId,
    ) -> PathBuf {
        self.run_meta(agent_id, framework_id, executor_id, container_id)
            .join("tasks")
            .join(task_id.as_str())
    }

    pub fn task_info(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
        task_id: &TaskId,
    ) -> PathBuf {
        self.task_meta(agent_id, framework_id, executor_id, container_id, task_id)
            .join("task.info")
    }

    pub fn task_updates(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
        task_id: &TaskId,
    ) -> PathBuf {
        self.task_meta(agent_id, framework_id, executor_id, container_id, task_id)
            .join("updates")
    }

    /// Marks a task whose terminal update was acknowledged; recovery skips
    /// it entirely.
    pub fn task_sentinel(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
        task_id: &TaskId,
    ) -> PathBuf {
        self.task_meta(agent_id, framework_id, executor_id, container_id, task_id)
            .join("sentinel")
    }

    pub fn resources_target(&self) -> PathBuf {
        self.meta_dir.join("resources").join("target")
    }

    pub fn resources_committed(&self) -> PathBuf {
        self.meta_dir.join("resources").join("committed")
    }

    pub fn executor_work_dir(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
    ) -> PathBuf {
        self.work_dir
            .join("agents")
            .join(agent_id.as_str())
            .join("frameworks")
            .join(framework_id.as_str())
            .join("executors")
            .join(executor_id.as_str())
            .join("runs")
            .join(container_id.as_str())
    }

    pub fn framework_work_dir(&self, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
        self.work_dir
            .join("agents")
            .join(agent_id.as_str())
            .join("frameworks")
            .join(framework_id.as_str())
    }

    pub fn volume_root(&self, role: &str, persistence_id: &str) -> PathBuf {
        self.work_dir
            .join("volumes")
            .join("roles")
            .join(role)
            .join(persistence_id)
    }
}

/// Writes a serde document to a fresh file and renames it into place, so a
/// reader never observes a torn record.
pub async fn checkpoint_json<T: Serialize>(path: &Path, value: &T) -> CheckpointResult<()> {
    let parent = path
        .parent()
        .expect("checkpoint paths always have a parent");
    fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(parent, e))?;

    let staging = path.with_extension("staging");
    let body = serde_json::to_vec_pretty(value).expect("checkpoint records serialise");
    fs::write(&staging, &body)
        .await
        .map_err(|e| io_error(&staging, e))?;
    fs::rename(&staging, path)
        .await
        .map_err(|e| io_error(path, e))?;
    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> CheckpointResult<T> {
    let body = fs::read(path).await.map_err(|e| io_error(path, e))?;
    serde_json::from_slice(&body).map_err(|e| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub async fn read_json_if_exists<T: DeserializeOwned>(
    path: &Path,
) -> CheckpointResult<Option<T>> {
    match fs::try_exists(path).await {
        Ok(true) => Ok(Some(read_json(path).await?)),
        Ok(false) => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

pub async fn write_marker(path: &Path) -> CheckpointResult<()> {
    let parent = path.parent().expect("marker paths always have a parent");
    fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(parent, e))?;
    fs::write(path, b"")
        .await
        .map_err(|e| io_error(path, e))?;
    Ok(())
}

pub async fn update_symlink(link: &Path, target: &Path) -> CheckpointResult<()> {
    let parent = link.parent().expect("symlinks always have a parent");
    fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(parent, e))?;
    match fs::remove_file(link).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(link, e)),
    }
    fs::symlink(target, link)
        .await
        .map_err(|e| io_error(link, e))?;
    Ok(())
}

/// Checkpointed resources follow target-then-commit: the new state is
/// written to `target`, the filesystem is brought in line (persistent
/// volume directories created and removed), and only then is the target
/// renamed onto `committed`. A crash between the steps is retried from the
/// target on the next start.
pub struct ResourcesCheckpoint {
    paths: AgentPaths,
}

impl ResourcesCheckpoint {
    pub fn new(paths: AgentPaths) -> Self {
        Self { paths }
    }

    pub async fn committed(&self) -> CheckpointResult<Resources> {
        Ok(read_json_if_exists(&self.paths.resources_committed())
            .await?
            .unwrap_or_default())
    }

    pub async fn target(&self) -> CheckpointResult<Option<Resources>> {
        read_json_if_exists(&self.paths.resources_target()).await
    }

    pub async fn checkpoint(&self, resources: &Resources) -> CheckpointResult<()> {
        let committed = self.committed().await?;

        checkpoint_json(&self.paths.resources_target(), resources).await?;
        self.sync_volumes(&committed, resources).await?;
        self.commit_target().await?;

        debug!(resources = %resources, "Checkpointed resources");
        Ok(())
    }

    /// Re-applies a target left behind by a crash mid-commit.
    pub async fn recover_target(&self) -> CheckpointResult<Option<Resources>> {
        let Some(target) = self.target().await? else {
            return Ok(None);
        };
        let committed = self.committed().await?;
        self.sync_volumes(&committed, &target).await?;
        self.commit_target().await?;
        Ok(Some(target))
    }

    async fn commit_target(&self) -> CheckpointResult<()> {
        let target = self.paths.resources_target();
        let committed = self.paths.resources_committed();
        fs::rename(&target, &committed)
            .await
            .map_err(|e| io_error(&committed, e))?;
        Ok(())
    }

    async fn sync_volumes(&self, old: &Resources, new: &Resources) -> CheckpointResult<()> {
        for volume in persistent_volumes(new) {
            let root = self.volume_path(volume);
            fs::create_dir_all(&root)
                .await
                .map_err(|e| io_error(&root, e))?;
        }

        for volume in persistent_volumes(old) {
            if new.contains_resource(volume) {
                continue;
            }
            let root = self.volume_path(volume);

            // A MOUNT-backed volume is a mount point owned by the operator;
            // remove its contents but leave the root in place.
            let is_mount = matches!(
                volume.disk.as_ref().and_then(|disk| disk.source.as_ref()),
                Some(DiskSource::Mount { .. })
            );

            if is_mount {
                remove_dir_contents(&root).await?;
            } else {
                match fs::remove_dir_all(&root).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %root.display(), "Removed volume directory was already gone");
                    }
                    Err(e) => return Err(io_error(&root, e)),
                }
            }
        }

        Ok(())
    }

    fn volume_path(&self, volume: &Resource) -> PathBuf {
        let role = volume
            .reservation_role()
            .expect("persistent volumes are reserved")
            .as_str();
        let id = volume
            .disk
            .as_ref()
            .and_then(|disk| disk.persistence.as_ref())
            .expect("persistent volumes carry persistence")
            .id
            .as_str();
        self.paths.volume_root(role, id)
    }
}

fn persistent_volumes(resources: &Resources) -> impl Iterator<Item = &Resource> {
    resources
        .iter()
        .filter(|resource| resource.is_persistent_volume())
}

async fn remove_dir_contents(root: &Path) -> CheckpointResult<()> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_error(root, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error(root, e))?
    {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
        } else {
            fs::remove_file(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
        }
    }

    Ok(())
}

pub async fn read_boot_id(paths: &AgentPaths) -> CheckpointResult<Option<String>> {
    let path = paths.boot_id();
    match fs::read_to_string(&path).await {
        Ok(body) => Ok(Some(body.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(&path, e)),
    }
}

pub async fn write_boot_id(paths: &AgentPaths, boot_id: &str) -> CheckpointResult<()> {
    let path = paths.boot_id();
    let parent = path.parent().expect("boot id lives under meta");
    fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(parent, e))?;
    fs::write(&path, boot_id)
        .await
        .map_err(|e| io_error(&path, e))
}

/// The host's boot id, used to detect a reboot between agent runs. Falls
/// back to empty on platforms without one.
pub async fn current_boot_id() -> String {
    fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .await
        .map(|body| body.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use moraine_core::{DiskInfo, Persistence, Reservation, RoleName, Volume, VolumeMode};

    fn volume(id: &str) -> Resource {
        Resource::scalar("disk", 128.0)
            .reserved_for(Reservation::dynamically(
                RoleName::parse("web").unwrap(),
                "ops",
            ))
            .with_disk(DiskInfo {
                persistence: Some(Persistence {
                    id: id.to_string(),
                    principal: None,
                }),
                volume: Some(Volume {
                    container_path: "data".to_string(),
                    mode: VolumeMode::ReadWrite,
                }),
                source: None,
            })
    }

    #[tokio::test]
    async fn checkpoint_creates_and_removes_volume_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::new(dir.path());
        let checkpoint = ResourcesCheckpoint::new(paths.clone());

        let with_volume = Resources::from(vec![Resource::scalar("cpus", 4.0), volume("v1")]);
        checkpoint.checkpoint(&with_volume).await.unwrap();

        assert!(paths.volume_root("web", "v1").is_dir());
        assert_eq!(checkpoint.committed().await.unwrap(), with_volume);
        assert!(checkpoint.target().await.unwrap().is_none());

        let without_volume = Resources::from(vec![Resource::scalar("cpus", 4.0)]);
        checkpoint.checkpoint(&without_volume).await.unwrap();

        assert!(!paths.volume_root("web", "v1").exists());
        assert_eq!(checkpoint.committed().await.unwrap(), without_volume);
    }

    #[tokio::test]
    async fn interrupted_commit_recovers_from_target() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::new(dir.path());
        let checkpoint = ResourcesCheckpoint::new(paths.clone());

        // Simulate a crash after writing the target but before commit.
        let resources = Resources::from(vec![volume("v2")]);
        checkpoint_json(&paths.resources_target(), &resources)
            .await
            .unwrap();

        let recovered = checkpoint.recover_target().await.unwrap();
        assert_eq!(recovered, Some(resources.clone()));
        assert!(paths.volume_root("web", "v2").is_dir());
        assert_eq!(checkpoint.committed().await.unwrap(), resources);
        assert!(checkpoint.target().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn boot_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::new(dir.path());

        assert!(read_boot_id(&paths).await.unwrap().is_none());
        write_boot_id(&paths, "boot-1").await.unwrap();
        assert_eq!(
            read_boot_id(&paths).await.unwrap(),
            Some("boot-1".to_string())
        );
    }
}
