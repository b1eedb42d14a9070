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
use clap::Parser;
use moraine_agent::{
    Agent, AgentContext, AgentEffect, AgentFlags, ContainerLaunchConfig, ContainerStatus,
    ContainerTermination, Containerizer, ContainerizerResult, ExecutorConnection,
    PermissiveAuthorizer, RecoveryEngine, TaskAuthorizer,
};
use moraine_core::{
    AgentCapabilities, AgentId, ContainerId, ExecutorId, FrameworkCapabilities, FrameworkId,
    Resource, ResourceVersion, Resources, RoleName, TaskId, UpdateUuid,
};
use protocols::{
    AgentToExecutor, AgentToMaster, CommandInfo, ExecutorInfo, ExecutorKind, FrameworkInfo,
    ResourceVersions, StatusUpdate, StatusUpdateReason, TaskGroupInfo, TaskInfo, TaskState,
    TaskStatus, UpdateSource,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeContainerizer {
    launched: Mutex<Vec<ContainerId>>,
    destroyed: Mutex<Vec<ContainerId>>,
    updated: Mutex<Vec<ContainerId>>,
}

#[async_trait]
impl Containerizer for FakeContainerizer {
    async fn recover(&self, known: Vec<ContainerId>) -> ContainerizerResult<Vec<ContainerId>> {
        Ok(known)
    }

    async fn launch(&self, config: ContainerLaunchConfig) -> ContainerizerResult<()> {
        self.launched.lock().unwrap().push(config.container_id);
        Ok(())
    }

    async fn update(
        &self,
        container_id: &ContainerId,
        _resources: &Resources,
    ) -> ContainerizerResult<()> {
        self.updated.lock().unwrap().push(container_id.clone());
        Ok(())
    }

    async fn wait(&self, _container_id: &ContainerId) -> ContainerizerResult<ContainerTermination> {
        Ok(ContainerTermination {
            exit_status: Some(0),
            killed: false,
            message: None,
        })
    }

    async fn destroy(&self, container_id: &ContainerId) -> ContainerizerResult<()> {
        self.destroyed.lock().unwrap().push(container_id.clone());
        Ok(())
    }

    async fn status(&self, container_id: &ContainerId) -> ContainerizerResult<ContainerStatus> {
        Ok(ContainerStatus {
            container_id: container_id.clone(),
            executor_pid: None,
        })
    }

    async fn usage(&self, _container_id: &ContainerId) -> ContainerizerResult<Resources> {
        Ok(Resources::new())
    }

    async fn containers(&self) -> ContainerizerResult<Vec<ContainerId>> {
        Ok(Vec::new())
    }
}

struct Fixture {
    agent: Agent,
    containerizer: Arc<FakeContainerizer>,
    master_rx: mpsc::UnboundedReceiver<AgentToMaster>,
    effects_rx: mpsc::UnboundedReceiver<AgentEffect>,
}

fn context(work_dir: &Path) -> AgentContext {
    let flags = AgentFlags::parse_from([
        "agentd",
        "--work-dir",
        work_dir.to_str().unwrap(),
    ]);
    AgentContext {
        flags,
        info: protocols::AgentInfo {
            id: None,
            hostname: "worker-1.example.org".to_string(),
            port: 5051,
            domain: None,
            resources: Resources::from(vec![
                Resource::scalar("cpus", 8.0),
                Resource::scalar("mem", 8192.0),
            ]),
            attributes: BTreeMap::new(),
        },
        capabilities: AgentCapabilities {
            multi_role: true,
            hierarchical_role: true,
            resource_provider: false,
        },
        boot_id: "boot-1".to_string(),
    }
}

fn fixture(work_dir: &Path) -> Fixture {
    let (master_tx, master_rx) = mpsc::unbounded_channel();
    let (effects_tx, effects_rx) = mpsc::unbounded_channel();
    let containerizer = Arc::new(FakeContainerizer::default());
    let authorizer: Arc<dyn TaskAuthorizer> = Arc::new(PermissiveAuthorizer);

    let agent = Agent::new(
        context(work_dir),
        containerizer.clone(),
        authorizer,
        master_tx,
        effects_tx,
    );

    Fixture {
        agent,
        containerizer,
        master_rx,
        effects_rx,
    }
}

async fn registered_fixture(work_dir: &Path) -> Fixture {
    let mut fixture = fixture(work_dir);
    RecoveryEngine::recover(&mut fixture.agent).await.unwrap();
    fixture
        .agent
        .handle_registered(AgentId::new("agent-1"), Duration::from_secs(75))
        .await;
    fixture
}

fn framework_info(checkpoint: bool) -> FrameworkInfo {
    FrameworkInfo {
        id: Some(FrameworkId::new("fw")),
        name: "framework".to_string(),
        user: "nobody".to_string(),
        roles: vec![RoleName::parse("web").unwrap()],
        capabilities: FrameworkCapabilities {
            partition_aware: true,
            multi_role: true,
            ..FrameworkCapabilities::default()
        },
        checkpoint,
        principal: None,
    }
}

fn executor_info(name: &str) -> ExecutorInfo {
    ExecutorInfo {
        executor_id: ExecutorId::new(name),
        framework_id: FrameworkId::new("fw"),
        kind: ExecutorKind::Custom,
        resources: Resources::from(vec![Resource::scalar("cpus", 0.1)]),
        command: CommandInfo::default(),
        shutdown_grace_period: None,
    }
}

fn task(name: &str, cpus: f64) -> TaskInfo {
    TaskInfo {
        task_id: TaskId::new(name),
        name: name.to_string(),
        agent_id: AgentId::new("agent-1"),
        resources: Resources::from(vec![Resource::scalar("cpus", cpus)]),
        command: Some(CommandInfo::default()),
        kill_policy: None,
        labels: BTreeMap::new(),
    }
}

fn group(names: &[&str]) -> TaskGroupInfo {
    TaskGroupInfo {
        tasks: names.iter().map(|name| task(name, 0.5)).collect(),
    }
}

fn drain_updates(rx: &mut mpsc::UnboundedReceiver<AgentToMaster>) -> Vec<StatusUpdate> {
    let mut updates = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let AgentToMaster::StatusUpdate { update } = message {
            updates.push(update);
        }
    }
    updates
}

fn authorize_effect(rx: &mut mpsc::UnboundedReceiver<AgentEffect>) -> Option<Vec<TaskId>> {
    while let Ok(effect) = rx.try_recv() {
        if let AgentEffect::Authorize { task_ids, .. } = effect {
            return Some(task_ids);
        }
    }
    None
}

#[tokio::test]
async fn killing_a_pending_group_member_kills_the_whole_group() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = registered_fixture(dir.path()).await;
    drain_updates(&mut fx.master_rx);

    let versions = fx.agent.resource_versions().clone();
    fx.agent
        .run_task_group(
            framework_info(false),
            executor_info("exec-1"),
            group(&["t1", "t2", "t3"]),
            versions,
            true,
        )
        .await;

    let task_ids = authorize_effect(&mut fx.effects_rx).expect("authorization requested");
    assert_eq!(task_ids.len(), 3);

    // The kill lands while authorization is still in flight.
    fx.agent
        .kill_task(FrameworkId::new("fw"), TaskId::new("t1"), None)
        .await;

    let updates = drain_updates(&mut fx.master_rx);
    assert_eq!(updates.len(), 3, "every group member receives an update");
    for update in &updates {
        assert_eq!(update.status.state, TaskState::Killed);
        assert_eq!(
            update.status.reason,
            Some(StatusUpdateReason::TaskKilledDuringLaunch)
        );
    }

    // The authorization continuation finds nothing to launch.
    fx.agent
        .continue_task_launch(
            FrameworkId::new("fw"),
            ExecutorId::new("exec-1"),
            task_ids,
            true,
        )
        .await;
    assert!(
        fx.containerizer.launched.lock().unwrap().is_empty(),
        "no container may be launched for a killed group"
    );
}

#[tokio::test]
async fn stale_resource_versions_drop_the_group_without_launching() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = registered_fixture(dir.path()).await;
    drain_updates(&mut fx.master_rx);

    let stale = ResourceVersions {
        agent_default: Some(ResourceVersion::generate()),
        providers: BTreeMap::new(),
    };
    fx.agent
        .run_task_group(
            framework_info(false),
            executor_info("exec-1"),
            group(&["t1", "t2"]),
            stale,
            true,
        )
        .await;

    let updates = drain_updates(&mut fx.master_rx);
    assert_eq!(updates.len(), 2);
    for update in &updates {
        // Partition-aware frameworks see DROPPED rather than LOST.
        assert_eq!(update.status.state, TaskState::Dropped);
        assert_eq!(
            update.status.reason,
            Some(StatusUpdateReason::InvalidOffers)
        );
    }
    assert!(fx.containerizer.launched.lock().unwrap().is_empty());
    assert!(authorize_effect(&mut fx.effects_rx).is_none());
}

/// Drives a task to RUNNING through the full launch path and returns the
/// executor-side channel plus the running update's uuid.
async fn launch_running_task(
    fx: &mut Fixture,
) -> (
    mpsc::UnboundedReceiver<AgentToExecutor>,
    UpdateUuid,
    ContainerId,
) {
    let versions = fx.agent.resource_versions().clone();
    fx.agent
        .run_task_group(
            framework_info(true),
            executor_info("exec-1"),
            group(&["t1"]),
            versions,
            true,
        )
        .await;

    let task_ids = authorize_effect(&mut fx.effects_rx).expect("authorization requested");
    fx.agent
        .continue_task_launch(
            FrameworkId::new("fw"),
            ExecutorId::new("exec-1"),
            task_ids,
            true,
        )
        .await;

    let container_id = fx
        .containerizer
        .launched
        .lock()
        .unwrap()
        .first()
        .cloned()
        .expect("container launched");

    let (executor_tx, executor_rx) = mpsc::unbounded_channel();
    fx.agent
        .handle_executor_subscribed(
            FrameworkId::new("fw"),
            ExecutorId::new("exec-1"),
            ExecutorConnection::Http {
                channel: executor_tx,
            },
            Vec::new(),
            Vec::new(),
        )
        .await;

    let mut status = TaskStatus::new(TaskId::new("t1"), TaskState::Running, UpdateSource::Executor);
    status.uuid = Some(UpdateUuid::generate());
    status.agent_id = Some(AgentId::new("agent-1"));
    status.executor_id = Some(ExecutorId::new("exec-1"));
    let uuid = status.uuid.unwrap();
    fx.agent
        .handle_executor_update(StatusUpdate {
            framework_id: FrameworkId::new("fw"),
            agent_id: AgentId::new("agent-1"),
            status,
            latest_state: Some(TaskState::Running),
        })
        .await;

    (executor_rx, uuid, container_id)
}

#[tokio::test]
async fn restart_replays_unacknowledged_updates_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();

    let running_uuid;
    {
        let mut fx = registered_fixture(dir.path()).await;
        let (mut executor_rx, uuid, _container) = launch_running_task(&mut fx).await;
        running_uuid = uuid;

        // The update reached the master but was never acknowledged.
        let updates = drain_updates(&mut fx.master_rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].uuid(), Some(running_uuid));

        // The executor received its work before the restart.
        let mut saw_launch = false;
        while let Ok(message) = executor_rx.try_recv() {
            if matches!(message, AgentToExecutor::LaunchGroup { .. }) {
                saw_launch = true;
            }
        }
        assert!(saw_launch);
        // The agent dies here with the update unacknowledged.
    }

    // A new agent process recovers from the same work dir.
    let mut fx = fixture(dir.path());
    RecoveryEngine::recover(&mut fx.agent).await.unwrap();
    assert_eq!(
        fx.agent.agent_id().map(|id| id.as_str().to_string()),
        Some("agent-1".to_string()),
        "identity survives the restart"
    );

    fx.agent
        .handle_reregistered(AgentId::new("agent-1"), Duration::from_secs(75))
        .await;

    // Re-registration replays exactly the unacknowledged update.
    let replayed = drain_updates(&mut fx.master_rx);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].uuid(), Some(running_uuid));
    assert_eq!(replayed[0].status.state, TaskState::Running);

    // The executor re-subscribes, replaying its own copy; the manager
    // deduplicates by uuid so the master sees nothing new.
    let (executor_tx, _executor_rx) = mpsc::unbounded_channel();
    fx.agent
        .handle_executor_subscribed(
            FrameworkId::new("fw"),
            ExecutorId::new("exec-1"),
            ExecutorConnection::Http {
                channel: executor_tx,
            },
            replayed.clone(),
            vec![task("t1", 0.5)],
        )
        .await;

    let after_resubscribe = drain_updates(&mut fx.master_rx);
    assert!(
        after_resubscribe.is_empty(),
        "duplicate updates must not reach the master again"
    );

    // Acknowledging the replayed update completes the stream.
    fx.agent
        .handle_status_update_acknowledgement(
            FrameworkId::new("fw"),
            TaskId::new("t1"),
            running_uuid,
        )
        .await;

    // A second, late acknowledgement is a no-op.
    fx.agent
        .handle_status_update_acknowledgement(
            FrameworkId::new("fw"),
            TaskId::new("t1"),
            running_uuid,
        )
        .await;
}

#[tokio::test]
async fn terminal_state_transitions_are_final() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = registered_fixture(dir.path()).await;
    let (_executor_rx, running_uuid, _container) = launch_running_task(&mut fx).await;
    drain_updates(&mut fx.master_rx);

    let mut finished =
        TaskStatus::new(TaskId::new("t1"), TaskState::Finished, UpdateSource::Executor);
    finished.uuid = Some(UpdateUuid::generate());
    fx.agent
        .handle_executor_update(StatusUpdate {
            framework_id: FrameworkId::new("fw"),
            agent_id: AgentId::new("agent-1"),
            status: finished,
            latest_state: Some(TaskState::Finished),
        })
        .await;

    // The stream forwards one update at a time; acknowledging RUNNING
    // releases FINISHED.
    fx.agent
        .handle_status_update_acknowledgement(
            FrameworkId::new("fw"),
            TaskId::new("t1"),
            running_uuid,
        )
        .await;

    // An update claiming the finished task went back to RUNNING is ignored.
    let mut bogus =
        TaskStatus::new(TaskId::new("t1"), TaskState::Running, UpdateSource::Executor);
    bogus.uuid = Some(UpdateUuid::generate());
    fx.agent
        .handle_executor_update(StatusUpdate {
            framework_id: FrameworkId::new("fw"),
            agent_id: AgentId::new("agent-1"),
            status: bogus,
            latest_state: Some(TaskState::Running),
        })
        .await;

    let updates = drain_updates(&mut fx.master_rx);
    assert_eq!(updates.len(), 1, "only the terminal update is forwarded");
    assert_eq!(updates[0].status.state, TaskState::Finished);
}

#[tokio::test]
async fn retransmits_after_completion_do_not_resurrect_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = registered_fixture(dir.path()).await;
    let (mut executor_rx, running_uuid, _container) = launch_running_task(&mut fx).await;
    drain_updates(&mut fx.master_rx);

    let mut finished =
        TaskStatus::new(TaskId::new("t1"), TaskState::Finished, UpdateSource::Executor);
    finished.uuid = Some(UpdateUuid::generate());
    let finished_uuid = finished.uuid.unwrap();
    let finished_update = StatusUpdate {
        framework_id: FrameworkId::new("fw"),
        agent_id: AgentId::new("agent-1"),
        status: finished,
        latest_state: Some(TaskState::Finished),
    };
    fx.agent.handle_executor_update(finished_update.clone()).await;

    // Acknowledge both updates; the terminal ack retires the task.
    fx.agent
        .handle_status_update_acknowledgement(
            FrameworkId::new("fw"),
            TaskId::new("t1"),
            running_uuid,
        )
        .await;
    fx.agent
        .handle_status_update_acknowledgement(
            FrameworkId::new("fw"),
            TaskId::new("t1"),
            finished_uuid,
        )
        .await;
    drain_updates(&mut fx.master_rx);
    while executor_rx.try_recv().is_ok() {}

    // A retransmit of the acknowledged terminal update arrives late. It
    // must be dropped with a fresh ack for the executor, not forwarded.
    fx.agent.handle_executor_update(finished_update).await;

    assert!(
        drain_updates(&mut fx.master_rx).is_empty(),
        "a retired task's update must not reach the master again"
    );

    let mut acked = None;
    while let Ok(message) = executor_rx.try_recv() {
        if let AgentToExecutor::StatusUpdateAcknowledgement { task_id, uuid } = message {
            acked = Some((task_id, uuid));
        }
    }
    assert_eq!(
        acked,
        Some((TaskId::new("t1"), finished_uuid)),
        "the executor is re-acked so it drops its copy"
    );
}

#[tokio::test]
async fn executor_registration_timeout_destroys_the_container() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = registered_fixture(dir.path()).await;

    let versions = fx.agent.resource_versions().clone();
    fx.agent
        .run_task_group(
            framework_info(false),
            executor_info("exec-1"),
            group(&["t1"]),
            versions,
            true,
        )
        .await;
    let task_ids = authorize_effect(&mut fx.effects_rx).expect("authorization requested");
    fx.agent
        .continue_task_launch(
            FrameworkId::new("fw"),
            ExecutorId::new("exec-1"),
            task_ids,
            true,
        )
        .await;

    let container_id = fx
        .containerizer
        .launched
        .lock()
        .unwrap()
        .first()
        .cloned()
        .expect("container launched");

    // The watchdog fires with the executor still unregistered.
    fx.agent
        .handle_timer(moraine_agent::AgentTimer::ExecutorRegistrationTimeout {
            framework_id: FrameworkId::new("fw"),
            executor_id: ExecutorId::new("exec-1"),
            container_id: container_id.clone(),
        })
        .await;

    assert_eq!(
        fx.containerizer.destroyed.lock().unwrap().as_slice(),
        &[container_id.clone()]
    );

    // The containerizer reports the termination; queued tasks die with the
    // registration-timeout reason.
    fx.agent
        .handle_container_terminated(
            FrameworkId::new("fw"),
            ExecutorId::new("exec-1"),
            container_id,
            None,
            None,
        )
        .await;

    let updates = drain_updates(&mut fx.master_rx);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status.state, TaskState::Gone);
    assert_eq!(
        updates[0].status.reason,
        Some(StatusUpdateReason::ExecutorRegistrationTimeout)
    );
}

#[tokio::test]
async fn unknown_tasks_are_reconciled_with_a_terminal_update() {
    let dir = tempfile::tempdir().unwrap();
    let mut fx = registered_fixture(dir.path()).await;
    drain_updates(&mut fx.master_rx);

    fx.agent
        .reconcile_tasks(vec![(FrameworkId::new("ghost"), TaskId::new("t-ghost"))])
        .await;

    let updates = drain_updates(&mut fx.master_rx);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status.state, TaskState::Lost);
    assert_eq!(
        updates[0].status.reason,
        Some(StatusUpdateReason::Reconciliation)
    );
}
