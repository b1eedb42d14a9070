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

use crate::checkpoint::{self, AgentPaths, ResourcesCheckpoint};
use crate::config::AgentFlags;
use crate::containerizer::{ContainerLaunchConfig, Containerizer};
use crate::executor::{
    Executor, ExecutorConnection, ExecutorState, Framework, LiveTask, PendingLaunch,
    PendingTermination, QueuedItem, MAX_COMPLETED_FRAMEWORKS,
};
use crate::gc::DirectoryGarbageCollector;
use crate::operation::OperationTracker;
use crate::status_update::{AckOutcome, StatusUpdateManager};
use async_trait::async_trait;
use moraine_core::{
    AgentCapabilities, AgentId, ContainerId, ExecutorId, FrameworkId, OperationId, Resource,
    ResourceVersion, Resources, RoleName, TaskId, UpdateUuid,
};
use protocols::{
    AgentInfo, AgentToExecutor, AgentToMaster, ExecutorInfo, FrameworkInfo, KillPolicy,
    Operation, OperationState, OperationStatus, ResourceVersions, StatusUpdate,
    StatusUpdateReason, TaskGroupInfo, TaskInfo, TaskState, TaskStatus, TaskSummary,
    UpdateSource,
};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_REGISTRATION_BACKOFF: Duration = Duration::from_secs(60);
const STATUS_RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-task authorization at the agent; re-authorization here is deliberate
/// so host-level ACLs hold even when the master was compromised.
#[async_trait]
pub trait TaskAuthorizer: Send + Sync {
    async fn authorize(&self, framework: &FrameworkInfo, task: &TaskInfo) -> bool;
}

/// Authorizer used when no ACLs are configured.
pub struct PermissiveAuthorizer;

#[async_trait]
impl TaskAuthorizer for PermissiveAuthorizer {
    async fn authorize(&self, _framework: &FrameworkInfo, _task: &TaskInfo) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycleState {
    Recovering,
    Disconnected,
    Running,
    Terminating,
}

/// Timer and watch requests the agent emits; the runtime turns them into
/// sleeps and containerizer waits and feeds the results back in. Keeping
/// the core free of spawned timers makes every flow deterministic in tests.
#[derive(Debug)]
pub enum AgentEffect {
    ScheduleTimer { after: Duration, timer: AgentTimer },
    WatchContainer {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    },
    Authorize {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        task_ids: Vec<TaskId>,
    },
    /// The agent asked to exit with the given code.
    Exit { code: i32 },
}

#[derive(Debug, Clone)]
pub enum AgentTimer {
    RegistrationAttempt,
    PingTimeout,
    StatusRetrySweep,
    GcSweep,
    ExecutorRegistrationTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    },
    ExecutorReregistrationTimeout,
    ExecutorReconnectRetry,
    ExecutorShutdownGraceExpired {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    },
}

/// Process-wide identity and configuration, bundled so every flow reads the
/// same view.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub flags: AgentFlags,
    pub info: AgentInfo,
    pub capabilities: AgentCapabilities,
    pub boot_id: String,
}

/// The agent-side state machine: registration, task and executor lifecycle,
/// status update forwarding, operation handling. One instance per process,
/// driven serially by the runtime.
pub struct Agent {
    context: AgentContext,
    paths: AgentPaths,
    state: AgentLifecycleState,
    agent_id: Option<AgentId>,

    containerizer: Arc<dyn Containerizer>,
    authorizer: Arc<dyn TaskAuthorizer>,

    master: mpsc::UnboundedSender<AgentToMaster>,
    effects: mpsc::UnboundedSender<AgentEffect>,

    pub(crate) frameworks: HashMap<FrameworkId, Framework>,
    completed_frameworks: VecDeque<FrameworkId>,

    status_updates: StatusUpdateManager,
    operations: OperationTracker,
    gc: DirectoryGarbageCollector,
    resources_checkpoint: ResourcesCheckpoint,

    total_resources: Resources,
    checkpointed_resources: Resources,
    resource_versions: ResourceVersions,

    registration_attempts: u32,
    ping_timeout: Duration,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: AgentContext,
        containerizer: Arc<dyn Containerizer>,
        authorizer: Arc<dyn TaskAuthorizer>,
        master: mpsc::UnboundedSender<AgentToMaster>,
        effects: mpsc::UnboundedSender<AgentEffect>,
    ) -> Self {
        let paths = AgentPaths::new(&context.flags.work_dir);
        let status_updates = StatusUpdateManager::new(master.clone());
        let total_resources = context.info.resources.clone();
        Self {
            resources_checkpoint: ResourcesCheckpoint::new(paths.clone()),
            paths,
            context,
            state: AgentLifecycleState::Recovering,
            agent_id: None,
            containerizer,
            authorizer,
            master,
            effects,
            frameworks: HashMap::new(),
            completed_frameworks: VecDeque::new(),
            status_updates,
            operations: OperationTracker::new(),
            gc: DirectoryGarbageCollector::new(),
            total_resources,
            checkpointed_resources: Resources::new(),
            resource_versions: ResourceVersions {
                agent_default: Some(ResourceVersion::generate()),
                providers: Default::default(),
            },
            registration_attempts: 0,
            ping_timeout: Duration::from_secs(75),
        }
    }

    pub fn state(&self) -> AgentLifecycleState {
        self.state
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        self.agent_id.as_ref()
    }

    pub fn resource_versions(&self) -> &ResourceVersions {
        &self.resource_versions
    }

    pub fn total_resources(&self) -> &Resources {
        &self.total_resources
    }

    pub(crate) fn set_recovered_identity(&mut self, agent_id: AgentId) {
        self.agent_id = Some(agent_id);
    }

    pub(crate) fn set_recovered_resources(&mut self, checkpointed: Resources) {
        self.total_resources += &checkpointed;
        self.checkpointed_resources = checkpointed;
    }

    pub(crate) fn restore_framework(&mut self, framework: Framework) {
        self.frameworks.insert(framework.id.clone(), framework);
    }

    pub(crate) fn status_updates_mut(&mut self) -> &mut StatusUpdateManager {
        &mut self.status_updates
    }

    pub(crate) fn paths(&self) -> &AgentPaths {
        &self.paths
    }

    pub(crate) fn containerizer(&self) -> Arc<dyn Containerizer> {
        Arc::clone(&self.containerizer)
    }

    /// Payload for an off-actor authorization of a pending launch.
    pub(crate) fn pending_launch_payload(
        &self,
        framework_id: &FrameworkId,
        first_task: Option<&TaskId>,
    ) -> Option<(FrameworkInfo, Vec<TaskInfo>)> {
        let framework = self.frameworks.get(framework_id)?;
        let index = framework.pending_launch_containing(first_task?)?;
        let launch = &framework.pending[index];
        Some((framework.info.clone(), launch.tasks.clone()))
    }

    pub(crate) fn schedule_timer(&self, after: Duration, timer: AgentTimer) {
        self.schedule(after, timer);
    }

    pub(crate) fn context(&self) -> &AgentContext {
        &self.context
    }

    // ---- Master connection ----------------------------------------------

    /// Recovery finished: begin looking for a master.
    pub fn finish_recovery(&mut self) {
        assert_eq!(self.state, AgentLifecycleState::Recovering);
        self.state = AgentLifecycleState::Disconnected;
        info!("Recovery complete; entering disconnected state");
    }

    /// A (new) master was detected; register after a backoff that spreads
    /// the stampede of a whole cluster reconnecting at once.
    pub fn detected_master(&mut self) {
        if self.state == AgentLifecycleState::Terminating {
            return;
        }
        if self.state == AgentLifecycleState::Running {
            self.transition_to_disconnected();
        }
        self.registration_attempts = 0;
        let backoff = self.registration_backoff();
        debug!(?backoff, "Master detected; scheduling registration");
        self.schedule(backoff, AgentTimer::RegistrationAttempt);
    }

    fn registration_backoff(&mut self) -> Duration {
        self.registration_attempts = self.registration_attempts.saturating_add(1);
        let factor = self.context.flags.registration_backoff_factor;
        let ceiling = factor
            .saturating_mul(2u32.saturating_pow(self.registration_attempts.min(16)))
            .min(MAX_REGISTRATION_BACKOFF);
        // U[0, ceiling): random jitter, not synchronised ticks.
        let nanos = ceiling.as_nanos().max(1) as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
    }

    pub fn attempt_registration(&mut self) {
        if !matches!(self.state, AgentLifecycleState::Disconnected) {
            return;
        }

        let message = match &self.agent_id {
            None => AgentToMaster::Register {
                info: self.context.info.clone(),
                capabilities: self.context.capabilities,
                checkpointed_resources: self.checkpointed_resources.clone(),
                resource_version: self
                    .resource_versions
                    .agent_default
                    .expect("agent default version always set"),
            },
            Some(agent_id) => AgentToMaster::Reregister {
                info: AgentInfo {
                    id: Some(agent_id.clone()),
                    ..self.context.info.clone()
                },
                capabilities: self.context.capabilities,
                checkpointed_resources: self.checkpointed_resources.clone(),
                resource_version: self
                    .resource_versions
                    .agent_default
                    .expect("agent default version always set"),
                tasks: self.live_task_summaries(),
                executors: self.live_executor_infos(),
                frameworks: self
                    .frameworks
                    .values()
                    .map(|framework| framework.info.clone())
                    .collect(),
                completed_frameworks: self.completed_frameworks.iter().cloned().collect(),
            },
        };

        let _ = self.master.send(message);

        // Retry until the master answers; the next attempt backs off
        // further.
        let backoff = self.registration_backoff();
        self.schedule(backoff, AgentTimer::RegistrationAttempt);
    }

    pub async fn handle_registered(&mut self, agent_id: AgentId, ping_timeout: Duration) {
        match self.state {
            AgentLifecycleState::Disconnected => {}
            _ => {
                debug!(state = ?self.state, "Ignoring registration reply");
                return;
            }
        }

        assert!(
            self.agent_id.is_none() || self.agent_id.as_ref() == Some(&agent_id),
            "master assigned a different agent id"
        );

        info!(agent = %agent_id, "Registered with master");
        self.agent_id = Some(agent_id.clone());
        self.state = AgentLifecycleState::Running;
        self.ping_timeout = ping_timeout;
        self.registration_attempts = 0;

        let info_path = self.paths.agent_info(&agent_id);
        let info = AgentInfo {
            id: Some(agent_id.clone()),
            ..self.context.info.clone()
        };
        checkpoint::checkpoint_json(&info_path, &info)
            .await
            .unwrap_or_else(|e| panic!("failed to checkpoint agent info: {e}"));
        checkpoint::update_symlink(
            &self.paths.latest_agent_symlink(),
            &self.paths.agent_meta(&agent_id),
        )
        .await
        .unwrap_or_else(|e| panic!("failed to update latest agent symlink: {e}"));
        checkpoint::write_boot_id(&self.paths, &self.context.boot_id)
            .await
            .unwrap_or_else(|e| panic!("failed to checkpoint boot id: {e}"));

        self.status_updates.resume();
        self.schedule(self.ping_timeout, AgentTimer::PingTimeout);
        self.schedule(STATUS_RETRY_SWEEP_INTERVAL, AgentTimer::StatusRetrySweep);
    }

    pub async fn handle_reregistered(&mut self, agent_id: AgentId, ping_timeout: Duration) {
        if self.state != AgentLifecycleState::Disconnected {
            debug!(state = ?self.state, "Ignoring re-registration reply");
            return;
        }
        assert_eq!(
            self.agent_id.as_ref(),
            Some(&agent_id),
            "re-registered under a different agent id"
        );

        info!(agent = %agent_id, "Re-registered with master");
        self.state = AgentLifecycleState::Running;
        self.ping_timeout = ping_timeout;
        self.registration_attempts = 0;

        self.status_updates.resume();
        self.schedule(self.ping_timeout, AgentTimer::PingTimeout);
        self.schedule(STATUS_RETRY_SWEEP_INTERVAL, AgentTimer::StatusRetrySweep);
    }

    /// Authentication or registration refusal is fatal: exiting preserves
    /// live executors, which a kill-and-restart would not.
    pub fn handle_registration_refused(&mut self, message: String) {
        warn!(%message, "Master refused registration; exiting");
        let _ = self.effects.send(AgentEffect::Exit { code: 1 });
    }

    pub fn handle_ping(&mut self, _connected: bool) {
        if self.state == AgentLifecycleState::Running {
            // Each ping re-arms the timeout; expiry triggers re-detection.
            self.schedule(self.ping_timeout, AgentTimer::PingTimeout);
        }
    }

    pub fn master_lost(&mut self) {
        if self.state == AgentLifecycleState::Running {
            self.transition_to_disconnected();
        }
    }

    fn transition_to_disconnected(&mut self) {
        info!("Lost the master; agent is disconnected");
        self.state = AgentLifecycleState::Disconnected;
        // Updates keep accumulating and checkpointing, but nothing is
        // forwarded until we re-register.
        self.status_updates.pause();
    }

    // ---- Task launch path ----------------------------------------------

    pub async fn run_task(
        &mut self,
        framework_info: FrameworkInfo,
        executor: ExecutorInfo,
        task: TaskInfo,
        resource_versions: ResourceVersions,
    ) {
        self.run_task_group(
            framework_info,
            executor,
            TaskGroupInfo { tasks: vec![task] },
            resource_versions,
            false,
        )
        .await;
    }

    /// Accepts a task group launch. The group is recorded as pending and an
    /// authorization effect is emitted; the launch continues in
    /// `continue_task_launch` once the decision arrives.
    pub async fn run_task_group(
        &mut self,
        framework_info: FrameworkInfo,
        executor: ExecutorInfo,
        mut task_group: TaskGroupInfo,
        resource_versions: ResourceVersions,
        as_group: bool,
    ) {
        if matches!(
            self.state,
            AgentLifecycleState::Recovering | AgentLifecycleState::Terminating
        ) {
            warn!(
                state = ?self.state,
                "Ignoring task launch while recovering or terminating"
            );
            return;
        }

        let framework_id = framework_info
            .id
            .clone()
            .expect("launches carry a framework id");

        // Resources flow through the agent with an explicit allocation
        // role; inject it for single-role frameworks whose master predates
        // the field.
        let default_role = framework_info.roles.first().cloned();
        for task in &mut task_group.tasks {
            inject_allocation_role(&mut task.resources, &default_role);
        }
        let mut executor = executor;
        inject_allocation_role(&mut executor.resources, &default_role);

        // Offers the launch was based on must match the resource versions
        // in force; a reconnected provider invalidates them.
        if !self.resource_versions.matches(&resource_versions) {
            let partition_aware = framework_info.capabilities.partition_aware;
            for task in &task_group.tasks {
                self.forward_synthesized_update(
                    &framework_id,
                    &task.task_id,
                    None,
                    dropped_or_lost(partition_aware),
                    StatusUpdateReason::InvalidOffers,
                    "Task launched with stale resource versions",
                ).await;
            }
            return;
        }

        // Every checkpointed resource the launch uses must be known.
        let mut bundle = executor.resources.clone();
        for task in &task_group.tasks {
            bundle += &task.resources;
        }
        let unknown = checkpointed_portion(&bundle)
            .filter(|resource| !self.checkpointed_resources.contains_resource(resource));
        if !unknown.is_empty() {
            let partition_aware = framework_info.capabilities.partition_aware;
            for task in &task_group.tasks {
                self.forward_synthesized_update(
                    &framework_id,
                    &task.task_id,
                    None,
                    dropped_or_lost(partition_aware),
                    StatusUpdateReason::ResourcesUnknown,
                    "Task uses checkpointed resources unknown to the agent",
                ).await;
            }
            return;
        }

        let agent_id = self.agent_id.clone().expect("running agent has an id");
        let framework = self
            .frameworks
            .entry(framework_id.clone())
            .or_insert_with(|| Framework::new(framework_id.clone(), framework_info.clone()));

        if framework.terminating {
            warn!(framework = %framework_id, "Ignoring launch for terminating framework");
            return;
        }

        // A framework coming back to life rescues its directories from GC.
        let work_dir = self.paths.framework_work_dir(&agent_id, &framework_id);
        let meta_dir = self.paths.framework_meta(&agent_id, &framework_id);
        self.gc.unschedule(&work_dir);
        self.gc.unschedule(&meta_dir);

        let task_ids = task_group.task_ids();
        let executor_id = executor.executor_id.clone();

        self.frameworks
            .get_mut(&framework_id)
            .expect("inserted above")
            .pending
            .push(PendingLaunch {
                executor,
                tasks: task_group.tasks,
                as_group,
            });

        let _ = self.effects.send(AgentEffect::Authorize {
            framework_id,
            executor_id,
            task_ids,
        });
    }

    /// Continues a launch once authorization completed. The pending record
    /// may be gone: a kill raced the authorization and already answered.
    pub async fn continue_task_launch(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        task_ids: Vec<TaskId>,
        authorized: bool,
    ) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        let Some(first) = task_ids.first() else {
            return;
        };
        let Some(index) = framework.pending_launch_containing(first) else {
            debug!(framework = %framework_id, "Pending launch disappeared; kill raced it");
            return;
        };

        let launch = framework.pending.remove(index);
        let partition_aware = framework.info.capabilities.partition_aware;
        let as_group = launch.as_group;

        if !authorized {
            let reason = if as_group {
                StatusUpdateReason::TaskGroupUnauthorized
            } else {
                StatusUpdateReason::TaskUnauthorized
            };
            // One unauthorized task fails the whole group.
            for task in &launch.tasks {
                self.forward_synthesized_update(
                    &framework_id,
                    &task.task_id,
                    None,
                    TaskState::Error,
                    reason,
                    "Task authorization failed at the agent",
                ).await;
            }
            return;
        }

        if self.state == AgentLifecycleState::Terminating {
            return;
        }

        let agent_id = self.agent_id.clone().expect("running agent has an id");
        let framework = self.frameworks.get_mut(&framework_id).expect("exists");

        // Locate or create the executor.
        if !framework.executors.contains_key(&executor_id) {
            let container_id = ContainerId::generate();
            let directory = self.paths.executor_work_dir(
                &agent_id,
                &framework_id,
                &executor_id,
                &container_id,
            );
            let checkpointing = framework.info.checkpoint;
            let user = launch.executor.command.user.clone();

            let executor = Executor::new(
                launch.executor.clone(),
                container_id.clone(),
                directory.clone(),
                checkpointing,
                user.clone(),
            );
            framework.executors.insert(executor_id.clone(), executor);

            if checkpointing {
                let info_path = self.paths.executor_info(
                    &agent_id,
                    &framework_id,
                    &executor_id,
                    &container_id,
                );
                checkpoint::checkpoint_json(&info_path, &launch.executor)
                    .await
                    .unwrap_or_else(|e| panic!("failed to checkpoint executor info: {e}"));
                checkpoint::update_symlink(
                    &self
                        .paths
                        .latest_run_symlink(&agent_id, &framework_id, &executor_id),
                    &self
                        .paths
                        .run_meta(&agent_id, &framework_id, &executor_id, &container_id),
                )
                .await
                .unwrap_or_else(|e| panic!("failed to update latest run symlink: {e}"));
                let framework_info_path = self.paths.framework_info(&agent_id, &framework_id);
                let framework_info = self.frameworks[&framework_id].info.clone();
                checkpoint::checkpoint_json(&framework_info_path, &framework_info)
                    .await
                    .unwrap_or_else(|e| panic!("failed to checkpoint framework info: {e}"));
            }

            let launch_config = ContainerLaunchConfig {
                container_id: container_id.clone(),
                executor: launch.executor.clone(),
                command: launch.executor.command.clone(),
                directory,
                user,
                resources: launch.executor.resources.clone(),
            };

            if let Err(e) = self.containerizer.launch(launch_config).await {
                warn!(executor = %executor_id, error = %e, "Container launch failed");
                for task in &launch.tasks {
                    self.forward_synthesized_update(
                        &framework_id,
                        &task.task_id,
                        Some(&executor_id),
                        if partition_aware {
                            TaskState::Failed
                        } else {
                            TaskState::Lost
                        },
                        StatusUpdateReason::ContainerLaunchFailed,
                        &format!("Failed to launch container: {e}"),
                    ).await;
                }
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework.executors.remove(&executor_id);
                }
                return;
            }

            let _ = self.effects.send(AgentEffect::WatchContainer {
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
                container_id: container_id.clone(),
            });
            self.schedule(
                self.context.flags.executor_registration_timeout,
                AgentTimer::ExecutorRegistrationTimeout {
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                    container_id,
                },
            );
        }

        let framework = self.frameworks.get_mut(&framework_id).expect("exists");
        let executor = framework
            .executors
            .get_mut(&executor_id)
            .expect("located or created above");

        match executor.state {
            ExecutorState::Terminating | ExecutorState::Terminated => {
                for task in &launch.tasks {
                    self.forward_synthesized_update(
                        &framework_id,
                        &task.task_id,
                        Some(&executor_id),
                        dropped_or_lost(partition_aware),
                        StatusUpdateReason::ExecutorTerminated,
                        "Executor is terminating",
                    ).await;
                }
            }
            ExecutorState::Registering => {
                let item = if as_group {
                    QueuedItem::Group(TaskGroupInfo {
                        tasks: launch.tasks,
                    })
                } else {
                    QueuedItem::Task(launch.tasks.into_iter().next().expect("one task"))
                };
                executor.queue(item);
                self.checkpoint_queued_tasks(&framework_id, &executor_id).await;
            }
            ExecutorState::Running => {
                let item = if as_group {
                    QueuedItem::Group(TaskGroupInfo {
                        tasks: launch.tasks,
                    })
                } else {
                    QueuedItem::Task(launch.tasks.into_iter().next().expect("one task"))
                };
                executor.queue(item);
                self.checkpoint_queued_tasks(&framework_id, &executor_id).await;
                self.deliver_queued_tasks(&framework_id, &executor_id).await;
            }
        }
    }

    /// Publishes the executor's new resource envelope to the containerizer
    /// and hands every queued item to the executor. A failed update
    /// destroys the container.
    async fn deliver_queued_tasks(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(executor) = framework.executors.get_mut(executor_id) else {
            return;
        };
        if executor.state != ExecutorState::Running || executor.queued.is_empty() {
            return;
        }

        let container_id = executor.container_id.clone();
        let resources = executor.allocated_resources();

        if let Err(e) = self.containerizer.update(&container_id, &resources).await {
            warn!(executor = %executor_id, error = %e, "Container update failed; destroying");
            let framework = self.frameworks.get_mut(framework_id).expect("exists");
            let executor = framework.executors.get_mut(executor_id).expect("exists");
            executor.state = ExecutorState::Terminating;
            executor.pending_termination = Some(PendingTermination {
                state: TaskState::Lost,
                reason: StatusUpdateReason::ContainerUpdateFailed,
                message: format!("Container update failed: {e}"),
            });
            let _ = self.containerizer.destroy(&container_id).await;
            return;
        }

        let framework = self.frameworks.get_mut(framework_id).expect("exists");
        let executor = framework.executors.get_mut(executor_id).expect("exists");

        for item in executor.take_queued() {
            match &item {
                QueuedItem::Task(task) => {
                    executor.launched.insert(
                        task.task_id.clone(),
                        LiveTask::new(task.clone()),
                    );
                    executor.connection.send(AgentToExecutor::RunTask {
                        framework_id: framework_id.clone(),
                        task: task.clone(),
                    });
                }
                QueuedItem::Group(group) => {
                    for task in &group.tasks {
                        executor
                            .launched
                            .insert(task.task_id.clone(), LiveTask::new(task.clone()));
                    }
                    executor.connection.send(AgentToExecutor::LaunchGroup {
                        framework_id: framework_id.clone(),
                        task_group: group.clone(),
                    });
                }
            }
        }
    }

    // ---- Kill path ------------------------------------------------------

    pub async fn kill_task(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        kill_policy: Option<KillPolicy>,
    ) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(task = %task_id, "Kill for unknown framework ignored");
            return;
        };
        let partition_aware = framework.info.capabilities.partition_aware;

        // Still pending: authorization has not finished. The whole group is
        // answered synchronously and the launch continuation finds nothing.
        if let Some(index) = framework.pending_launch_containing(&task_id) {
            let launch = framework.pending.remove(index);
            for task in &launch.tasks {
                self.forward_synthesized_update(
                    &framework_id,
                    &task.task_id,
                    None,
                    TaskState::Killed,
                    StatusUpdateReason::TaskKilledDuringLaunch,
                    "Task killed before delivery to the executor",
                ).await;
            }
            return;
        }

        let Some(executor_id) = framework.executor_of_task(&task_id).cloned() else {
            warn!(task = %task_id, "Kill for unknown task ignored");
            return;
        };
        let executor = framework.executors.get_mut(&executor_id).expect("exists");

        // Queued on the executor: the item (and with it the whole group)
        // dies before delivery.
        if executor.has_queued(&task_id) {
            let item = executor
                .dequeue_item_containing(&task_id)
                .expect("queued item present");
            for task in item.tasks() {
                self.forward_synthesized_update(
                    &framework_id,
                    &task.task_id,
                    Some(&executor_id),
                    TaskState::Killed,
                    StatusUpdateReason::TaskKilledDuringLaunch,
                    "Task killed before delivery to the executor",
                ).await;
            }

            // An executor left with nothing to run is shut down rather than
            // leaked.
            let framework = self.frameworks.get_mut(&framework_id).expect("exists");
            let executor = framework.executors.get_mut(&executor_id).expect("exists");
            if executor.launched.is_empty() && executor.queued.is_empty() {
                self.shutdown_executor(&framework_id, &executor_id).await;
            }
            return;
        }

        // Delivered: the executor owns the kill; if the task belonged to a
        // group whose other members are still queued, those die here too.
        if executor.launched.contains_key(&task_id) {
            let delivered = executor.connection.send(AgentToExecutor::KillTask {
                task_id: task_id.clone(),
                kill_policy,
            });
            if !delivered {
                debug!(
                    task = %task_id,
                    "Kill for task on disconnected executor; postponed until re-subscription"
                );
            }
            return;
        }

        // Already terminated and awaiting acknowledgement: nothing to do.
        debug!(task = %task_id, "Kill for task that already terminated ignored");
    }

    // ---- Executor registration / subscription ---------------------------

    /// A framework's executor registered (pid) or subscribed (HTTP).
    pub async fn handle_executor_subscribed(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        connection: ExecutorConnection,
        unacknowledged_updates: Vec<StatusUpdate>,
        unacknowledged_tasks: Vec<TaskInfo>,
    ) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(executor = %executor_id, "Subscription from unknown framework");
            return;
        };
        let Some(executor) = framework.executors.get_mut(&executor_id) else {
            warn!(executor = %executor_id, "Subscription from unknown executor");
            return;
        };

        match executor.state {
            ExecutorState::Terminating | ExecutorState::Terminated => {
                warn!(executor = %executor_id, "Subscription from terminating executor");
                return;
            }
            ExecutorState::Running => {
                warn!(executor = %executor_id, "Duplicate subscription ignored");
                return;
            }
            ExecutorState::Registering => {}
        }

        let was_recovered = !executor.connection.is_connected()
            && (!unacknowledged_updates.is_empty()
                || !unacknowledged_tasks.is_empty()
                || !executor.launched.is_empty());

        executor.connection = connection;

        // All tasks were killed while the executor started: nothing to run,
        // nothing to wait for.
        if executor.queued.is_empty() && executor.launched.is_empty() && !was_recovered {
            info!(
                executor = %executor_id,
                "Executor registered with no queued work; shutting it down"
            );
            self.shutdown_executor(&framework_id, &executor_id).await;
            return;
        }

        if executor.checkpoint && executor.connection.is_http() {
            let agent_id = self.agent_id.clone().expect("running agent has an id");
            let container_id = executor.container_id.clone();
            let marker =
                self.paths
                    .http_marker(&agent_id, &framework_id, &executor_id, &container_id);
            checkpoint::write_marker(&marker)
                .await
                .unwrap_or_else(|e| panic!("failed to write http marker: {e}"));
        }

        let executor = self
            .frameworks
            .get_mut(&framework_id)
            .expect("exists")
            .executors
            .get_mut(&executor_id)
            .expect("exists");
        executor.state = ExecutorState::Running;

        let subscribed = AgentToExecutor::Subscribed {
            executor: executor.info.clone(),
            framework: self.frameworks[&framework_id].info.clone(),
            agent: self.context.info.clone(),
            container_id: self.frameworks[&framework_id].executors[&executor_id]
                .container_id
                .clone(),
        };
        self.frameworks[&framework_id].executors[&executor_id]
            .connection
            .send(subscribed);

        // Replay anything the executor still holds from before an agent
        // restart; the manager deduplicates by uuid.
        for update in unacknowledged_updates {
            self.handle_executor_update(update).await;
        }

        // Any launched task still STAGING that the executor does not know
        // about was lost in the restart window.
        if was_recovered {
            let framework = self.frameworks.get_mut(&framework_id).expect("exists");
            let partition_aware = framework.info.capabilities.partition_aware;
            let executor = framework.executors.get_mut(&executor_id).expect("exists");
            let known: Vec<TaskId> = unacknowledged_tasks
                .iter()
                .map(|task| task.task_id.clone())
                .collect();
            let dropped: Vec<TaskId> = executor
                .launched
                .iter()
                .filter(|(task_id, task)| {
                    task.state == TaskState::Staging && !known.contains(task_id)
                })
                .map(|(task_id, _)| task_id.clone())
                .collect();
            for task_id in dropped {
                let executor = self
                    .frameworks
                    .get_mut(&framework_id)
                    .expect("exists")
                    .executors
                    .get_mut(&executor_id)
                    .expect("exists");
                executor.terminate_task(&task_id);
                self.forward_synthesized_update(
                    &framework_id,
                    &task_id,
                    Some(&executor_id),
                    dropped_or_lost(partition_aware),
                    StatusUpdateReason::AgentRestarted,
                    "Task was lost during agent restart",
                ).await;
            }
        }

        self.deliver_queued_tasks(&framework_id, &executor_id).await;
    }

    // ---- Status update path ---------------------------------------------

    /// An update arriving from an executor (or synthesised upstream of us).
    pub async fn handle_executor_update(&mut self, mut update: StatusUpdate) {
        let Some(agent_id) = self.agent_id.clone() else {
            warn!("Dropping status update before registration");
            return;
        };
        if update.agent_id != agent_id {
            warn!(
                got = %update.agent_id,
                "Dropping status update with mismatched agent id"
            );
            return;
        }

        let framework_id = update.framework_id.clone();
        let task_id = update.task_id().clone();

        if update.status.uuid.is_none() {
            update.status.uuid = Some(UpdateUuid::generate());
        }

        let checkpoint_path = self.update_stream_path(&framework_id, &task_id);

        // A task still pending authorization can only be answered by
        // removing it; there is no executor state to maintain yet.
        if let Some(framework) = self.frameworks.get_mut(&framework_id) {
            if let Some(index) = framework.pending_launch_containing(&task_id) {
                let launch = &mut framework.pending[index];
                launch.tasks.retain(|task| task.task_id != task_id);
                if launch.tasks.is_empty() {
                    framework.pending.remove(index);
                }
                update.latest_state = Some(update.status.state);
                self.status_updates
                    .update(update, checkpoint_path)
                    .await
                    .unwrap_or_else(|e| panic!("failed to checkpoint status update: {e}"));
                return;
            }
        }

        let executor_id = self
            .frameworks
            .get(&framework_id)
            .and_then(|framework| framework.executor_of_task(&task_id).cloned());

        match executor_id {
            None => {
                // Unknown executor: forward as-is, nothing to maintain.
                debug!(task = %task_id, "Status update for unknown executor");
                update.latest_state = Some(update.status.state);
                self.status_updates
                    .update(update, checkpoint_path)
                    .await
                    .unwrap_or_else(|e| panic!("failed to checkpoint status update: {e}"));
            }
            Some(executor_id) => {
                let framework = self.frameworks.get_mut(&framework_id).expect("exists");
                let executor = framework.executors.get_mut(&executor_id).expect("exists");

                // At-least-once delivery: a retransmit can arrive after the
                // terminal update was acknowledged and the task retired.
                // Re-ack the executor's copy rather than reopening a
                // finished stream.
                if executor.is_retired(&task_id) {
                    debug!(task = %task_id, "Dropping status update for retired task");
                    if let Some(uuid) = update.status.uuid {
                        executor.connection.send(
                            AgentToExecutor::StatusUpdateAcknowledgement {
                                task_id: task_id.clone(),
                                uuid,
                            },
                        );
                    }
                    return;
                }

                let new_state = update.status.state;
                let mut container_to_update = None;

                if let Some(task) = executor.launched.get_mut(&task_id) {
                    // A terminal state is final; later transitions are
                    // bookkeeping errors from the executor and are ignored.
                    if task.state.is_terminal() {
                        warn!(
                            task = %task_id,
                            from = ?task.state,
                            to = ?new_state,
                            "Ignoring transition out of a terminal state"
                        );
                        return;
                    }
                    task.state = new_state;
                    task.latest_status = Some(update.status.clone());

                    if new_state.is_terminal() {
                        executor.terminate_task(&task_id);
                        // Release the task's resources before the update
                        // reaches the master, so the next offer reflects
                        // them.
                        container_to_update = Some((
                            executor.container_id.clone(),
                            executor.allocated_resources(),
                        ));
                    }
                } else if let Some(task) = executor.terminated.get_mut(&task_id) {
                    if new_state != task.state {
                        warn!(
                            task = %task_id,
                            from = ?task.state,
                            to = ?new_state,
                            "Ignoring transition out of a terminal state"
                        );
                        return;
                    }
                }

                if let Some((container_id, resources)) = container_to_update {
                    if let Err(e) = self.containerizer.update(&container_id, &resources).await {
                        warn!(
                            container = %container_id,
                            error = %e,
                            "Failed to release resources of terminal task"
                        );
                    }
                }

                update.latest_state = self
                    .frameworks
                    .get(&framework_id)
                    .and_then(|framework| framework.executors.get(&executor_id))
                    .and_then(|executor| {
                        executor
                            .launched
                            .get(&task_id)
                            .or_else(|| executor.terminated.get(&task_id))
                            .map(|task| task.state)
                    })
                    .or(Some(new_state));

                self.status_updates
                    .update(update, checkpoint_path)
                    .await
                    .unwrap_or_else(|e| panic!("failed to checkpoint status update: {e}"));
            }
        }
    }

    /// Acknowledgement from the master, forwarded to the executor and, for
    /// terminal updates, completing the task's lifetime.
    pub async fn handle_status_update_acknowledgement(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: UpdateUuid,
    ) {
        let outcome = self
            .status_updates
            .acknowledgement(&framework_id, &task_id, uuid)
            .await
            .unwrap_or_else(|e| panic!("failed to checkpoint acknowledgement: {e}"));

        if outcome == AckOutcome::Ignored {
            return;
        }

        // Forward the ack so the executor can drop its copy.
        if let Some(framework) = self.frameworks.get(&framework_id) {
            if let Some(executor_id) = framework.executor_of_task(&task_id) {
                framework.executors[executor_id].connection.send(
                    AgentToExecutor::StatusUpdateAcknowledgement {
                        task_id: task_id.clone(),
                        uuid,
                    },
                );
            }
        }

        if outcome == AckOutcome::StreamFinished {
            self.complete_task(&framework_id, &task_id).await;
        }
    }

    async fn complete_task(&mut self, framework_id: &FrameworkId, task_id: &TaskId) {
        let agent_id = self.agent_id.clone().expect("running agent has an id");
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(executor_id) = framework.executor_of_task(task_id).cloned() else {
            return;
        };
        let executor = framework.executors.get_mut(&executor_id).expect("exists");
        let container_id = executor.container_id.clone();
        let checkpointing = executor.checkpoint;

        executor.complete_task(task_id);

        if checkpointing {
            let sentinel = self.paths.task_sentinel(
                &agent_id,
                framework_id,
                &executor_id,
                &container_id,
                task_id,
            );
            checkpoint::write_marker(&sentinel)
                .await
                .unwrap_or_else(|e| panic!("failed to write task sentinel: {e}"));
        }

        self.remove_executor_if_done(framework_id, &executor_id).await;
    }

    // ---- Executor termination -------------------------------------------

    /// The container of an executor terminated (reported by the
    /// containerizer wait). Live and queued tasks receive terminal updates
    /// and the executor is retired once everything is acknowledged.
    pub async fn handle_container_terminated(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        exit_status: Option<i32>,
        containerizer_message: Option<String>,
    ) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        let Some(executor) = framework.executors.get_mut(&executor_id) else {
            return;
        };
        if executor.container_id != container_id {
            // A stale wait from a previous run of this executor.
            return;
        }

        info!(
            executor = %executor_id,
            exit_status = ?exit_status,
            "Executor container terminated"
        );

        executor.state = ExecutorState::Terminated;
        let termination = executor.pending_termination.clone();
        let framework_terminating = framework.terminating;
        let partition_aware = framework.info.capabilities.partition_aware;

        let (state, reason, message) = match termination {
            Some(pending) => (pending.state, pending.reason, pending.message),
            None => (
                if partition_aware {
                    TaskState::Failed
                } else {
                    TaskState::Lost
                },
                StatusUpdateReason::ExecutorTerminated,
                match &containerizer_message {
                    Some(msg) => format!("Executor terminated: {msg}"),
                    None => "Executor terminated".to_string(),
                },
            ),
        };

        // Every task that never reached a terminal state dies with the
        // executor; a terminating framework already knows.
        if !framework_terminating {
            let executor = self
                .frameworks
                .get_mut(&framework_id)
                .expect("exists")
                .executors
                .get_mut(&executor_id)
                .expect("exists");

            let queued: Vec<TaskId> = executor.queued_task_ids();
            let launched: Vec<TaskId> = executor.launched.keys().cloned().collect();

            executor.take_queued();
            for task_id in launched.iter() {
                executor.terminate_task(task_id);
            }

            for task_id in queued.iter().chain(launched.iter()) {
                self.forward_synthesized_update(
                    &framework_id,
                    task_id,
                    Some(&executor_id),
                    state,
                    reason,
                    &message,
                ).await;
            }
        }

        // The synthesised default executor's exit is implementation detail;
        // frameworks hear about their own executors only.
        let is_custom = matches!(
            self.frameworks[&framework_id].executors[&executor_id].info.kind,
            protocols::ExecutorKind::Custom
        );
        if is_custom && !framework_terminating {
            if let Some(agent_id) = self.agent_id.clone() {
                let _ = self.master.send(AgentToMaster::ExitedExecutor {
                    agent_id,
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                    status: exit_status.unwrap_or(-1),
                });
            }
        }

        self.schedule_executor_gc(&framework_id, &executor_id).await;
        self.remove_executor_if_done(&framework_id, &executor_id).await;
    }

    async fn schedule_executor_gc(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let Some(agent_id) = self.agent_id.clone() else {
            return;
        };
        let Some(framework) = self.frameworks.get(framework_id) else {
            return;
        };
        let Some(executor) = framework.executors.get(executor_id) else {
            return;
        };

        let delay = self.context.flags.gc_delay;
        let now = Instant::now();
        let work_run = executor.directory.clone();
        let meta_run = self.paths.run_meta(
            &agent_id,
            framework_id,
            executor_id,
            &executor.container_id,
        );
        self.gc.schedule(work_run, delay, now);
        self.gc.schedule(meta_run, delay, now);
        self.schedule(delay, AgentTimer::GcSweep);
    }

    /// Retires a TERMINATED executor once its last terminal update is
    /// acknowledged, and the framework once its last executor is gone.
    async fn remove_executor_if_done(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) {
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(executor) = framework.executors.get(executor_id) else {
            return;
        };
        if executor.state != ExecutorState::Terminated || !executor.is_idle() {
            return;
        }

        info!(executor = %executor_id, "Removing terminated executor");
        framework.executors.remove(executor_id);
        framework.retire_executor(executor_id);

        if framework.is_idle() && framework.terminating {
            self.remove_framework(framework_id).await;
        }
    }

    async fn remove_framework(&mut self, framework_id: &FrameworkId) {
        let Some(framework) = self.frameworks.remove(framework_id) else {
            return;
        };
        info!(framework = %framework_id, "Removing framework");

        if self.completed_frameworks.len() >= MAX_COMPLETED_FRAMEWORKS {
            self.completed_frameworks.pop_front();
        }
        self.completed_frameworks.push_back(framework.id.clone());

        if let Some(agent_id) = self.agent_id.clone() {
            let delay = self.context.flags.gc_delay;
            let now = Instant::now();
            self.gc.schedule(
                self.paths.framework_work_dir(&agent_id, framework_id),
                delay,
                now,
            );
            self.gc.schedule(
                self.paths.framework_meta(&agent_id, framework_id),
                delay,
                now,
            );
            self.schedule(delay, AgentTimer::GcSweep);
        }
    }

    // ---- Shutdown paths -------------------------------------------------

    pub async fn shutdown_executor(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(executor) = framework.executors.get_mut(executor_id) else {
            return;
        };
        if matches!(
            executor.state,
            ExecutorState::Terminating | ExecutorState::Terminated
        ) {
            return;
        }

        info!(executor = %executor_id, "Shutting down executor");
        executor.state = ExecutorState::Terminating;

        let grace = executor.shutdown_grace_period(self.context.flags.executor_shutdown_grace_period);
        executor
            .connection
            .send(AgentToExecutor::Shutdown { grace_period: grace });

        let container_id = executor.container_id.clone();
        self.schedule(
            grace,
            AgentTimer::ExecutorShutdownGraceExpired {
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
                container_id,
            },
        );
    }

    pub async fn shutdown_framework(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework = %framework_id, "Shutdown for unknown framework ignored");
            return;
        };

        info!(framework = %framework_id, "Shutting down framework");
        framework.terminating = true;
        framework.pending.clear();

        let executor_ids: Vec<ExecutorId> = framework.executors.keys().cloned().collect();
        for executor_id in executor_ids {
            self.shutdown_executor(&framework_id, &executor_id).await;
        }

        if self
            .frameworks
            .get(&framework_id)
            .is_some_and(Framework::is_idle)
        {
            self.remove_framework(&framework_id).await;
        }
    }

    pub async fn shutdown(&mut self) {
        info!("Agent asked to shut down");
        self.state = AgentLifecycleState::Terminating;

        let framework_ids: Vec<FrameworkId> = self.frameworks.keys().cloned().collect();
        for framework_id in framework_ids {
            let executor_ids: Vec<ExecutorId> = self.frameworks[&framework_id]
                .executors
                .keys()
                .cloned()
                .collect();
            for executor_id in executor_ids {
                self.shutdown_executor(&framework_id, &executor_id).await;
            }
        }
    }

    // ---- Reconciliation -------------------------------------------------

    /// Tasks the master believes run here but the agent does not know get a
    /// terminal reconciliation update.
    pub async fn reconcile_tasks(&mut self, tasks: Vec<(FrameworkId, TaskId)>) {
        for (framework_id, task_id) in tasks {
            let known = self
                .frameworks
                .get(&framework_id)
                .is_some_and(|framework| framework.has_task(&task_id));
            if known {
                continue;
            }

            let partition_aware = self
                .frameworks
                .get(&framework_id)
                .map(|framework| framework.info.capabilities.partition_aware)
                .unwrap_or(false);

            self.forward_synthesized_update(
                &framework_id,
                &task_id,
                None,
                dropped_or_lost(partition_aware),
                StatusUpdateReason::Reconciliation,
                "Task is unknown to the agent",
            ).await;
        }
    }

    // ---- Operations -----------------------------------------------------

    /// Applies a resource operation. Speculative operations take effect on
    /// the agent's totals immediately, are checkpointed target-then-commit,
    /// and report OPERATION_FINISHED straight away.
    pub async fn apply_operation(&mut self, operation: Operation) {
        let operation_id = operation.operation_id;
        self.operations.track(operation.clone());

        if !operation.info.is_speculative() {
            // Provider-backed: forwarded to the provider, which reports
            // back asynchronously through UpdateOperationStatus.
            debug!(operation = %operation_id, "Forwarded non-speculative operation");
            return;
        }

        let conversions = operation
            .info
            .conversions()
            .unwrap_or_else(|e| panic!("speculative operation with invalid payload: {e}"));

        let updated_total = self
            .total_resources
            .apply(&conversions)
            .unwrap_or_else(|e| panic!("speculative operation failed to apply: {e}"));
        self.total_resources = updated_total;
        self.checkpointed_resources = checkpointed_portion(&self.total_resources);

        // Target-then-commit; a failure here exits and the next start
        // retries from the target.
        self.resources_checkpoint
            .checkpoint(&self.checkpointed_resources)
            .await
            .unwrap_or_else(|e| panic!("failed to checkpoint resources: {e}"));

        let status = OperationStatus::new(operation_id, OperationState::Finished);
        self.operations.record_status(status.clone());

        if let Some(agent_id) = self.agent_id.clone() {
            let _ = self.master.send(AgentToMaster::UpdateOperationStatus {
                agent_id,
                framework_id: operation.framework_id.clone(),
                status,
            });
        }

        // Speculative operations do not await an acknowledgement.
        self.operations.remove(&operation_id);
    }

    /// Master's explicit checkpoint of reserved resources and volumes
    /// (legacy path predating typed operations).
    pub async fn checkpoint_resources(&mut self, resources: Resources) {
        let current = checkpointed_portion(&self.total_resources);
        self.total_resources -= current;
        self.total_resources += &resources;
        self.checkpointed_resources = resources;

        self.resources_checkpoint
            .checkpoint(&self.checkpointed_resources)
            .await
            .unwrap_or_else(|e| panic!("failed to checkpoint resources: {e}"));
    }

    /// A status update for a provider-backed operation arrived.
    pub fn handle_operation_status(&mut self, status: OperationStatus) {
        let forwarded = self.operations.record_status(status.clone()).map(|op| {
            (op.framework_id.clone(), op.agent_id.clone())
        });
        if let Some((framework_id, agent_id)) = forwarded {
            let _ = self.master.send(AgentToMaster::UpdateOperationStatus {
                agent_id,
                framework_id,
                status,
            });
        }
    }

    pub fn acknowledge_operation_status(&mut self, operation_id: OperationId) {
        self.operations.acknowledge(&operation_id);
    }

    pub fn reconcile_operations(&mut self, operation_ids: Vec<OperationId>) {
        let statuses = self.operations.reconcile(&operation_ids);
        let Some(agent_id) = self.agent_id.clone() else {
            return;
        };
        for status in statuses {
            let _ = self.master.send(AgentToMaster::UpdateOperationStatus {
                agent_id: agent_id.clone(),
                framework_id: None,
                status,
            });
        }
    }

    // ---- Timers ---------------------------------------------------------

    pub async fn handle_timer(&mut self, timer: AgentTimer) {
        match timer {
            AgentTimer::RegistrationAttempt => self.attempt_registration(),
            AgentTimer::PingTimeout => {
                if self.state == AgentLifecycleState::Running {
                    warn!("Master ping timed out; re-detecting");
                    self.transition_to_disconnected();
                    self.detected_master();
                }
            }
            AgentTimer::StatusRetrySweep => {
                self.status_updates.retry_due(Instant::now());
                if self.state == AgentLifecycleState::Running {
                    self.schedule(STATUS_RETRY_SWEEP_INTERVAL, AgentTimer::StatusRetrySweep);
                }
            }
            AgentTimer::GcSweep => {
                let due = self.gc.take_due(Instant::now());
                for path in due {
                    let _ = crate::gc::remove_path(&path).await;
                }
            }
            AgentTimer::ExecutorRegistrationTimeout {
                framework_id,
                executor_id,
                container_id,
            } => {
                self.executor_registration_timed_out(framework_id, executor_id, container_id)
                    .await;
            }
            AgentTimer::ExecutorReregistrationTimeout => {
                self.executor_reregistration_timed_out().await;
            }
            AgentTimer::ExecutorReconnectRetry => {
                self.retry_executor_reconnects();
            }
            AgentTimer::ExecutorShutdownGraceExpired {
                framework_id,
                executor_id,
                container_id,
            } => {
                let still_up = self
                    .frameworks
                    .get(&framework_id)
                    .and_then(|framework| framework.executors.get(&executor_id))
                    .is_some_and(|executor| {
                        executor.container_id == container_id
                            && executor.state == ExecutorState::Terminating
                    });
                if still_up {
                    info!(executor = %executor_id, "Shutdown grace expired; destroying container");
                    let _ = self.containerizer.destroy(&container_id).await;
                }
            }
        }
    }

    async fn executor_registration_timed_out(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    ) {
        let still_registering = self
            .frameworks
            .get(&framework_id)
            .and_then(|framework| framework.executors.get(&executor_id))
            .is_some_and(|executor| {
                executor.container_id == container_id
                    && executor.state == ExecutorState::Registering
            });
        if !still_registering {
            return;
        }

        warn!(
            executor = %executor_id,
            "Executor did not register in time; destroying container"
        );

        let framework = self.frameworks.get_mut(&framework_id).expect("exists");
        let partition_aware = framework.info.capabilities.partition_aware;
        let executor = framework.executors.get_mut(&executor_id).expect("exists");
        executor.state = ExecutorState::Terminating;
        executor.pending_termination = Some(PendingTermination {
            state: gone_or_lost(partition_aware),
            reason: StatusUpdateReason::ExecutorRegistrationTimeout,
            message: "Executor did not register within the allowed time".to_string(),
        });

        let _ = self.containerizer.destroy(&container_id).await;
    }

    async fn executor_reregistration_timed_out(&mut self) {
        let mut to_destroy = Vec::new();
        for (framework_id, framework) in &self.frameworks {
            let partition_aware = framework.info.capabilities.partition_aware;
            for (executor_id, executor) in &framework.executors {
                if executor.state == ExecutorState::Registering
                    && !executor.connection.is_connected()
                {
                    to_destroy.push((
                        framework_id.clone(),
                        executor_id.clone(),
                        executor.container_id.clone(),
                        partition_aware,
                    ));
                }
            }
        }

        for (framework_id, executor_id, container_id, partition_aware) in to_destroy {
            warn!(
                executor = %executor_id,
                "Executor did not re-register after agent restart; destroying container"
            );
            let framework = self.frameworks.get_mut(&framework_id).expect("exists");
            let executor = framework.executors.get_mut(&executor_id).expect("exists");
            executor.state = ExecutorState::Terminating;
            executor.pending_termination = Some(PendingTermination {
                state: gone_or_lost(partition_aware),
                reason: StatusUpdateReason::ExecutorReregistrationTimeout,
                message: "Executor did not re-register after agent restart".to_string(),
            });
            let _ = self.containerizer.destroy(&container_id).await;
        }
    }

    /// Periodic re-send of ReconnectExecutor to pid-based executors that
    /// have not answered; the first message may have been dropped.
    fn retry_executor_reconnects(&mut self) {
        let Some(agent_id) = self.agent_id.clone() else {
            return;
        };
        let mut any_waiting = false;
        for framework in self.frameworks.values() {
            for executor in framework.executors.values() {
                if executor.state == ExecutorState::Registering
                    && matches!(executor.connection, ExecutorConnection::Pid { .. })
                {
                    any_waiting = true;
                    executor.connection.send(AgentToExecutor::Reconnect {
                        agent_id: agent_id.clone(),
                    });
                }
            }
        }
        if any_waiting {
            if let Some(interval) = self.context.flags.executor_reregistration_retry_interval {
                self.schedule(interval, AgentTimer::ExecutorReconnectRetry);
            }
        }
    }

    // ---- Helpers --------------------------------------------------------

    fn schedule(&self, after: Duration, timer: AgentTimer) {
        let _ = self
            .effects
            .send(AgentEffect::ScheduleTimer { after, timer });
    }

    fn update_stream_path(
        &self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
    ) -> Option<std::path::PathBuf> {
        let agent_id = self.agent_id.as_ref()?;
        let framework = self.frameworks.get(framework_id)?;
        if !framework.info.checkpoint {
            return None;
        }
        let executor_id = framework.executor_of_task(task_id)?;
        let executor = framework.executors.get(executor_id)?;
        Some(self.paths.task_updates(
            agent_id,
            framework_id,
            executor_id,
            &executor.container_id,
            task_id,
        ))
    }

    /// Emits an agent-sourced update into the reliable forwarding path.
    pub(crate) async fn forward_synthesized_update(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        executor_id: Option<&ExecutorId>,
        state: TaskState,
        reason: StatusUpdateReason,
        message: &str,
    ) {
        let Some(agent_id) = self.agent_id.clone() else {
            warn!(task = %task_id, "Dropping synthesized update before registration");
            return;
        };

        let mut status = TaskStatus::new(task_id.clone(), state, UpdateSource::Agent);
        status.reason = Some(reason);
        status.message = Some(message.to_string());
        status.agent_id = Some(agent_id.clone());
        status.executor_id = executor_id.cloned();
        status.uuid = Some(UpdateUuid::generate());

        let update = StatusUpdate {
            framework_id: framework_id.clone(),
            agent_id,
            status,
            latest_state: Some(state),
        };

        let checkpoint_path = self.update_stream_path(framework_id, task_id);
        self.status_updates
            .update(update, checkpoint_path)
            .await
            .unwrap_or_else(|e| panic!("failed to checkpoint synthesized update: {e}"));
    }

    fn live_task_summaries(&self) -> Vec<TaskSummary> {
        let mut summaries = Vec::new();
        for framework in self.frameworks.values() {
            for executor in framework.executors.values() {
                for task in executor.launched.values() {
                    summaries.push(TaskSummary {
                        task: task.info.clone(),
                        framework_id: framework.id.clone(),
                        executor_id: executor.id.clone(),
                        state: task.state,
                    });
                }
                for task in executor.terminated.values() {
                    summaries.push(TaskSummary {
                        task: task.info.clone(),
                        framework_id: framework.id.clone(),
                        executor_id: executor.id.clone(),
                        state: task.state,
                    });
                }
            }
        }
        summaries
    }

    fn live_executor_infos(&self) -> Vec<ExecutorInfo> {
        self.frameworks
            .values()
            .flat_map(|framework| framework.executors.values())
            .filter(|executor| executor.state != ExecutorState::Terminated)
            .map(|executor| executor.info.clone())
            .collect()
    }

    async fn checkpoint_queued_tasks(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let Some(agent_id) = self.agent_id.as_ref() else {
            return;
        };
        let Some(framework) = self.frameworks.get(framework_id) else {
            return;
        };
        if !framework.info.checkpoint {
            return;
        }
        let Some(executor) = framework.executors.get(executor_id) else {
            return;
        };

        for item in &executor.queued {
            for task in item.tasks() {
                let path = self.paths.task_info(
                    agent_id,
                    framework_id,
                    executor_id,
                    &executor.container_id,
                    &task.task_id,
                );
                checkpoint::checkpoint_json(&path, task)
                    .await
                    .unwrap_or_else(|e| panic!("failed to checkpoint task info: {e}"));
            }
        }
    }
}

fn inject_allocation_role(resources: &mut Resources, default_role: &Option<RoleName>) {
    let Some(role) = default_role else {
        return;
    };
    let needs_injection = resources.iter().any(|r| r.allocation_role.is_none());
    if !needs_injection {
        return;
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
}

/// Resources that must survive an agent restart: dynamic reservations and
/// persistent volumes.
pub fn checkpointed_portion(resources: &Resources) -> Resources {
    resources.filter(|resource| {
        resource.is_persistent_volume()
            || resource
                .reservations
                .iter()
                .any(|reservation| reservation.kind == moraine_core::ReservationKind::Dynamic)
    })
}

pub fn dropped_or_lost(partition_aware: bool) -> TaskState {
    if partition_aware {
        TaskState::Dropped
    } else {
        TaskState::Lost
    }
}

pub fn gone_or_lost(partition_aware: bool) -> TaskState {
    if partition_aware {
        TaskState::Gone
    } else {
        TaskState::Lost
    }
}

/// The agent-synthesised executor used for command tasks launched without
/// an explicit executor.
pub fn command_executor_info(framework_id: &FrameworkId, task: &TaskInfo) -> ExecutorInfo {
    ExecutorInfo {
        executor_id: ExecutorId::new(task.task_id.as_str()),
        framework_id: framework_id.clone(),
        kind: protocols::ExecutorKind::Default,
        resources: Resources::new(),
        command: task.command.clone().unwrap_or_default(),
        shutdown_grace_period: None,
    }
}
