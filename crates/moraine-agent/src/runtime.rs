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

use crate::agent::{
    command_executor_info, Agent, AgentContext, AgentEffect, AgentTimer, TaskAuthorizer,
};
use crate::containerizer::Containerizer;
use crate::executor::ExecutorConnection;
use crate::recovery::RecoveryEngine;
use moraine_core::{ContainerId, ExecutorId, FrameworkId, TaskId};
use protocols::{AgentToMaster, ExecutorToAgent, MasterToAgent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Everything the serial agent loop consumes: master messages, executor
/// messages, timer firings, and completions of off-actor work.
#[derive(Debug)]
pub enum AgentMessage {
    FromMaster(MasterToAgent),
    FromExecutor {
        message: ExecutorToAgent,
        /// Present on Subscribe/Register: the channel the agent uses to
        /// reach this executor from now on.
        connection: Option<ExecutorConnection>,
    },
    MasterDetected,
    MasterLost,
    Timer(AgentTimer),
    ContainerTerminated {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        exit_status: Option<i32>,
        message: Option<String>,
    },
    AuthorizationComplete {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        task_ids: Vec<TaskId>,
        authorized: bool,
    },
}

/// Address of a running agent; transports feed messages in through this.
#[derive(Clone)]
pub struct AgentHandle {
    inbox: mpsc::UnboundedSender<AgentMessage>,
}

impl AgentHandle {
    pub fn deliver(&self, message: AgentMessage) {
        let _ = self.inbox.send(message);
    }
}

/// Owns the agent state machine and serialises everything that touches it.
/// Timers, containerizer waits, and authorization run off-actor; their
/// results come back through the inbox.
pub struct AgentRuntime {
    agent: Agent,
    authorizer: Arc<dyn TaskAuthorizer>,
    containerizer: Arc<dyn Containerizer>,
    inbox_tx: mpsc::UnboundedSender<AgentMessage>,
    inbox_rx: mpsc::UnboundedReceiver<AgentMessage>,
    effects_rx: mpsc::UnboundedReceiver<AgentEffect>,
}

impl AgentRuntime {
    pub fn new(
        context: AgentContext,
        containerizer: Arc<dyn Containerizer>,
        authorizer: Arc<dyn TaskAuthorizer>,
        master: mpsc::UnboundedSender<AgentToMaster>,
    ) -> (Self, AgentHandle) {
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let agent = Agent::new(
            context,
            Arc::clone(&containerizer),
            Arc::clone(&authorizer),
            master,
            effects_tx,
        );

        let handle = AgentHandle {
            inbox: inbox_tx.clone(),
        };

        (
            Self {
                agent,
                authorizer,
                containerizer,
                inbox_tx,
                inbox_rx,
                effects_rx,
            },
            handle,
        )
    }

    /// Recovers checkpointed state and then runs the serial loop forever.
    /// Returns the process exit code.
    pub async fn run(mut self) -> i32 {
        if let Err(e) = RecoveryEngine::recover(&mut self.agent).await {
            error!(error = %e, "Agent recovery failed");
            return 1;
        }

        info!("Agent runtime started");

        loop {
            tokio::select! {
                Some(effect) = self.effects_rx.recv() => {
                    if let Some(code) = self.handle_effect(effect) {
                        return code;
                    }
                }
                Some(message) = self.inbox_rx.recv() => {
                    self.handle_message(message).await;
                }
                else => return 0,
            }
        }
    }

    fn handle_effect(&mut self, effect: AgentEffect) -> Option<i32> {
        match effect {
            AgentEffect::ScheduleTimer { after, timer } => {
                let inbox = self.inbox_tx.clone();
                tokio::spawn(async move {
                    sleep(after).await;
                    let _ = inbox.send(AgentMessage::Timer(timer));
                });
            }
            AgentEffect::WatchContainer {
                framework_id,
                executor_id,
                container_id,
            } => {
                let inbox = self.inbox_tx.clone();
                let containerizer = Arc::clone(&self.containerizer);
                tokio::spawn(async move {
                    let outcome = containerizer.wait(&container_id).await;
                    let (exit_status, message) = match outcome {
                        Ok(termination) => (termination.exit_status, termination.message),
                        Err(e) => (None, Some(e.to_string())),
                    };
                    let _ = inbox.send(AgentMessage::ContainerTerminated {
                        framework_id,
                        executor_id,
                        container_id,
                        exit_status,
                        message,
                    });
                });
            }
            AgentEffect::Authorize {
                framework_id,
                executor_id,
                task_ids,
            } => {
                let Some((framework_info, tasks)) = self
                    .agent
                    .pending_launch_payload(&framework_id, task_ids.first())
                else {
                    return None;
                };
                let inbox = self.inbox_tx.clone();
                let authorizer = Arc::clone(&self.authorizer);
                tokio::spawn(async move {
                    let mut authorized = true;
                    for task in &tasks {
                        if !authorizer.authorize(&framework_info, task).await {
                            authorized = false;
                            break;
                        }
                    }
                    let _ = inbox.send(AgentMessage::AuthorizationComplete {
                        framework_id,
                        executor_id,
                        task_ids,
                        authorized,
                    });
                });
            }
            AgentEffect::Exit { code } => return Some(code),
        }
        None
    }

    async fn handle_message(&mut self, message: AgentMessage) {
        match message {
            AgentMessage::MasterDetected => self.agent.detected_master(),
            AgentMessage::MasterLost => self.agent.master_lost(),
            AgentMessage::Timer(timer) => self.agent.handle_timer(timer).await,
            AgentMessage::ContainerTerminated {
                framework_id,
                executor_id,
                container_id,
                exit_status,
                message,
            } => {
                self.agent
                    .handle_container_terminated(
                        framework_id,
                        executor_id,
                        container_id,
                        exit_status,
                        message,
                    )
                    .await;
            }
            AgentMessage::AuthorizationComplete {
                framework_id,
                executor_id,
                task_ids,
                authorized,
            } => {
                self.agent
                    .continue_task_launch(framework_id, executor_id, task_ids, authorized)
                    .await;
            }
            AgentMessage::FromMaster(message) => self.handle_master_message(message).await,
            AgentMessage::FromExecutor {
                message,
                connection,
            } => self.handle_executor_message(message, connection).await,
        }
    }

    async fn handle_master_message(&mut self, message: MasterToAgent) {
        match message {
            MasterToAgent::Registered {
                agent_id,
                ping_timeout,
            } => self.agent.handle_registered(agent_id, ping_timeout).await,
            MasterToAgent::Reregistered {
                agent_id,
                ping_timeout,
            } => self.agent.handle_reregistered(agent_id, ping_timeout).await,
            MasterToAgent::RegistrationRefused { message } => {
                self.agent.handle_registration_refused(message)
            }
            MasterToAgent::RunTask {
                framework,
                executor,
                task,
                resource_versions,
            } => {
                let framework_id = framework.id.clone().expect("launches carry a framework id");
                let executor =
                    executor.unwrap_or_else(|| command_executor_info(&framework_id, &task));
                self.agent
                    .run_task(framework, executor, task, resource_versions)
                    .await;
            }
            MasterToAgent::RunTaskGroup {
                framework,
                executor,
                task_group,
                resource_versions,
            } => {
                self.agent
                    .run_task_group(framework, executor, task_group, resource_versions, true)
                    .await;
            }
            MasterToAgent::KillTask {
                framework_id,
                task_id,
                kill_policy,
            } => self.agent.kill_task(framework_id, task_id, kill_policy).await,
            MasterToAgent::ShutdownExecutor {
                framework_id,
                executor_id,
            } => {
                self.agent
                    .shutdown_executor(&framework_id, &executor_id)
                    .await
            }
            MasterToAgent::ShutdownFramework { framework_id } => {
                self.agent.shutdown_framework(framework_id).await
            }
            MasterToAgent::CheckpointResources { resources } => {
                self.agent.checkpoint_resources(resources).await
            }
            MasterToAgent::ApplyOperation { operation } => {
                self.agent.apply_operation(operation).await
            }
            MasterToAgent::ReconcileOperations { operation_ids } => {
                self.agent.reconcile_operations(operation_ids)
            }
            MasterToAgent::AcknowledgeOperationStatus { operation_id, .. } => {
                self.agent.acknowledge_operation_status(operation_id)
            }
            MasterToAgent::StatusUpdateAcknowledgement {
                framework_id,
                task_id,
                uuid,
                ..
            } => {
                self.agent
                    .handle_status_update_acknowledgement(framework_id, task_id, uuid)
                    .await
            }
            MasterToAgent::UpdateFramework { framework } => {
                let framework_id = framework.id.clone().expect("updates carry a framework id");
                if let Some(record) = self.agent.frameworks.get_mut(&framework_id) {
                    record.info = framework;
                } else {
                    warn!(framework = %framework_id, "Update for unknown framework ignored");
                }
            }
            MasterToAgent::ReconcileTasks { tasks } => self.agent.reconcile_tasks(tasks).await,
            MasterToAgent::Ping { connected } => self.agent.handle_ping(connected),
            MasterToAgent::Shutdown { message } => {
                if let Some(message) = message {
                    info!(%message, "Shutdown requested by master");
                }
                self.agent.shutdown().await;
            }
        }
    }

    async fn handle_executor_message(
        &mut self,
        message: ExecutorToAgent,
        connection: Option<ExecutorConnection>,
    ) {
        match message {
            ExecutorToAgent::Subscribe {
                framework_id,
                executor_id,
                unacknowledged_updates,
                unacknowledged_tasks,
            } => {
                let Some(connection) = connection else {
                    warn!(executor = %executor_id, "Subscribe without a connection");
                    return;
                };
                self.agent
                    .handle_executor_subscribed(
                        framework_id,
                        executor_id,
                        connection,
                        unacknowledged_updates,
                        unacknowledged_tasks,
                    )
                    .await;
            }
            ExecutorToAgent::Register {
                framework_id,
                executor_id,
            } => {
                let Some(connection) = connection else {
                    warn!(executor = %executor_id, "Register without a connection");
                    return;
                };
                self.agent
                    .handle_executor_subscribed(
                        framework_id,
                        executor_id,
                        connection,
                        Vec::new(),
                        Vec::new(),
                    )
                    .await;
            }
            ExecutorToAgent::Reregister {
                framework_id,
                executor_id,
                tasks,
                unacknowledged_updates,
            } => {
                let Some(connection) = connection else {
                    warn!(executor = %executor_id, "Reregister without a connection");
                    return;
                };
                self.agent
                    .handle_executor_subscribed(
                        framework_id,
                        executor_id,
                        connection,
                        unacknowledged_updates,
                        tasks,
                    )
                    .await;
            }
            ExecutorToAgent::StatusUpdate { update } => {
                self.agent.handle_executor_update(update).await;
            }
        }
    }
}
