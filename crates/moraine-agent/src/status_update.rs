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

use crate::checkpoint::{CheckpointError, CheckpointResult};
use moraine_core::{FrameworkId, TaskId, UpdateUuid};
use protocols::{AgentToMaster, StatusUpdate, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

const RETRY_INTERVAL_MIN: Duration = Duration::from_secs(10);
const RETRY_INTERVAL_MAX: Duration = Duration::from_secs(10 * 60);

/// One checkpointed line in a task's `updates` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum StreamRecord {
    Update(StatusUpdate),
    Acknowledgement { uuid: UpdateUuid },
}

#[derive(Debug)]
struct UpdateStream {
    framework_id: FrameworkId,
    task_id: TaskId,
    checkpoint_path: Option<PathBuf>,
    /// Updates sent but not yet acknowledged, in emission order.
    pending: VecDeque<StatusUpdate>,
    /// Every uuid ever seen, for duplicate-update suppression.
    received: HashSet<UpdateUuid>,
    /// Every uuid ever acknowledged, for duplicate-ack suppression.
    acknowledged: HashSet<UpdateUuid>,
    /// Set once a terminal update enters the stream.
    terminated: bool,
    last_forwarded: Option<Instant>,
    attempts: u32,
}

impl UpdateStream {
    fn backoff(&self) -> Duration {
        let factor = 1u32 << self.attempts.saturating_sub(1).min(6);
        (RETRY_INTERVAL_MIN * factor).min(RETRY_INTERVAL_MAX)
    }
}

/// Outcome of processing an acknowledgement.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// More updates remain pending; the next was forwarded.
    StreamContinues,
    /// The terminal update was acknowledged; the task can be removed.
    StreamFinished,
    /// Duplicate or unknown acknowledgement; nothing changed.
    Ignored,
}

/// Reliable at-least-once forwarding of status updates to the master with
/// per-task ordering. Updates are forwarded one at a time per task: the next
/// pending update goes out only once its predecessor is acknowledged.
/// Forwarding pauses while the agent is disconnected and replays on
/// re-registration.
pub struct StatusUpdateManager {
    master: mpsc::UnboundedSender<AgentToMaster>,
    streams: HashMap<(FrameworkId, TaskId), UpdateStream>,
    paused: bool,
}

impl StatusUpdateManager {
    pub fn new(master: mpsc::UnboundedSender<AgentToMaster>) -> Self {
        Self {
            master,
            streams: HashMap::new(),
            paused: true,
        }
    }

    /// Accepts an update into its task's stream. Duplicates (by uuid) are
    /// dropped. When the stream has no predecessor outstanding and the
    /// manager is not paused, the update is forwarded immediately.
    pub async fn update(
        &mut self,
        update: StatusUpdate,
        checkpoint_path: Option<PathBuf>,
    ) -> CheckpointResult<()> {
        let uuid = update
            .uuid()
            .expect("status updates entering the manager carry a uuid");
        let key = (update.framework_id.clone(), update.task_id().clone());

        let stream = self.streams.entry(key.clone()).or_insert_with(|| {
            UpdateStream {
                framework_id: key.0.clone(),
                task_id: key.1.clone(),
                checkpoint_path: checkpoint_path.clone(),
                pending: VecDeque::new(),
                received: HashSet::new(),
                acknowledged: HashSet::new(),
                terminated: false,
                last_forwarded: None,
                attempts: 0,
            }
        });

        if stream.received.contains(&uuid) {
            debug!(task = %stream.task_id, %uuid, "Dropping duplicate status update");
            return Ok(());
        }

        if stream.terminated {
            warn!(
                task = %stream.task_id,
                state = ?update.status.state,
                "Dropping status update after terminal update"
            );
            return Ok(());
        }

        stream.received.insert(uuid);
        if update.status.state.is_terminal() {
            stream.terminated = true;
        }

        if let Some(path) = &stream.checkpoint_path {
            append_record(path, &StreamRecord::Update(update.clone())).await?;
        }

        stream.pending.push_back(update);

        if !self.paused && stream.pending.len() == 1 {
            let first = stream.pending.front().cloned().expect("just pushed");
            forward(&self.master, stream, first);
        }

        Ok(())
    }

    /// Processes an acknowledgement from the master. Late or repeated acks
    /// are idempotently ignored.
    pub async fn acknowledgement(
        &mut self,
        framework_id: &FrameworkId,
        task_id: &TaskId,
        uuid: UpdateUuid,
    ) -> CheckpointResult<AckOutcome> {
        let key = (framework_id.clone(), task_id.clone());
        let Some(stream) = self.streams.get_mut(&key) else {
            debug!(task = %task_id, %uuid, "Acknowledgement for unknown stream ignored");
            return Ok(AckOutcome::Ignored);
        };

        if stream.acknowledged.contains(&uuid) {
            debug!(task = %task_id, %uuid, "Duplicate acknowledgement ignored");
            return Ok(AckOutcome::Ignored);
        }

        let Some(front) = stream.pending.front() else {
            debug!(task = %task_id, %uuid, "Acknowledgement with nothing pending ignored");
            return Ok(AckOutcome::Ignored);
        };

        if front.uuid() != Some(uuid) {
            warn!(
                task = %task_id,
                %uuid,
                "Acknowledgement does not match the earliest pending update; ignored"
            );
            return Ok(AckOutcome::Ignored);
        }

        stream.acknowledged.insert(uuid);
        stream.pending.pop_front();
        stream.attempts = 0;
        stream.last_forwarded = None;

        if let Some(path) = &stream.checkpoint_path {
            append_record(path, &StreamRecord::Acknowledgement { uuid }).await?;
        }

        if let Some(next) = stream.pending.front().cloned() {
            if !self.paused {
                forward(&self.master, stream, next);
            }
            return Ok(AckOutcome::StreamContinues);
        }

        if stream.terminated {
            self.streams.remove(&key);
            return Ok(AckOutcome::StreamFinished);
        }

        Ok(AckOutcome::StreamContinues)
    }

    /// Stops forwarding while the master is unreachable. Updates continue to
    /// accumulate and checkpoint.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes forwarding, replaying the earliest pending update of every
    /// stream. The master deduplicates by uuid.
    pub fn resume(&mut self) {
        self.paused = false;
        for stream in self.streams.values_mut() {
            if let Some(front) = stream.pending.front().cloned() {
                forward(&self.master, stream, front);
            }
        }
    }

    /// Re-forwards updates whose acknowledgement is overdue, with capped
    /// exponential backoff per stream.
    pub fn retry_due(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        for stream in self.streams.values_mut() {
            let Some(front) = stream.pending.front().cloned() else {
                continue;
            };
            let due = stream
                .last_forwarded
                .map(|last| now >= last + stream.backoff())
                .unwrap_or(true);
            if due {
                debug!(
                    task = %stream.task_id,
                    attempts = stream.attempts,
                    "Retrying unacknowledged status update"
                );
                forward(&self.master, stream, front);
            }
        }
    }

    /// Rebuilds a stream from its checkpoint file during agent recovery.
    /// Returns the state of the last update seen, which is the task's
    /// recovered in-memory state.
    pub async fn recover_stream(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        checkpoint_path: PathBuf,
    ) -> CheckpointResult<Option<TaskState>> {
        let records = read_records(&checkpoint_path).await?;

        let mut stream = UpdateStream {
            framework_id: framework_id.clone(),
            task_id: task_id.clone(),
            checkpoint_path: Some(checkpoint_path),
            pending: VecDeque::new(),
            received: HashSet::new(),
            acknowledged: HashSet::new(),
            terminated: false,
            last_forwarded: None,
            attempts: 0,
        };

        let mut latest_state = None;
        for record in records {
            match record {
                StreamRecord::Update(update) => {
                    let uuid = update.uuid().expect("checkpointed updates carry a uuid");
                    if stream.received.insert(uuid) {
                        if update.status.state.is_terminal() {
                            stream.terminated = true;
                        }
                        latest_state = Some(update.status.state);
                        stream.pending.push_back(update);
                    }
                }
                StreamRecord::Acknowledgement { uuid } => {
                    stream.acknowledged.insert(uuid);
                    if stream.pending.front().and_then(StatusUpdate::uuid) == Some(uuid) {
                        stream.pending.pop_front();
                    }
                }
            }
        }

        debug!(
            task = %task_id,
            pending = stream.pending.len(),
            "Recovered status update stream"
        );

        self.streams.insert((framework_id, task_id), stream);
        Ok(latest_state)
    }

    /// Earliest unacknowledged update per stream, used to seed executor
    /// re-subscription and master re-registration.
    pub fn pending_updates(&self) -> Vec<StatusUpdate> {
        self.streams
            .values()
            .filter_map(|stream| stream.pending.front().cloned())
            .collect()
    }

    pub fn has_stream(&self, framework_id: &FrameworkId, task_id: &TaskId) -> bool {
        self.streams
            .contains_key(&(framework_id.clone(), task_id.clone()))
    }
}

fn forward(
    master: &mpsc::UnboundedSender<AgentToMaster>,
    stream: &mut UpdateStream,
    update: StatusUpdate,
) {
    stream.last_forwarded = Some(Instant::now());
    stream.attempts += 1;
    let _ = master.send(AgentToMaster::StatusUpdate { update });
}

async fn append_record(path: &Path, record: &StreamRecord) -> CheckpointResult<()> {
    let parent = path.parent().expect("update streams live under a task dir");
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| CheckpointError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;

    let mut line = serde_json::to_vec(record).expect("stream records serialise");
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    file.write_all(&line)
        .await
        .map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    file.flush().await.map_err(|e| CheckpointError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

async fn read_records(path: &Path) -> CheckpointResult<Vec<StreamRecord>> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let mut records = Vec::new();
    for line in body.lines().filter(|line| !line.is_empty()) {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            // A torn trailing line from a crash mid-append is expected;
            // everything before it is intact.
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping torn stream record");
                break;
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use moraine_core::AgentId;
    use protocols::{TaskState, TaskStatus, UpdateSource};

    fn update(task: &str, state: TaskState) -> StatusUpdate {
        let mut status = TaskStatus::new(TaskId::new(task), state, UpdateSource::Executor);
        status.uuid = Some(UpdateUuid::generate());
        status.timestamp = Utc::now();
        StatusUpdate {
            framework_id: FrameworkId::new("fw"),
            agent_id: AgentId::new("agent"),
            status,
            latest_state: Some(state),
        }
    }

    fn manager() -> (
        StatusUpdateManager,
        mpsc::UnboundedReceiver<AgentToMaster>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut manager = StatusUpdateManager::new(tx);
        manager.resume();
        (manager, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentToMaster>) -> Vec<StatusUpdate> {
        let mut updates = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let AgentToMaster::StatusUpdate { update } = message {
                updates.push(update);
            }
        }
        updates
    }

    #[tokio::test]
    async fn updates_forward_in_order_one_at_a_time() {
        let (mut manager, mut rx) = manager();

        let running = update("t1", TaskState::Running);
        let finished = update("t1", TaskState::Finished);

        manager.update(running.clone(), None).await.unwrap();
        manager.update(finished.clone(), None).await.unwrap();

        // Only the first goes out until it is acknowledged.
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].uuid(), running.uuid());

        let outcome = manager
            .acknowledgement(
                &FrameworkId::new("fw"),
                &TaskId::new("t1"),
                running.uuid().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::StreamContinues);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].uuid(), finished.uuid());

        let outcome = manager
            .acknowledgement(
                &FrameworkId::new("fw"),
                &TaskId::new("t1"),
                finished.uuid().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::StreamFinished);
    }

    #[tokio::test]
    async fn duplicate_acknowledgement_is_a_no_op() {
        let (mut manager, mut rx) = manager();

        let running = update("t1", TaskState::Running);
        manager.update(running.clone(), None).await.unwrap();
        drain(&mut rx);

        let uuid = running.uuid().unwrap();
        let fw = FrameworkId::new("fw");
        let task = TaskId::new("t1");

        assert_eq!(
            manager.acknowledgement(&fw, &task, uuid).await.unwrap(),
            AckOutcome::StreamContinues
        );
        assert_eq!(
            manager.acknowledgement(&fw, &task, uuid).await.unwrap(),
            AckOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn duplicate_update_uuid_is_dropped() {
        let (mut manager, mut rx) = manager();

        let running = update("t1", TaskState::Running);
        manager.update(running.clone(), None).await.unwrap();
        manager.update(running.clone(), None).await.unwrap();

        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn paused_manager_replays_on_resume() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager = StatusUpdateManager::new(tx);

        let running = update("t1", TaskState::Running);
        manager.update(running.clone(), None).await.unwrap();
        assert!(drain(&mut rx).is_empty(), "paused manager must not forward");

        manager.resume();
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].uuid(), running.uuid());
    }

    #[tokio::test]
    async fn stream_recovers_from_checkpoint_with_acked_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updates");

        let (mut mgr, mut rx) = manager();
        let running = update("t1", TaskState::Running);
        let finished = update("t1", TaskState::Finished);

        mgr
            .update(running.clone(), Some(path.clone()))
            .await
            .unwrap();
        mgr
            .acknowledgement(
                &FrameworkId::new("fw"),
                &TaskId::new("t1"),
                running.uuid().unwrap(),
            )
            .await
            .unwrap();
        mgr
            .update(finished.clone(), Some(path.clone()))
            .await
            .unwrap();
        drain(&mut rx);

        // A fresh manager (an agent restart) replays only the unacked tail.
        let (mut recovered, mut rx2) = manager();
        recovered
            .recover_stream(FrameworkId::new("fw"), TaskId::new("t1"), path)
            .await
            .unwrap();

        let pending = recovered.pending_updates();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uuid(), finished.uuid());
        assert!(drain(&mut rx2).is_empty());
    }
}
