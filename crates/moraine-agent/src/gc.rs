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

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Schedules directory removals after a delay. Paths belonging to a
/// framework or executor that comes back to life are unscheduled before the
/// deadline fires. Exceeding the disk-headroom watermark prunes scheduled
/// paths ahead of their deadline, oldest first.
#[derive(Debug, Default)]
pub struct DirectoryGarbageCollector {
    scheduled: BTreeMap<PathBuf, Instant>,
}

impl DirectoryGarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, path: PathBuf, delay: Duration, now: Instant) {
        debug!(path = %path.display(), ?delay, "Scheduled directory for removal");
        self.scheduled.insert(path, now + delay);
    }

    /// Removes a path (and anything scheduled beneath it) from the GC plan.
    /// Returns the paths rescued.
    pub fn unschedule(&mut self, path: &Path) -> Vec<PathBuf> {
        let rescued: Vec<PathBuf> = self
            .scheduled
            .keys()
            .filter(|scheduled| scheduled.starts_with(path))
            .cloned()
            .collect();
        for path in &rescued {
            self.scheduled.remove(path);
            debug!(path = %path.display(), "Unscheduled directory from removal");
        }
        rescued
    }

    pub fn is_scheduled(&self, path: &Path) -> bool {
        self.scheduled.contains_key(path)
    }

    /// Paths whose deadline has passed, removed from the schedule.
    pub fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let due: Vec<PathBuf> = self
            .scheduled
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.scheduled.remove(path);
        }
        due
    }

    /// Under disk pressure, surrenders the oldest-deadline paths first
    /// regardless of deadline.
    pub fn take_for_pressure(&mut self, count: usize) -> Vec<PathBuf> {
        let mut by_deadline: Vec<(PathBuf, Instant)> = self
            .scheduled
            .iter()
            .map(|(path, deadline)| (path.clone(), *deadline))
            .collect();
        by_deadline.sort_by_key(|(_, deadline)| *deadline);

        let taken: Vec<PathBuf> = by_deadline
            .into_iter()
            .take(count)
            .map(|(path, _)| path)
            .collect();
        for path in &taken {
            self.scheduled.remove(path);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}

/// Deletes a directory tree, tolerating it already being gone.
pub async fn remove_path(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_paths_are_returned_once() {
        let mut gc = DirectoryGarbageCollector::new();
        let now = Instant::now();

        gc.schedule(PathBuf::from("/tmp/a"), Duration::from_secs(0), now);
        gc.schedule(PathBuf::from("/tmp/b"), Duration::from_secs(600), now);

        let due = gc.take_due(now + Duration::from_secs(1));
        assert_eq!(due, vec![PathBuf::from("/tmp/a")]);
        assert!(gc.take_due(now + Duration::from_secs(1)).is_empty());
        assert_eq!(gc.len(), 1);
    }

    #[test]
    fn unschedule_rescues_nested_paths() {
        let mut gc = DirectoryGarbageCollector::new();
        let now = Instant::now();

        gc.schedule(
            PathBuf::from("/work/fw1/executors/e1"),
            Duration::from_secs(60),
            now,
        );
        gc.schedule(
            PathBuf::from("/work/fw1/executors/e2"),
            Duration::from_secs(60),
            now,
        );
        gc.schedule(PathBuf::from("/work/fw2"), Duration::from_secs(60), now);

        let rescued = gc.unschedule(Path::new("/work/fw1"));
        assert_eq!(rescued.len(), 2);
        assert_eq!(gc.len(), 1);
    }

    #[test]
    fn disk_pressure_takes_oldest_first() {
        let mut gc = DirectoryGarbageCollector::new();
        let now = Instant::now();

        gc.schedule(PathBuf::from("/tmp/new"), Duration::from_secs(600), now);
        gc.schedule(PathBuf::from("/tmp/old"), Duration::from_secs(60), now);

        let taken = gc.take_for_pressure(1);
        assert_eq!(taken, vec![PathBuf::from("/tmp/old")]);
    }
}
