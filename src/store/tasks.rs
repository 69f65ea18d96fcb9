//! Durable task records. Progress writes are idempotent keyed by task_id;
//! the in-memory record is always current while the durable JSON write is
//! coalesced to at most one per 500 ms per task. Step transitions and
//! terminal states always flush so stage boundaries are durable.

use chrono::Utc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::{Task, TaskProgress, TaskStatus, TaskStep};

use super::Store;

/// Minimum spacing between durable progress writes per task.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

impl Store {
    pub fn create_task(&self, kind: &str) -> String {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            status: TaskStatus::Pending,
            progress: TaskProgress {
                total_files: 0,
                processed_files: 0,
                current_step: TaskStep::Queued,
            },
            error: None,
            result: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        let task_id = task.task_id.clone();

        let mut tasks = self.tasks.write();
        tasks.insert(task_id.clone(), task);
        self.persist_map(&tasks, "tasks.json");
        task_id
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Update progress counters and step. `processed_files` is clamped to be
    /// monotonically non-decreasing and never above `total_files`; the step
    /// only ever advances forward. Duplicate writes are no-ops, so the call
    /// is idempotent.
    pub fn update_progress(
        &self,
        task_id: &str,
        processed_files: usize,
        total_files: usize,
        step: TaskStep,
    ) {
        let mut step_changed = false;
        {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                return;
            }

            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::InProgress;
                task.started_at = Some(Utc::now());
                step_changed = true;
            }

            task.progress.total_files = task.progress.total_files.max(total_files);
            let ceiling = task.progress.total_files;
            task.progress.processed_files = task
                .progress
                .processed_files
                .max(processed_files.min(ceiling));

            if step.order() > task.progress.current_step.order() {
                task.progress.current_step = step;
                step_changed = true;
            }
            task.updated_at = Utc::now();
        }

        if step_changed {
            self.flush_task(task_id);
        } else {
            self.flush_task_coalesced(task_id);
        }
    }

    /// Advance the step without touching file counters.
    pub fn update_step(&self, task_id: &str, step: TaskStep) {
        let progress = {
            let tasks = self.tasks.read();
            tasks.get(task_id).map(|t| t.progress.clone())
        };
        if let Some(progress) = progress {
            self.update_progress(
                task_id,
                progress.processed_files,
                progress.total_files,
                step,
            );
        }
    }

    pub fn complete_task(&self, task_id: &str, result: Option<serde_json::Value>) {
        {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            let now = Utc::now();
            task.status = TaskStatus::Completed;
            task.progress.current_step = TaskStep::Completed;
            task.result = result;
            task.completed_at = Some(now);
            task.updated_at = now;
        }
        self.flush_task(task_id);
    }

    /// Fail the task, freezing the current step.
    pub fn fail_task(&self, task_id: &str, error: impl Into<String>) {
        {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            let now = Utc::now();
            task.status = TaskStatus::Failed;
            task.error = Some(error.into());
            task.completed_at = Some(now);
            task.updated_at = now;
        }
        self.flush_task(task_id);
    }

    /// Force a durable write for this task now.
    pub fn flush_task(&self, task_id: &str) {
        self.task_flush
            .lock()
            .insert(task_id.to_string(), Instant::now());
        let tasks = self.tasks.read();
        self.persist_map(&tasks, "tasks.json");
    }

    fn flush_task_coalesced(&self, task_id: &str) {
        let mut flushes = self.task_flush.lock();
        let due = flushes
            .get(task_id)
            .map(|last| last.elapsed() >= FLUSH_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }
        flushes.insert(task_id.to_string(), Instant::now());
        drop(flushes);

        let tasks = self.tasks.read();
        self.persist_map(&tasks, "tasks.json");
    }

    /// Startup scan: any task a previous process left `in_progress` can
    /// never make progress again, so mark it failed.
    pub(crate) fn mark_interrupted_tasks(&self) {
        let mut interrupted = Vec::new();
        {
            let mut tasks = self.tasks.write();
            for task in tasks.values_mut() {
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Failed;
                    task.error = Some("interrupted".to_string());
                    task.updated_at = Utc::now();
                    interrupted.push(task.task_id.clone());
                }
            }
            if !interrupted.is_empty() {
                self.persist_map(&tasks, "tasks.json");
            }
        }
        for task_id in interrupted {
            tracing::warn!("marked stale task {task_id} as interrupted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_store;
    use super::*;

    #[test]
    fn test_task_starts_pending_queued() {
        let (_dir, store) = test_store();
        let id = store.create_task("process_files");
        let task = store.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress.current_step, TaskStep::Queued);
        assert_eq!(task.kind, "process_files");
    }

    #[test]
    fn test_progress_is_monotone_and_bounded() {
        let (_dir, store) = test_store();
        let id = store.create_task("process_files");

        store.update_progress(&id, 5, 10, TaskStep::Fetching);
        let task = store.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.progress.processed_files, 5);

        // A stale lower write cannot move progress backwards
        store.update_progress(&id, 3, 10, TaskStep::Fetching);
        assert_eq!(store.get_task(&id).unwrap().progress.processed_files, 5);

        // Progress never exceeds total
        store.update_progress(&id, 99, 10, TaskStep::Fetching);
        assert_eq!(store.get_task(&id).unwrap().progress.processed_files, 10);
    }

    #[test]
    fn test_step_only_advances_forward() {
        let (_dir, store) = test_store();
        let id = store.create_task("process_files");

        store.update_step(&id, TaskStep::Parsing);
        assert_eq!(
            store.get_task(&id).unwrap().progress.current_step,
            TaskStep::Parsing
        );

        // Attempting to go backwards is ignored
        store.update_step(&id, TaskStep::Fetching);
        assert_eq!(
            store.get_task(&id).unwrap().progress.current_step,
            TaskStep::Parsing
        );

        store.update_step(&id, TaskStep::Overview);
        assert_eq!(
            store.get_task(&id).unwrap().progress.current_step,
            TaskStep::Overview
        );
    }

    #[test]
    fn test_complete_sets_terminal_state() {
        let (_dir, store) = test_store();
        let id = store.create_task("process_files");
        store.update_progress(&id, 2, 2, TaskStep::Finalizing);
        store.complete_task(&id, Some(serde_json::json!({"files_processed": 2})));

        let task = store.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress.current_step, TaskStep::Completed);
        assert!(task.completed_at.is_some());

        // Terminal tasks ignore further progress writes
        store.update_progress(&id, 0, 100, TaskStep::Fetching);
        let task = store.get_task(&id).unwrap();
        assert_eq!(task.progress.total_files, 2);
    }

    #[test]
    fn test_fail_freezes_step() {
        let (_dir, store) = test_store();
        let id = store.create_task("process_files");
        store.update_progress(&id, 1, 4, TaskStep::Embedding);
        store.fail_task(&id, "provider credentials rejected");

        let task = store.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress.current_step, TaskStep::Embedding);
        assert_eq!(task.error.as_deref(), Some("provider credentials rejected"));
    }

    #[test]
    fn test_duplicate_progress_writes_are_idempotent() {
        let (_dir, store) = test_store();
        let id = store.create_task("process_files");

        store.update_progress(&id, 4, 10, TaskStep::Parsing);
        let first = store.get_task(&id).unwrap();
        store.update_progress(&id, 4, 10, TaskStep::Parsing);
        let second = store.get_task(&id).unwrap();

        assert_eq!(first.progress.processed_files, second.progress.processed_files);
        assert_eq!(first.progress.current_step, second.progress.current_step);
        assert_eq!(first.status, second.status);
    }
}
