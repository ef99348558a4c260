use crate::errors::PipelineError;
use crate::models::{ProgressEvent, Task, TaskError, TaskKind, TaskOutcome, TaskStatus};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Shared view of one task: its current state, a cooperative cancel flag and
/// the progress stream.
#[derive(Clone)]
pub struct TaskStatusHandle {
    inner: Arc<TaskStatusData>,
}

struct TaskStatusData {
    task_id: String,
    state: watch::Sender<Task>,
    events: broadcast::Sender<ProgressEvent>,
    cancel_requested: AtomicBool,
}

impl TaskStatusHandle {
    pub fn new(task: Task, channel_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(channel_capacity.max(1));
        let task_id = task.task_id.clone();
        let (state, _) = watch::channel(task);
        Self {
            inner: Arc::new(TaskStatusData {
                task_id,
                state,
                events,
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    /// A handle that belongs to no orchestrator, already running.
    pub fn detached(kind: TaskKind) -> Self {
        let handle = Self::new(
            Task::new(format!("detached-{}", kind.as_str()), kind, String::new()),
            16,
        );
        let _ = handle.mark_running();
        handle
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn snapshot(&self) -> Task {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<Task> {
        self.inner.state.subscribe()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.state.borrow().status.is_terminal()
    }

    pub fn request_cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn ensure_not_canceled(&self) -> Result<(), PipelineError> {
        if self.is_cancel_requested() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Claims the task for a worker. Fails when it was canceled while queued.
    pub fn mark_running(&self) -> Result<(), PipelineError> {
        self.ensure_not_canceled()?;
        let mut claimed = false;
        self.update(|task| {
            if task.status != TaskStatus::Queued {
                return false;
            }
            task.status = TaskStatus::Running;
            task.progress = 0;
            task.message = "Running".to_string();
            if task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            claimed = true;
            true
        });
        if claimed {
            Ok(())
        } else {
            Err(PipelineError::Canceled)
        }
    }

    /// Progress never moves backwards within one run.
    pub fn set_progress<S: Into<String>>(&self, progress: u8, message: S) {
        let message = message.into();
        self.update(|task| {
            if task.status != TaskStatus::Running {
                return false;
            }
            task.progress = task.progress.max(progress.min(100));
            task.message = message;
            true
        });
    }

    /// Reports progress and yields `Canceled` once a cancel was requested.
    pub fn checkpoint<S: Into<String>>(&self, progress: u8, message: S) -> Result<(), PipelineError> {
        self.ensure_not_canceled()?;
        self.set_progress(progress, message);
        Ok(())
    }

    pub fn cancel_if_queued(&self) -> bool {
        self.update(|task| {
            if task.status != TaskStatus::Queued {
                return false;
            }
            task.status = TaskStatus::Canceled;
            task.message = "Canceled".to_string();
            task.finished_at = Some(Utc::now());
            true
        })
    }

    /// Sends the task back to the queue after a failed attempt.
    pub fn requeue(&self, error: TaskError) {
        self.update(|task| {
            if task.status.is_terminal() {
                return false;
            }
            task.status = TaskStatus::Queued;
            task.progress = 0;
            task.retry_count += 1;
            task.message = format!("Retrying after {}: {}", error.code, error.message);
            task.last_error = Some(error);
            true
        });
    }

    pub fn finish_succeeded(&self, outcome: TaskOutcome) {
        self.update(|task| {
            if task.status.is_terminal() {
                return false;
            }
            task.status = TaskStatus::Succeeded;
            task.progress = 100;
            task.message = "Completed".to_string();
            task.outcome = Some(outcome);
            task.finished_at = Some(Utc::now());
            true
        });
    }

    pub fn finish_failed(&self, error: TaskError) {
        self.update(|task| {
            if task.status.is_terminal() {
                return false;
            }
            task.status = TaskStatus::Failed;
            task.retry_count += 1;
            task.message = format!("{}: {}", error.code, error.message);
            task.last_error = Some(error);
            task.finished_at = Some(Utc::now());
            true
        });
    }

    pub fn finish_canceled(&self) {
        self.update(|task| {
            if task.status.is_terminal() {
                return false;
            }
            task.status = TaskStatus::Canceled;
            task.message = "Canceled".to_string();
            task.finished_at = Some(Utc::now());
            true
        });
    }

    /// Applies `change` under the state lock and publishes the resulting
    /// event before the lock is released, so the terminal event is always
    /// the last one on the stream.
    fn update<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let events = &self.inner.events;
        self.inner.state.send_if_modified(|task| {
            if !change(task) {
                return false;
            }
            let _ = events.send(ProgressEvent {
                task_id: task.task_id.clone(),
                status: task.status,
                progress: task.progress,
                message: task.message.clone(),
                terminal: task.status.is_terminal(),
            });
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    fn handle() -> TaskStatusHandle {
        TaskStatusHandle::new(
            Task::new("t-1".to_string(), TaskKind::Backtest, "fp".to_string()),
            4,
        )
    }

    #[test]
    fn progress_is_monotonic_within_a_run() {
        let handle = handle();
        handle.mark_running().unwrap();
        handle.set_progress(40, "forty");
        handle.set_progress(20, "twenty");
        let task = handle.snapshot();
        assert_eq!(task.progress, 40);
        assert_eq!(task.message, "twenty");
    }

    #[test]
    fn canceled_queued_task_cannot_be_claimed() {
        let handle = handle();
        handle.request_cancel();
        assert!(handle.cancel_if_queued());
        assert_eq!(
            handle.mark_running().unwrap_err(),
            PipelineError::Canceled
        );
        assert_eq!(handle.snapshot().status, TaskStatus::Canceled);
    }

    #[test]
    fn requeue_resets_progress_and_counts_attempts() {
        let handle = handle();
        handle.mark_running().unwrap();
        handle.set_progress(70, "late");
        handle.requeue(TaskError {
            code: ErrorCode::StorageUnavailable,
            message: "down".to_string(),
            attempt: 1,
        });
        let task = handle.snapshot();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 1);
        assert!(task.last_error.is_some());
    }

    #[test]
    fn lagging_subscriber_still_sees_the_terminal_event() {
        let handle = handle();
        let mut events = handle.subscribe();
        handle.mark_running().unwrap();
        for step in 1..=20u8 {
            handle.set_progress(step * 4, format!("step {}", step));
        }
        handle.finish_succeeded(TaskOutcome::Backtest {
            result_hash: "abc".to_string(),
        });
        handle.set_progress(100, "ignored after terminal");

        let mut last = None;
        loop {
            match events.try_recv() {
                Ok(event) => last = Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        let last = last.unwrap();
        assert!(last.terminal);
        assert_eq!(last.status, TaskStatus::Succeeded);
        assert_eq!(last.progress, 100);
    }
}
