use crate::models::{Task, TaskStatus};
use crate::orchestrator::{TaskHandle, TaskOrchestrator};
use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use tokio::sync::broadcast::error::RecvError;

/// Renders a task's progress stream until it ends. Ctrl-C requests
/// cancellation once; the task still reports its own terminal state.
pub async fn follow(orchestrator: &TaskOrchestrator, handle: TaskHandle) -> Result<Task> {
    let TaskHandle {
        task_id,
        attached,
        mut events,
    } = handle;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );
    if attached {
        pb.println(format!("Attached to running task {}", task_id));
    }

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    pb.set_position(event.progress as u64);
                    pb.set_message(event.message);
                    if event.terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Progress stream for {} skipped {} events", task_id, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                if let Err(err) = signal {
                    warn!("Unable to listen for Ctrl-C: {}", err);
                }
                cancel_sent = true;
                pb.set_message("Canceling");
                orchestrator.cancel_task(&task_id).await?;
            }
        }
    }

    let task = orchestrator.wait(&task_id).await?;
    if task.status == TaskStatus::Succeeded {
        pb.finish_with_message("Completed");
    } else {
        pb.abandon_with_message(task.message.clone());
    }
    Ok(task)
}

pub fn ensure_succeeded(task: &Task) -> Result<()> {
    match task.status {
        TaskStatus::Succeeded => Ok(()),
        TaskStatus::Canceled => Err(anyhow!("Task {} was canceled", task.task_id)),
        _ => match &task.last_error {
            Some(error) => Err(anyhow!(
                "Task {} failed with {}: {}",
                task.task_id,
                error.code,
                error.message
            )),
            None => Err(anyhow!(
                "Task {} ended as {}",
                task.task_id,
                task.status.as_str()
            )),
        },
    }
}
