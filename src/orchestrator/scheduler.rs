//! Background scheduler: starts scheduled tasks once they fall due.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Orchestrator;
use super::runtime::TaskRuntime;
use crate::error::{Error, Result, TaskError};
use crate::tasks::TaskStatus;

/// A running scheduler loop.
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "Scheduler exited abnormally");
        }
    }
}

/// Run `tick` every `interval` until cancelled.
///
/// Each tick runs as its own task, so an error or a panic in one tick is
/// logged and the next tick still happens.
pub fn spawn_loop<F, Fut>(interval: Duration, tick: F) -> SchedulerHandle
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match tokio::spawn(tick()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(started)) => info!(started, "Scheduled tasks started"),
                Ok(Err(e)) => error!(error = %e, "Scheduler iteration failed"),
                Err(e) => error!(error = %e, "Scheduler iteration panicked"),
            }
        }
        debug!("Scheduler loop exited");
    });
    SchedulerHandle { handle, cancel }
}

impl Orchestrator {
    /// Start the scheduler loop unless one is already running.
    pub(super) async fn ensure_scheduler(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(spawn_loop(self.config.schedule_check_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(this) => this.start_due().await,
                    None => Ok(0),
                }
            }
        }));
        debug!(interval = ?self.config.schedule_check_interval, "Scheduler started");
    }

    /// Dispatch every scheduled task whose start time has passed.
    pub(super) async fn start_due(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now();
        let candidates: Vec<Arc<TaskRuntime>> = self.tasks.read().await.values().cloned().collect();

        let mut started = 0;
        for runtime in candidates {
            if !is_due(&runtime, now).await {
                continue;
            }
            let dispatched = self
                .start_run(&runtime, move |task| {
                    let due = task.record.status == TaskStatus::Scheduled
                        && task.record.scheduled_for.is_some_and(|when| when <= now);
                    if !due {
                        return Err(TaskError::Conflict("Task is no longer due.".to_string()));
                    }
                    task.record.scheduled_for = None;
                    task.record.transition_to(TaskStatus::Pending)
                })
                .await;
            match dispatched {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(Error::Task(TaskError::Conflict(reason))) => {
                    debug!(task_id = %runtime.id, reason = %reason, "Skipping scheduled task")
                }
                Err(e) => warn!(task_id = %runtime.id, error = %e, "Failed to start scheduled task"),
            }
        }
        Ok(started)
    }
}

async fn is_due(runtime: &TaskRuntime, now: chrono::DateTime<Utc>) -> bool {
    let data = runtime.data.read().await;
    data.record.status == TaskStatus::Scheduled
        && data.record.scheduled_for.is_some_and(|when| when <= now)
}
