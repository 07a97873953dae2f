//! Per-task in-memory runtime.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::tasks::{PersistedTask, TaskDetail, TaskStatus, TaskSummary};

/// Handle on the spawned run of a task.
pub(crate) struct ActiveRun {
    pub handle: JoinHandle<()>,
    pub cancel: CancellationToken,
}

/// The authoritative in-memory copy of a task plus its coordination state.
pub(crate) struct TaskRuntime {
    pub id: String,
    pub data: RwLock<PersistedTask>,
    /// Serializes step and chat appends.
    pub step_lock: Mutex<()>,
    /// Serializes writes to disk so an older snapshot never lands last.
    /// Holds the status of the last snapshot written.
    pub persist_lock: Mutex<Option<TaskStatus>>,
    /// Held across check-then-dispatch.
    pub lifecycle: Mutex<()>,
    pub run: Mutex<Option<ActiveRun>>,
    /// Resolves a suspended assistance wait. Whoever takes it owns the resolution.
    assistance: StdMutex<Option<oneshot::Sender<String>>>,
    deleted: AtomicBool,
}

impl TaskRuntime {
    /// A task that has not been written yet.
    pub fn new(task: PersistedTask) -> Self {
        Self::with_persisted(task, None)
    }

    /// A task whose current state is already on disk.
    pub fn loaded(task: PersistedTask) -> Self {
        let status = task.record.status;
        Self::with_persisted(task, Some(status))
    }

    fn with_persisted(task: PersistedTask, persisted: Option<TaskStatus>) -> Self {
        Self {
            id: task.record.id.clone(),
            data: RwLock::new(task),
            step_lock: Mutex::new(()),
            persist_lock: Mutex::new(persisted),
            lifecycle: Mutex::new(()),
            run: Mutex::new(None),
            assistance: StdMutex::new(None),
            deleted: AtomicBool::new(false),
        }
    }

    /// Mutate the task and bump `updated_at`.
    pub async fn update<R>(&self, f: impl FnOnce(&mut PersistedTask) -> R) -> R {
        let mut data = self.data.write().await;
        let out = f(&mut data);
        data.record.touch();
        out
    }

    pub async fn snapshot(&self) -> PersistedTask {
        self.data.read().await.clone()
    }

    pub async fn summary(&self) -> TaskSummary {
        self.data.read().await.record.summary()
    }

    pub async fn detail(&self) -> TaskDetail {
        TaskDetail::from_persisted(self.snapshot().await)
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// A run whose task already shows a final status is only tearing down.
    /// Wait up to `grace` for it to exit so it stops counting as running.
    pub async fn wait_for_wind_down(&self, grace: Duration) {
        if !self.data.read().await.record.status.is_terminal() {
            return;
        }
        let mut slot = self.run.lock().await;
        let Some(mut active) = slot.take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut active.handle).await.is_err() {
            *slot = Some(active);
        }
    }

    /// Park the sender that resumes a suspended run. Call while holding the
    /// data write lock so readers never see a waiting task without one.
    pub fn set_assistance(&self, tx: oneshot::Sender<String>) {
        let mut slot = self.assistance.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(tx);
    }

    pub fn take_assistance(&self) -> Option<oneshot::Sender<String>> {
        self.assistance
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}
