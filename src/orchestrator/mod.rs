//! Orchestrator: owns every task's lifecycle on a node.
//!
//! The orchestrator holds the authoritative in-memory copy of each task and
//! is the only writer to the store. At most one run exists per task: the
//! check and the dispatch happen under the task's lifecycle lock, so a
//! scheduler tick and a manual run-now cannot both start it.

mod assist;
pub mod prompt;
mod run;
mod runtime;
pub mod scheduler;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::runtime::TaskRuntime;
use self::scheduler::SchedulerHandle;
use crate::config::NodeConfig;
use crate::error::{Error, Result, StoreError, TaskError};
use crate::relay::{self, TokenRelay};
use crate::runner::{AgentRunner, BrowserRequest};
use crate::store::TaskStore;
use crate::tasks::{
    ChatMessage, PersistedTask, TaskCreate, TaskDetail, TaskRecord, TaskStatus, TaskSummary,
};
use crate::trust::node::constant_time_eq;

/// Capacity of the status-change channel. Slow subscribers skip ahead.
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// A task's status as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub task_id: String,
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

pub struct Orchestrator {
    config: NodeConfig,
    store: TaskStore,
    relay: Arc<TokenRelay>,
    runner: Arc<dyn AgentRunner>,
    tasks: RwLock<HashMap<String, Arc<TaskRuntime>>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    status_tx: broadcast::Sender<StatusChange>,
}

impl Orchestrator {
    pub fn new(
        config: NodeConfig,
        store: TaskStore,
        relay: Arc<TokenRelay>,
        runner: Arc<dyn AgentRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            relay,
            runner,
            tasks: RwLock::new(HashMap::new()),
            scheduler: Mutex::new(None),
            status_tx: broadcast::channel(STATUS_CHANNEL_CAPACITY).0,
        })
    }

    /// Wire up the default collaborators for `config`.
    pub fn from_config(config: NodeConfig, runner: Arc<dyn AgentRunner>) -> Arc<Self> {
        let store = TaskStore::new(config.tasks_dir());
        let relay = Arc::new(TokenRelay::new(
            config.relay_token_file(),
            config.relay.target_host.clone(),
            config.relay.target_port,
        ));
        Self::new(config, store, relay, runner)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn relay(&self) -> &TokenRelay {
        &self.relay
    }

    /// Every persisted status change, in write order per task.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Reasons this node cannot start runs. Empty means ready.
    pub fn readiness(&self) -> Vec<String> {
        self.runner.readiness()
    }

    // ── Startup / shutdown ──────────────────────────────────────────────

    /// Load persisted tasks, reconcile runs lost to a restart, and start the
    /// scheduler.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.relay.sync().await {
            warn!(error = %e, "Failed to reset relay token file");
        }

        let loaded = self.store.load_all().await?;
        let mut reconciled = 0usize;
        for mut task in loaded {
            if reconcile(&mut task, &self.config.node_id) {
                task.record.touch();
                self.store.save(&task).await?;
                reconciled += 1;
            }
            let runtime = Arc::new(TaskRuntime::loaded(task));
            self.tasks
                .write()
                .await
                .insert(runtime.id.clone(), runtime);
        }
        info!(
            tasks = self.tasks.read().await.len(),
            reconciled, "Orchestrator started"
        );

        if let Err(e) = self.start_due().await {
            warn!(error = %e, "Startup due-scan failed");
        }
        self.ensure_scheduler().await;
        Ok(())
    }

    /// Stop the scheduler and wait for it to exit.
    pub async fn shutdown(&self) {
        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
            info!("Scheduler stopped");
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// All tasks, newest first.
    pub async fn list(&self) -> Vec<TaskSummary> {
        let runtimes: Vec<Arc<TaskRuntime>> = self.tasks.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
            summaries.push(runtime.summary().await);
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    pub async fn get_detail(&self, task_id: &str) -> Result<TaskDetail> {
        Ok(self.runtime(task_id).await?.detail().await)
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Create a task. It starts right away unless it has a future start time.
    pub async fn create(self: &Arc<Self>, payload: TaskCreate) -> Result<TaskDetail> {
        let issues = self.readiness();
        if !issues.is_empty() {
            return Err(Error::NotReady(issues.join(" ")));
        }
        payload.validate(&self.config.supported_models)?;

        let scheduled_for = payload.scheduled_for.map(|when| when.with_timezone(&Utc));
        if let Some(when) = scheduled_for
            && when <= Utc::now()
        {
            return Err(TaskError::Validation(
                "Scheduled start time must be in the future.".to_string(),
            )
            .into());
        }

        let id = Uuid::new_v4().to_string();
        let task_dir = self.store.task_dir(&id);
        let dirs = ArtifactDirs::under(task_dir.clone());
        let to_create = dirs.all();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), StoreError> {
            for dir in &to_create {
                std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                    path: dir.display().to_string(),
                    source,
                })?;
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        let now = Utc::now();
        let defaults = &self.config.defaults;
        let record = TaskRecord {
            id: id.clone(),
            node_id: self.config.node_id.clone(),
            title: payload.title.trim().to_string(),
            instructions: payload.instructions.clone(),
            status: if scheduled_for.is_some() {
                TaskStatus::Scheduled
            } else {
                TaskStatus::Pending
            },
            leave_browser_open: payload.leave_browser_open,
            browser_open: false,
            created_at: now,
            updated_at: now,
            scheduled_for,
            completed_at: None,
            last_error: None,
            result_summary: None,
            model_name: payload.model.clone().unwrap_or_else(|| defaults.model.clone()),
            temperature: payload.temperature.or(defaults.temperature),
            reasoning_effort: payload.reasoning_effort,
            max_steps: payload.max_steps.unwrap_or(defaults.max_steps),
            max_actions_per_step: defaults.max_actions_per_step,
            max_input_tokens: defaults.max_input_tokens,
            use_vision: defaults.use_vision,
            access_token: relay::generate_token(),
            browser_data_dir: dirs.browser_data.display().to_string(),
            downloads_dir: dirs.downloads.display().to_string(),
            recordings_dir: Some(dirs.recordings.display().to_string()),
            traces_dir: Some(dirs.traces.display().to_string()),
            step_count: 0,
            needs_attention: false,
            assistance: None,
        };
        let task = PersistedTask {
            record,
            steps: Vec::new(),
            chat_history: vec![ChatMessage::user(payload.instructions)],
        };

        let runtime = Arc::new(TaskRuntime::new(task));
        self.tasks
            .write()
            .await
            .insert(id.clone(), Arc::clone(&runtime));
        self.persist(&runtime).await?;
        info!(task_id = %id, scheduled = scheduled_for.is_some(), "Task created");

        if scheduled_for.is_some() {
            self.ensure_scheduler().await;
        } else {
            self.start_run(&runtime, |task| {
                task.record.transition_to(TaskStatus::Pending)
            })
            .await?;
        }
        Ok(runtime.detail().await)
    }

    /// Restart a finished task with an additional instruction.
    pub async fn continue_task(self: &Arc<Self>, task_id: &str, instructions: &str) -> Result<TaskDetail> {
        let runtime = self.runtime(task_id).await?;
        let additional = instructions.trim().to_string();
        if additional.is_empty() {
            return Err(TaskError::Validation(
                "Additional instructions are required to continue.".to_string(),
            )
            .into());
        }

        runtime.wait_for_wind_down(self.config.cancel_grace).await;
        if runtime.is_running().await {
            return Err(TaskError::Conflict("Task is already running.".to_string()).into());
        }
        // A previous run may have left its browser open.
        if runtime.data.read().await.record.status.can_continue() {
            self.teardown_browser(&runtime).await;
        }

        self.start_run(&runtime, move |task| {
            let record = &mut task.record;
            if record.status == TaskStatus::Scheduled {
                return Err(TaskError::Conflict(
                    "Task is scheduled and has not started yet.".to_string(),
                ));
            }
            if !record.status.can_continue() {
                return Err(TaskError::Conflict(format!(
                    "Task cannot be continued while {}.",
                    record.status
                )));
            }
            record.transition_to(TaskStatus::Pending)?;
            record.browser_open = false;
            record.last_error = None;
            record.result_summary = None;
            record.completed_at = None;
            record.needs_attention = false;
            record.assistance = None;
            task.chat_history.push(ChatMessage::user(additional));
            Ok(())
        })
        .await?;
        Ok(runtime.detail().await)
    }

    /// Start a scheduled task immediately.
    pub async fn run_now(self: &Arc<Self>, task_id: &str) -> Result<TaskDetail> {
        let runtime = self.runtime(task_id).await?;
        self.start_run(&runtime, |task| {
            if task.record.status != TaskStatus::Scheduled {
                return Err(TaskError::Conflict("Task is not scheduled.".to_string()));
            }
            task.record.scheduled_for = None;
            task.record.transition_to(TaskStatus::Pending)
        })
        .await?;
        Ok(runtime.detail().await)
    }

    /// Move a scheduled task's start time.
    pub async fn reschedule(&self, task_id: &str, when: DateTime<FixedOffset>) -> Result<TaskDetail> {
        let runtime = self.runtime(task_id).await?;
        let when = when.with_timezone(&Utc);
        {
            let _lifecycle = runtime.lifecycle.lock().await;
            runtime
                .update(|task| {
                    if task.record.status != TaskStatus::Scheduled {
                        return Err(TaskError::Conflict("Task is not scheduled.".to_string()));
                    }
                    if when <= Utc::now() {
                        return Err(TaskError::Validation(
                            "Scheduled time must be in the future.".to_string(),
                        ));
                    }
                    task.record.scheduled_for = Some(when);
                    Ok(())
                })
                .await?;
            self.persist(&runtime).await?;
        }
        info!(task_id = %task_id, scheduled_for = %when, "Task rescheduled");
        Ok(runtime.detail().await)
    }

    /// Tear down a task's idle browser and stop keeping it open.
    pub async fn close_browser(&self, task_id: &str) -> Result<TaskDetail> {
        let runtime = self.runtime(task_id).await?;
        let _lifecycle = runtime.lifecycle.lock().await;
        runtime.wait_for_wind_down(self.config.cancel_grace).await;
        if runtime.is_running().await {
            return Err(TaskError::Conflict("Task is running.".to_string()).into());
        }
        self.teardown_browser(&runtime).await;
        runtime
            .update(|task| {
                task.record.leave_browser_open = false;
                task.record.browser_open = false;
            })
            .await;
        self.persist(&runtime).await?;
        Ok(runtime.detail().await)
    }

    /// Reopen an idle browser session on the task's last page.
    pub async fn open_browser(&self, task_id: &str) -> Result<TaskDetail> {
        let runtime = self.runtime(task_id).await?;
        let _lifecycle = runtime.lifecycle.lock().await;
        runtime.wait_for_wind_down(self.config.cancel_grace).await;
        if runtime.is_running().await {
            return Err(TaskError::Conflict("Task is running.".to_string()).into());
        }
        let request = {
            let data = runtime.data.read().await;
            if data.record.browser_open {
                drop(data);
                return Ok(runtime.detail().await);
            }
            BrowserRequest {
                task_id: data.record.id.clone(),
                browser_data_dir: PathBuf::from(&data.record.browser_data_dir),
                downloads_dir: PathBuf::from(&data.record.downloads_dir),
                start_url: last_url(&data),
            }
        };
        self.runner.open_browser(request).await?;
        runtime
            .update(|task| {
                task.record.browser_open = true;
                task.record.leave_browser_open = true;
            })
            .await;
        self.persist(&runtime).await?;
        Ok(runtime.detail().await)
    }

    /// Remove a task, cancelling its run if one is in flight.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let runtime = self
            .tasks
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| TaskError::NotFound {
                id: task_id.to_string(),
            })?;
        runtime.mark_deleted();
        let _lifecycle = runtime.lifecycle.lock().await;

        runtime.take_assistance();
        let active = runtime.run.lock().await.take();
        if let Some(mut active) = active {
            active.cancel.cancel();
            match tokio::time::timeout(self.config.cancel_grace, &mut active.handle).await {
                Ok(_) => debug!(task_id = %task_id, "Run stopped after cancellation"),
                Err(_) => {
                    warn!(task_id = %task_id, "Run ignored cancellation, aborting");
                    active.handle.abort();
                }
            }
        }

        self.teardown_browser(&runtime).await;
        if let Err(e) = self.relay.revoke(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to revoke relay tokens");
        }
        let _persist = runtime.persist_lock.lock().await;
        self.store.delete(task_id).await?;
        info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    /// Check an assist-page token and make sure the relay knows it.
    ///
    /// Returns the relay viewer URL to redirect to.
    pub async fn assist_target(&self, task_id: &str, token: &str) -> Result<String> {
        let runtime = self.runtime(task_id).await?;
        let (awaiting, expected) = {
            let data = runtime.data.read().await;
            (data.record.awaiting_human(), data.record.access_token.clone())
        };
        if !awaiting || !constant_time_eq(expected.as_bytes(), token.as_bytes()) {
            return Err(TaskError::Forbidden("Invalid assist token".to_string()).into());
        }
        self.relay.register(token, task_id).await?;
        let relay = &self.config.relay;
        Ok(format!(
            "{}://{}:{}/vnc.html?path=websockify?token={token}",
            relay.scheme, relay.public_host, relay.http_port
        ))
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn runtime(&self, task_id: &str) -> std::result::Result<Arc<TaskRuntime>, TaskError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound {
                id: task_id.to_string(),
            })
    }

    async fn is_current(&self, runtime: &Arc<TaskRuntime>) -> bool {
        self.tasks
            .read()
            .await
            .get(&runtime.id)
            .is_some_and(|current| Arc::ptr_eq(current, runtime))
    }

    /// Check-then-dispatch under the lifecycle lock.
    ///
    /// Returns `Ok(false)` when the task was deleted in the meantime.
    async fn start_run<F>(self: &Arc<Self>, runtime: &Arc<TaskRuntime>, prepare: F) -> Result<bool>
    where
        F: FnOnce(&mut PersistedTask) -> std::result::Result<(), TaskError>,
    {
        let _lifecycle = runtime.lifecycle.lock().await;
        if !self.is_current(runtime).await {
            debug!(task_id = %runtime.id, "Task vanished before dispatch");
            return Ok(false);
        }
        runtime.wait_for_wind_down(self.config.cancel_grace).await;
        if runtime.is_running().await {
            return Err(TaskError::Conflict("Task is already running.".to_string()).into());
        }
        runtime.update(prepare).await?;
        if let Err(e) = self.relay.revoke(&runtime.id).await {
            warn!(task_id = %runtime.id, error = %e, "Failed to revoke relay tokens");
        }
        self.persist(runtime).await?;
        self.spawn_run(runtime).await;
        Ok(true)
    }

    /// Write the current snapshot. Deleted tasks are never written back.
    async fn persist(&self, runtime: &TaskRuntime) -> std::result::Result<(), StoreError> {
        let mut last = runtime.persist_lock.lock().await;
        if runtime.is_deleted() {
            return Ok(());
        }
        let snapshot = runtime.snapshot().await;
        self.store.save(&snapshot).await?;
        let status = snapshot.record.status;
        if *last != Some(status) {
            *last = Some(status);
            // No subscribers is not an error.
            let _ = self.status_tx.send(StatusChange {
                task_id: snapshot.record.id,
                status,
                at: snapshot.record.updated_at,
            });
        }
        Ok(())
    }

    async fn persist_logged(&self, runtime: &TaskRuntime) {
        if let Err(e) = self.persist(runtime).await {
            warn!(task_id = %runtime.id, error = %e, "Failed to persist task");
        }
    }
}

/// Repair a task loaded from disk. Returns whether it changed.
fn reconcile(task: &mut PersistedTask, node_id: &str) -> bool {
    let record = &mut task.record;
    let mut dirty = false;
    if (record.node_id.is_empty() || record.node_id == "default") && record.node_id != node_id {
        record.node_id = node_id.to_string();
        dirty = true;
    }
    if record.browser_open {
        record.browser_open = false;
        dirty = true;
    }
    // No runner survives a restart.
    if record.status.implies_live_run() {
        record.status = TaskStatus::Stopped;
        record.needs_attention = false;
        dirty = true;
    }
    dirty
}

fn last_url(task: &PersistedTask) -> Option<String> {
    task.steps.last().and_then(|step| step.url.clone())
}

struct ArtifactDirs {
    root: PathBuf,
    browser_data: PathBuf,
    downloads: PathBuf,
    recordings: PathBuf,
    traces: PathBuf,
}

impl ArtifactDirs {
    fn under(root: PathBuf) -> Self {
        Self {
            browser_data: root.join("browser-data"),
            downloads: root.join("downloads"),
            recordings: root.join("recordings"),
            traces: root.join("traces"),
            root,
        }
    }

    fn all(&self) -> Vec<PathBuf> {
        vec![
            self.root.clone(),
            self.browser_data.clone(),
            self.downloads.clone(),
            self.recordings.clone(),
            self.traces.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::tests::record;

    #[test]
    fn reconcile_stops_live_runs() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::WaitingForInput,
        ] {
            let mut rec = record("t");
            rec.status = status;
            rec.browser_open = true;
            rec.needs_attention = true;
            let mut task = PersistedTask {
                record: rec,
                steps: vec![],
                chat_history: vec![],
            };
            assert!(reconcile(&mut task, "default"));
            assert_eq!(task.record.status, TaskStatus::Stopped);
            assert!(!task.record.browser_open);
            assert!(!task.record.needs_attention);
        }
    }

    #[test]
    fn reconcile_leaves_settled_tasks_alone() {
        let mut rec = record("t");
        rec.status = TaskStatus::Completed;
        let mut task = PersistedTask {
            record: rec,
            steps: vec![],
            chat_history: vec![],
        };
        assert!(!reconcile(&mut task, "default"));
        assert!(reconcile(&mut task, "node-a"));
        assert_eq!(task.record.node_id, "node-a");
        assert_eq!(task.record.status, TaskStatus::Completed);
    }
}
