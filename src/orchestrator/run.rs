//! Run execution: spawning a run, runner callbacks, and finalisation.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::prompt::{compose_prompt, format_agent_output};
use super::runtime::{ActiveRun, TaskRuntime};
use super::{Orchestrator, last_url};
use crate::runner::{AgentOutput, BrowserSnapshot, RunHistory, RunHooks, RunRequest};
use crate::tasks::{ChatMessage, PersistedTask, TaskRecord, TaskStatus, TaskStep};

/// Move `record` to `next`, logging if the move is outside the state table.
///
/// Runner outcomes are facts, so the state is recorded either way.
pub(super) fn settle(record: &mut TaskRecord, next: TaskStatus) {
    if let Err(e) = record.transition_to(next) {
        warn!(task_id = %record.id, error = %e, "Forcing task state");
        record.status = next;
    }
}

impl Orchestrator {
    pub(super) async fn spawn_run(self: &Arc<Self>, runtime: &Arc<TaskRuntime>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let this = Arc::clone(self);
            let runtime = Arc::clone(runtime);
            let cancel = cancel.clone();
            async move { this.run_task(runtime, cancel).await }
        });
        *runtime.run.lock().await = Some(ActiveRun { handle, cancel });
    }

    async fn run_task(self: Arc<Self>, runtime: Arc<TaskRuntime>, cancel: CancellationToken) {
        let task_id = runtime.id.clone();
        runtime
            .update(|task| {
                settle(&mut task.record, TaskStatus::Running);
                task.record.browser_open = true;
            })
            .await;
        self.persist_logged(&runtime).await;
        info!(task_id = %task_id, "Starting task");

        let request = build_request(&runtime.snapshot().await, self.config.runner.disable_telemetry);
        let hooks: Arc<dyn RunHooks> = Arc::new(TaskHooks {
            orchestrator: Arc::clone(&self),
            runtime: Arc::clone(&runtime),
        });
        let outcome = self.runner.run(request, hooks, cancel.clone()).await;
        let cancelled = cancel.is_cancelled();

        // The browser is settled before the final status becomes visible.
        let completed = !cancelled && outcome.as_ref().is_ok_and(|h| !h.has_errors());
        let keep_browser = completed && runtime.data.read().await.record.leave_browser_open;
        if !keep_browser {
            self.close_runner_browser(&task_id).await;
        }

        runtime
            .update(|task| {
                if cancelled {
                    settle(&mut task.record, TaskStatus::Cancelled);
                    task.record.needs_attention = false;
                } else {
                    match &outcome {
                        Ok(history) => finalize(task, history),
                        Err(e) => {
                            settle(&mut task.record, TaskStatus::Failed);
                            task.record.last_error = Some(e.to_string());
                            task.record.needs_attention = false;
                            task.chat_history.push(ChatMessage::system(format!(
                                "Task finished with status {}.",
                                TaskStatus::Failed
                            )));
                        }
                    }
                }
                task.record.browser_open = keep_browser;
            })
            .await;
        runtime.take_assistance();
        match (&outcome, cancelled) {
            (_, true) => info!(task_id = %task_id, "Task cancelled"),
            (Err(e), false) => error!(task_id = %task_id, error = %e, "Task failed"),
            (Ok(_), false) => info!(task_id = %task_id, kept_browser = keep_browser, "Task finished"),
        }

        self.persist_logged(&runtime).await;
        debug!(task_id = %task_id, "Run finished");
    }

    async fn close_runner_browser(&self, task_id: &str) {
        if let Err(e) = self.runner.close_browser(task_id).await {
            debug!(task_id = %task_id, error = %e, "Failed to close browser");
        }
    }

    /// Close the task's browser. Failures are logged and swallowed.
    pub(super) async fn teardown_browser(&self, runtime: &TaskRuntime) {
        self.close_runner_browser(&runtime.id).await;
        runtime.update(|task| task.record.browser_open = false).await;
    }

    async fn record_step(&self, runtime: &TaskRuntime, state: BrowserSnapshot, output: AgentOutput, reported: u32) {
        let _steps = runtime.step_lock.lock().await;
        let ordinal = runtime
            .update(|task| {
                let ordinal = task.record.step_count + 1;
                task.steps.push(TaskStep {
                    step_number: ordinal,
                    summary_html: format_agent_output(&output),
                    created_at: Utc::now(),
                    screenshot_b64: state.screenshot.clone(),
                    url: state.url.clone(),
                    title: state.title.clone(),
                    raw_state: serde_json::to_value(&state).ok(),
                    raw_output: serde_json::to_value(&output).ok(),
                });
                task.chat_history
                    .push(ChatMessage::assistant(format!("Step {ordinal} completed.")));
                task.record.step_count = ordinal;
                let next = if task.record.needs_attention {
                    TaskStatus::WaitingForInput
                } else {
                    TaskStatus::Running
                };
                settle(&mut task.record, next);
                ordinal
            })
            .await;
        if ordinal != reported {
            debug!(task_id = %runtime.id, ordinal, reported, "Runner step ordinal differs");
        }
        self.persist_logged(runtime).await;
    }
}

/// Record a finished run's outcome.
pub(super) fn finalize(task: &mut PersistedTask, history: &RunHistory) {
    let record = &mut task.record;
    record.completed_at = Some(Utc::now());
    let errors: Vec<&str> = history
        .errors
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .collect();
    if !errors.is_empty() {
        record.last_error = Some(errors.join("\n"));
    }
    record.result_summary = history.final_result.clone();
    let status = if record.last_error.is_some() {
        TaskStatus::Failed
    } else {
        TaskStatus::Completed
    };
    settle(record, status);
    record.needs_attention = false;
    task.chat_history.push(ChatMessage::system(format!(
        "Task finished with status {status}."
    )));
}

/// Transcript entry for a finished run.
pub(super) fn completion_message(history: &RunHistory) -> String {
    let mut lines = vec!["Task completed.".to_string()];
    if let Some(duration) = history.duration_secs.filter(|d| *d > 0.0) {
        lines.push(format!("Duration: {duration:.2}s"));
    }
    if let Some(result) = history.final_result.as_deref().filter(|r| !r.is_empty()) {
        lines.push(format!("Final result: {result}"));
    }
    lines.join("\n")
}

fn build_request(task: &PersistedTask, disable_telemetry: bool) -> RunRequest {
    let record = &task.record;
    RunRequest {
        task_id: record.id.clone(),
        prompt: compose_prompt(task),
        model: record.model_name.clone(),
        temperature: record.temperature,
        reasoning_effort: record.reasoning_effort,
        max_steps: record.max_steps,
        max_actions_per_step: record.max_actions_per_step,
        max_input_tokens: record.max_input_tokens,
        use_vision: record.use_vision,
        browser_data_dir: PathBuf::from(&record.browser_data_dir),
        downloads_dir: PathBuf::from(&record.downloads_dir),
        recordings_dir: record.recordings_dir.as_ref().map(PathBuf::from),
        traces_dir: record.traces_dir.as_ref().map(PathBuf::from),
        start_url: last_url(task),
        keep_browser_open: record.leave_browser_open,
        disable_telemetry,
    }
}

/// Callbacks handed to the runner for one run.
struct TaskHooks {
    orchestrator: Arc<Orchestrator>,
    runtime: Arc<TaskRuntime>,
}

#[async_trait]
impl RunHooks for TaskHooks {
    async fn on_step(&self, state: BrowserSnapshot, output: AgentOutput, ordinal: u32) {
        self.orchestrator
            .record_step(&self.runtime, state, output, ordinal)
            .await;
    }

    async fn on_done(&self, history: &RunHistory) {
        let message = completion_message(history);
        let _steps = self.runtime.step_lock.lock().await;
        self.runtime
            .update(|task| task.chat_history.push(ChatMessage::assistant(message)))
            .await;
    }

    async fn on_assistance_needed(&self, question: String) -> String {
        self.orchestrator
            .request_assistance(&self.runtime, question)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::tests::record;

    fn running_task() -> PersistedTask {
        let mut rec = record("t");
        rec.status = TaskStatus::Running;
        PersistedTask {
            record: rec,
            steps: vec![],
            chat_history: vec![],
        }
    }

    #[test]
    fn finalize_without_errors_completes() {
        let mut task = running_task();
        finalize(
            &mut task,
            &RunHistory {
                final_result: Some("42".to_string()),
                errors: vec![],
                duration_secs: Some(1.5),
            },
        );
        assert_eq!(task.record.status, TaskStatus::Completed);
        assert_eq!(task.record.result_summary.as_deref(), Some("42"));
        assert!(task.record.completed_at.is_some());
        assert_eq!(
            task.chat_history.last().unwrap().content,
            "Task finished with status completed."
        );
    }

    #[test]
    fn finalize_with_errors_fails() {
        let mut task = running_task();
        finalize(
            &mut task,
            &RunHistory {
                final_result: None,
                errors: vec!["boom".to_string(), "".to_string(), "bang".to_string()],
                duration_secs: None,
            },
        );
        assert_eq!(task.record.status, TaskStatus::Failed);
        assert_eq!(task.record.last_error.as_deref(), Some("boom\nbang"));
    }

    #[test]
    fn completion_message_lines() {
        let history = RunHistory {
            final_result: Some("done".to_string()),
            errors: vec![],
            duration_secs: Some(3.0),
        };
        assert_eq!(
            completion_message(&history),
            "Task completed.\nDuration: 3.00s\nFinal result: done"
        );
        assert_eq!(completion_message(&RunHistory::default()), "Task completed.");
    }
}
