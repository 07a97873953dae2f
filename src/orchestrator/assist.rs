//! Human-assistance handshake.
//!
//! The runner's request suspends the run on a oneshot channel. Either a
//! caller answers through [`Orchestrator::submit_assistance`] or the wait
//! times out and the run resumes with a canned answer. Whichever side takes
//! the sender out of the runtime's slot owns the resolution.

use tokio::sync::oneshot;
use tracing::{info, warn};

use super::Orchestrator;
use super::run::settle;
use super::runtime::TaskRuntime;
use crate::error::{Result, TaskError};
use crate::tasks::{AssistanceRequest, ChatMessage, TaskDetail, TaskStatus};

/// Answer handed to the runner when nobody responds in time.
pub const TIMEOUT_RESPONSE: &str = "Timed out waiting for user response.";
/// Recorded on the assistance request when nobody responds in time.
pub const TIMEOUT_NOTE: &str = "Timed out waiting for user input.";

impl Orchestrator {
    pub(super) async fn request_assistance(&self, runtime: &TaskRuntime, question: String) -> String {
        let (tx, mut rx) = oneshot::channel();

        let token = match self.relay.mint(&runtime.id).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(task_id = %runtime.id, error = %e, "Failed to mint assist token");
                None
            }
        };
        {
            let _steps = runtime.step_lock.lock().await;
            runtime
                .update(|task| {
                    task.record.needs_attention = true;
                    settle(&mut task.record, TaskStatus::WaitingForInput);
                    task.record.assistance = Some(AssistanceRequest::new(question.clone()));
                    if let Some(token) = token {
                        task.record.access_token = token;
                    }
                    task.chat_history
                        .push(ChatMessage::assistant(format!("Agent needs help:\n{question}")));
                    runtime.set_assistance(tx);
                })
                .await;
        }
        self.persist_logged(runtime).await;
        info!(task_id = %runtime.id, "Waiting for human assistance");

        match tokio::time::timeout(self.config.assistance_timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            // The run is being torn down.
            Ok(Err(_)) => TIMEOUT_RESPONSE.to_string(),
            Err(_) => {
                if runtime.take_assistance().is_none() {
                    // A response raced the timeout and owns the resolution.
                    return rx.await.unwrap_or_else(|_| TIMEOUT_RESPONSE.to_string());
                }
                warn!(task_id = %runtime.id, "Assistance timed out");
                {
                    let _steps = runtime.step_lock.lock().await;
                    runtime
                        .update(|task| {
                            task.record.needs_attention = false;
                            settle(&mut task.record, TaskStatus::Running);
                            if let Some(request) = task.record.assistance.as_mut() {
                                request.resolve(TIMEOUT_NOTE);
                            }
                        })
                        .await;
                }
                self.revoke_logged(&runtime.id).await;
                self.persist_logged(runtime).await;
                TIMEOUT_RESPONSE.to_string()
            }
        }
    }

    /// Answer a task that is waiting for a human and resume its run.
    pub async fn submit_assistance(&self, task_id: &str, message: &str) -> Result<TaskDetail> {
        let runtime = self.runtime(task_id).await?;
        let response = message.trim().to_string();
        if response.is_empty() {
            return Err(TaskError::Validation("A response is required.".to_string()).into());
        }
        let Some(tx) = runtime.take_assistance() else {
            return Err(TaskError::Conflict("Task not awaiting assistance.".to_string()).into());
        };

        {
            let _steps = runtime.step_lock.lock().await;
            runtime
                .update(|task| {
                    task.record.needs_attention = false;
                    settle(&mut task.record, TaskStatus::Running);
                    if let Some(request) = task.record.assistance.as_mut() {
                        request.resolve(response.clone());
                    }
                    task.chat_history.push(ChatMessage::user(response.clone()));
                })
                .await;
        }
        self.revoke_logged(task_id).await;
        self.persist(&runtime).await?;
        if tx.send(response).is_err() {
            warn!(task_id = %task_id, "Run stopped before the response was delivered");
        }
        info!(task_id = %task_id, "Assistance delivered");
        Ok(runtime.detail().await)
    }

    async fn revoke_logged(&self, task_id: &str) {
        if let Err(e) = self.relay.revoke(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to revoke relay tokens");
        }
    }
}
