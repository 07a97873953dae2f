//! Task data model: records, step and chat logs, and the API views.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use super::state::TaskStatus;
use crate::error::TaskError;

fn default_node_id() -> String {
    "default".to_string()
}

/// Reasoning effort hint passed through to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Transcript author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }
}

/// One step reported by the agent runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// 1-based ordinal, gap-free within a task.
    pub step_number: u32,
    pub summary_html: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub screenshot_b64: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Opaque runner state, stored as-is.
    #[serde(default)]
    pub raw_state: Option<serde_json::Value>,
    /// Opaque runner output, stored as-is.
    #[serde(default)]
    pub raw_output: Option<serde_json::Value>,
}

/// A question the runner put to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistanceRequest {
    pub question: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_text: Option<String>,
}

impl AssistanceRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            requested_at: Utc::now(),
            responded_at: None,
            response_text: None,
        }
    }

    /// Close the request with the given response.
    pub fn resolve(&mut self, response: impl Into<String>) {
        self.response_text = Some(response.into());
        self.responded_at = Some(Utc::now());
    }
}

/// The authoritative record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    pub title: String,
    pub instructions: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub leave_browser_open: bool,
    #[serde(default)]
    pub browser_open: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result_summary: Option<String>,
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    pub max_steps: u32,
    pub max_actions_per_step: u32,
    pub max_input_tokens: u32,
    pub use_vision: bool,
    /// Secret handed to the relay service while the task awaits a human.
    pub access_token: String,
    pub browser_data_dir: String,
    pub downloads_dir: String,
    #[serde(default)]
    pub recordings_dir: Option<String>,
    #[serde(default)]
    pub traces_dir: Option<String>,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default)]
    pub needs_attention: bool,
    #[serde(default)]
    pub assistance: Option<AssistanceRequest>,
}

impl TaskRecord {
    /// Bump `updated_at`, never letting it fall behind `created_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// The remote-desktop link is only live while a human is genuinely needed.
    pub fn awaiting_human(&self) -> bool {
        self.status == TaskStatus::WaitingForInput && self.needs_attention
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            node_id: self.node_id.clone(),
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            browser_open: self.browser_open,
            leave_browser_open: self.leave_browser_open,
            needs_attention: self.needs_attention,
            created_at: self.created_at,
            updated_at: self.updated_at,
            scheduled_for: self.scheduled_for,
            step_count: self.step_count,
            model_name: self.model_name.clone(),
        }
    }
}

/// Record plus its step and chat logs: the unit of durability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub record: TaskRecord,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
}

/// Request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreate {
    pub title: String,
    pub instructions: String,
    /// Falls back to the node's default model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub leave_browser_open: bool,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Must carry a UTC offset; naive timestamps fail to deserialize.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<FixedOffset>>,
}

impl TaskCreate {
    pub fn new(title: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            instructions: instructions.into(),
            model: None,
            temperature: None,
            max_steps: None,
            leave_browser_open: false,
            reasoning_effort: None,
            scheduled_for: None,
        }
    }

    pub fn scheduled_at(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(when.fixed_offset());
        self
    }

    /// Field-level checks that do not depend on node state.
    pub fn validate(&self, supported_models: &[String]) -> Result<(), TaskError> {
        let title_len = self.title.trim().chars().count();
        if !(3..=200).contains(&title_len) {
            return Err(TaskError::Validation(
                "Title must be between 3 and 200 characters.".to_string(),
            ));
        }
        if self.instructions.trim().chars().count() < 5 {
            return Err(TaskError::Validation(
                "Instructions must be at least 5 characters.".to_string(),
            ));
        }
        if let Some(model) = &self.model
            && !supported_models.iter().any(|m| m == model)
        {
            return Err(TaskError::Validation(
                "Unsupported model requested.".to_string(),
            ));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(TaskError::Validation(
                "Temperature must be between 0.0 and 2.0.".to_string(),
            ));
        }
        if let Some(steps) = self.max_steps
            && !(1..=200).contains(&steps)
        {
            return Err(TaskError::Validation(
                "max_steps must be between 1 and 200.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub browser_open: bool,
    pub leave_browser_open: bool,
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub step_count: u32,
    pub model_name: String,
}

/// Full task view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub record: TaskRecord,
    pub steps: Vec<TaskStep>,
    pub chat_history: Vec<ChatMessage>,
    /// Present only while the task is waiting for a human.
    #[serde(default)]
    pub assist_launch_url: Option<String>,
}

impl TaskDetail {
    pub fn from_persisted(task: PersistedTask) -> Self {
        let assist_launch_url = task.record.awaiting_human().then(|| {
            format!(
                "/tasks/{}/assist?token={}",
                task.record.id, task.record.access_token
            )
        });
        Self {
            record: task.record,
            steps: task.steps,
            chat_history: task.chat_history,
            assist_launch_url,
        }
    }
}
