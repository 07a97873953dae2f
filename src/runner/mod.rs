//! Agent runner boundary.
//!
//! The orchestrator never drives a browser itself. It hands a composed
//! prompt to an [`AgentRunner`] and receives progress through [`RunHooks`].
//! Everything crossing this boundary is a closed, typed shape.

pub mod command;

pub use command::CommandRunner;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::tasks::ReasoningEffort;

/// Everything a runner needs to execute one run of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub task_id: String,
    pub prompt: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub max_steps: u32,
    pub max_actions_per_step: u32,
    pub max_input_tokens: u32,
    pub use_vision: bool,
    pub browser_data_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub recordings_dir: Option<PathBuf>,
    pub traces_dir: Option<PathBuf>,
    /// Best-effort session restore for continued tasks.
    pub start_url: Option<String>,
    pub keep_browser_open: bool,
    pub disable_telemetry: bool,
}

/// Request to open an idle browser session for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserRequest {
    pub task_id: String,
    pub browser_data_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub start_url: Option<String>,
}

/// Browser state after a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserSnapshot {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Base64 screenshot.
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub tabs: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// One action the agent chose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// What the agent produced in a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentOutput {
    Plan {
        #[serde(default)]
        evaluation: Option<String>,
        #[serde(default)]
        memory: Option<String>,
        #[serde(default)]
        next_goal: Option<String>,
        #[serde(default)]
        actions: Vec<ActionCall>,
    },
    Message {
        text: String,
    },
    None,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    #[serde(default)]
    pub final_result: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl RunHistory {
    pub fn has_errors(&self) -> bool {
        self.errors.iter().any(|e| !e.trim().is_empty())
    }
}

/// Callbacks a runner invokes while a run is in flight.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_step(&self, state: BrowserSnapshot, output: AgentOutput, ordinal: u32);

    async fn on_done(&self, history: &RunHistory);

    /// Suspend until a human answers or the wait times out.
    async fn on_assistance_needed(&self, question: String) -> String;
}

/// The browser-driving agent.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run to completion. Cancellation must stop the run promptly.
    async fn run(
        &self,
        request: RunRequest,
        hooks: Arc<dyn RunHooks>,
        cancel: CancellationToken,
    ) -> Result<RunHistory, RunnerError>;

    async fn open_browser(&self, request: BrowserRequest) -> Result<(), RunnerError>;

    async fn close_browser(&self, task_id: &str) -> Result<(), RunnerError>;

    /// Reasons the runner cannot accept work. Empty means ready.
    fn readiness(&self) -> Vec<String>;
}
