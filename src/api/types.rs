//! Request and response bodies shared by the node and head routers.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::config::{HeadNode, NodeConfig};
use crate::tasks::{ReasoningEffort, TaskCreate, TaskSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueRequest {
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_for: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistQuery {
    pub token: String,
}

/// Selector for single-task calls on the head.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeQuery {
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Create payload accepted by the head: a task plus its destination node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadTaskCreate {
    #[serde(default, alias = "nodeId", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(flatten)]
    pub task: TaskCreate,
}

/// Enrollment request sent to `/api/admin/head-key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadKeyRequest {
    pub public_key: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadKeyResponse {
    pub status: String,
    pub fingerprint: String,
}

/// What a node reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub ready: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub has_keys: bool,
    #[serde(default)]
    pub enrollment_open: bool,
}

/// Form defaults for new tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDefaults {
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    pub max_steps: u32,
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub leave_browser_open: bool,
    pub reasoning_effort_options: Vec<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl ConfigDefaults {
    pub fn for_node(config: &NodeConfig) -> Self {
        Self {
            model: config.defaults.model.clone(),
            temperature: config.defaults.temperature,
            max_steps: config.defaults.max_steps,
            supported_models: config.supported_models.clone(),
            leave_browser_open: false,
            reasoning_effort_options: vec![
                ReasoningEffort::Low,
                ReasoningEffort::Medium,
                ReasoningEffort::High,
            ],
            node_id: None,
            node_name: None,
        }
    }
}

/// A failed node in an aggregated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub detail: String,
}

/// Listing merged across every node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedTasks {
    pub tasks: Vec<TaskSummary>,
    pub errors: Vec<NodeFailure>,
}

/// One row of the head's node status listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(flatten)]
    pub node: HeadNode,
    pub reachable: bool,
    pub ready: bool,
    pub issues: Vec<String>,
    pub enrollment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListing {
    pub nodes: Vec<NodeStatus>,
    pub public_key: String,
    /// Whether the head can enroll itself on nodes. The secret itself is
    /// never returned.
    pub enrollment_configured: bool,
}
