//! Task data model and lifecycle states.

pub mod model;
pub mod state;

pub use model::{
    AssistanceRequest, ChatMessage, ChatRole, PersistedTask, ReasoningEffort, TaskCreate,
    TaskDetail, TaskRecord, TaskStep, TaskSummary,
};
pub use state::TaskStatus;
