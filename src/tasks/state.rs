//! Task state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued for dispatch.
    Pending,
    /// Waiting for its start time.
    Scheduled,
    /// The agent runner is driving the browser.
    Running,
    /// The runner asked for a human and is suspended.
    WaitingForInput,
    /// The runner finished without errors.
    Completed,
    /// The runner raised or reported errors.
    Failed,
    /// The run was lost to a process restart.
    Stopped,
    /// The task was deleted while in flight.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        if *self == target {
            return true;
        }

        matches!(
            (self, target),
            // From Scheduled
            (Scheduled, Pending) | (Scheduled, Cancelled) |
            // From Pending
            (Pending, Running) | (Pending, Failed) |
            (Pending, Stopped) | (Pending, Cancelled) |
            // From Running
            (Running, WaitingForInput) | (Running, Completed) | (Running, Failed) |
            (Running, Stopped) | (Running, Cancelled) |
            // From WaitingForInput
            (WaitingForInput, Running) | (WaitingForInput, Failed) |
            (WaitingForInput, Stopped) | (WaitingForInput, Cancelled) |
            // Continue after a finished run
            (Completed, Pending) | (Failed, Pending) | (Stopped, Pending)
        )
    }

    /// No run is attached to a task in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Cancelled
        )
    }

    /// States that imply a live runner. After a restart no runner exists, so
    /// these are reconciled to `Stopped`.
    pub fn implies_live_run(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::WaitingForInput)
    }

    /// Whether "continue" may restart a task from this state.
    pub fn can_continue(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
