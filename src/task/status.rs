//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a task.
///
/// `Ready` is the initial state. `Cancelled`, `Failed`, `Succeeded` and
/// `Stopped` are terminal: once one of them is reached no further transition
/// is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ready,
    Running,
    Paused,
    Cancelled,
    Failed,
    Succeeded,
    Stopped,
}

impl TaskStatus {
    /// True for the four terminal states.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled | TaskStatus::Failed | TaskStatus::Succeeded | TaskStatus::Stopped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
