//! Error taxonomy: contract violations are typed and surfaced synchronously;
//! runtime task failures never travel as errors, only as completion state.

use thiserror::Error;

use crate::group::GroupId;
use crate::task::{TaskId, TaskStatus};

/// Contract violations on a single task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Progress must stay within 0..=100.
    #[error("progress {0} is out of range (0..=100)")]
    ProgressOutOfRange(u8),
    /// A task may be associated with one group at a time; re-association
    /// without clearing the previous binding is a caller error.
    #[error("task is already bound to group {0}")]
    AlreadyBound(GroupId),
    /// The task has already gone through its Ready -> terminal cycle.
    #[error("task has already been started")]
    AlreadyStarted,
    /// Only a `Ready` task can be scheduled.
    #[error("task is not ready to start (status {0:?})")]
    NotReady(TaskStatus),
    /// Default answer of the pause/resume/stop hooks.
    #[error("{0} is not supported by this task")]
    NotSupported(&'static str),
}

/// Counter contract violations inside the group status manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("running task count cannot exceed remaining tasks")]
    RunningExceedsRemaining,
    #[error("running task count cannot exceed the concurrency cap")]
    RunningExceedsMax,
    #[error("counter is already zero")]
    Underflow,
    #[error("status manager has been disposed")]
    Disposed,
}

/// Contract violations inside the group progress manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    #[error("task {0} is already tracked")]
    AlreadyTracked(TaskId),
    /// Only a fresh task (Ready, zero progress) may join the aggregate.
    #[error("task {id} cannot be tracked: status {status:?} with progress {progress}")]
    NotEligible {
        id: TaskId,
        status: TaskStatus,
        progress: u8,
    },
    #[error("task {0} is not tracked")]
    NotTracked(TaskId),
    #[error("progress {0} is out of range (0..=100)")]
    OutOfRange(u8),
    #[error("progress manager has been disposed")]
    Disposed,
}

/// Errors surfaced by the task group itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("task group has been disposed")]
    Disposed,
    /// A collection may feed one group at a time.
    #[error("collection is already bound to a task group")]
    CollectionAlreadyBound,
    #[error(transparent)]
    Status(StatusError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Progress(ProgressError),
}

// Component-level disposal collapses to the group's own `Disposed`, so
// callers see one error regardless of which member they touched first.
impl From<StatusError> for GroupError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::Disposed => GroupError::Disposed,
            other => GroupError::Status(other),
        }
    }
}

impl From<ProgressError> for GroupError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::Disposed => GroupError::Disposed,
            other => GroupError::Progress(other),
        }
    }
}
