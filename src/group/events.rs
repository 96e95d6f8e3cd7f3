//! Group event types and the serialized delivery channel.
//!
//! Every task-level and group-level event goes through one unbounded sender
//! per group, and the caller consumes the single receiver. Handler code is
//! therefore single-threaded per group by construction: FIFO, no concurrent
//! re-entrancy between events of the same group.

use tokio::sync::mpsc;

use crate::task::{Task, TaskStatus};

/// Snapshot of the group counters, carried by [`GroupEvent::StatusChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCounters {
    /// Tasks associated and not yet terminal.
    pub remaining: usize,
    /// Tasks presently executing.
    pub running: usize,
    /// Tasks that reached a terminal state other than `Cancelled`.
    pub completed: usize,
    /// Concurrency cap; zero gates all scheduling.
    pub max_running: usize,
}

/// Events delivered on a group's serialized channel.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// The group transitioned Idle -> Executing.
    Started,
    /// The pump exited; the group is Idle again.
    Stopped,
    /// A task joined the group (always precedes its `TaskStarted`).
    TaskAssociated(Task),
    /// A task was scheduled onto a slot.
    TaskStarted(Task),
    /// A task reached a terminal state and was accounted for.
    TaskStopped(Task),
    /// Aggregate group progress changed (deduplicated, 0..=100).
    ProgressChanged(u8),
    /// One or more group counters changed.
    StatusChanged(GroupCounters),
    /// Pass-through of a single task's progress change.
    TaskProgressChanged { task: Task, progress: u8 },
    /// Pass-through of a single task's status change.
    TaskStatusChanged { task: Task, status: TaskStatus },
}

/// Sending half of the per-group dispatch channel.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<GroupEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: GroupEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("group event dropped: no consumer");
        }
    }
}
