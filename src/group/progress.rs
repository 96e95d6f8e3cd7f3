//! Aggregation of per-task progress into one group-level percentage.
//!
//! Each tracked task contributes a 0..=100 slice; the aggregate is the floor
//! of `sum / count`. Re-emission is deduplicated: the group-level
//! ProgressChanged event fires only when the rounded aggregate moves.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::ProgressError;
use crate::task::{Task, TaskId, TaskStatus};

use super::events::{EventSink, GroupEvent};

struct ProgressState {
    tracked: HashMap<TaskId, u8>,
    /// Sum of per-task progress, including tasks that completed at 100%
    /// and were since dropped.
    sum: u64,
    /// Total capacity: 100 per task ever added, minus 100 per task removed
    /// before completing.
    slots: u64,
    last_emitted: Option<u8>,
    disposed: bool,
}

/// Maps each tracked task to its last-known progress and keeps the running
/// aggregate for the whole group.
pub struct GroupProgressManager {
    state: Mutex<ProgressState>,
    sink: Mutex<Option<EventSink>>,
}

impl GroupProgressManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                tracked: HashMap::new(),
                sum: 0,
                slots: 0,
                last_emitted: None,
                disposed: false,
            }),
            sink: Mutex::new(None),
        }
    }

    pub(crate) fn set_sink(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn guard(&self) -> Result<MutexGuard<'_, ProgressState>, ProgressError> {
        let state = self.state.lock().unwrap();
        if state.disposed {
            return Err(ProgressError::Disposed);
        }
        Ok(state)
    }

    fn aggregate_locked(state: &ProgressState) -> u8 {
        if state.slots == 0 {
            return 0;
        }
        (state.sum * 100 / state.slots) as u8
    }

    /// Track a task. Only a fresh task (Ready at zero progress) is
    /// eligible; anything else is a caller error.
    pub fn add(&self, task: &Task) -> Result<(), ProgressError> {
        let mut state = self.guard()?;
        let status = task.status();
        let progress = task.progress();
        if status != TaskStatus::Ready || progress != 0 {
            return Err(ProgressError::NotEligible {
                id: task.id(),
                status,
                progress,
            });
        }
        if state.tracked.contains_key(&task.id()) {
            return Err(ProgressError::AlreadyTracked(task.id()));
        }
        state.tracked.insert(task.id(), 0);
        state.slots += 100;
        Ok(())
    }

    pub fn add_all(&self, tasks: &[Task]) -> Result<(), ProgressError> {
        for task in tasks {
            self.add(task)?;
        }
        Ok(())
    }

    /// Stop tracking a task. One that finished at 100% is dropped without
    /// touching the running total (its contribution is fully counted); a
    /// partial task has its contribution subtracted and its slot released.
    pub fn remove(&self, task: &Task) -> Result<(), ProgressError> {
        let mut state = self.guard()?;
        let Some(progress) = state.tracked.remove(&task.id()) else {
            return Err(ProgressError::NotTracked(task.id()));
        };
        if progress < 100 {
            state.sum -= u64::from(progress);
            state.slots -= 100;
        }
        Ok(())
    }

    pub fn remove_all(&self, tasks: &[Task]) -> Result<(), ProgressError> {
        for task in tasks {
            self.remove(task)?;
        }
        Ok(())
    }

    /// Record a task's new progress and re-emit the aggregate if it moved.
    pub fn update(&self, task: &Task, progress: u8) -> Result<(), ProgressError> {
        if progress > 100 {
            return Err(ProgressError::OutOfRange(progress));
        }
        let emit = {
            let mut state = self.guard()?;
            let Some(entry) = state.tracked.get_mut(&task.id()) else {
                return Err(ProgressError::NotTracked(task.id()));
            };
            let old = *entry;
            *entry = progress;
            state.sum = state.sum - u64::from(old) + u64::from(progress);
            let aggregate = Self::aggregate_locked(&state);
            if state.last_emitted != Some(aggregate) {
                state.last_emitted = Some(aggregate);
                Some(aggregate)
            } else {
                None
            }
        };
        if let Some(aggregate) = emit {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.emit(GroupEvent::ProgressChanged(aggregate));
            }
        }
        Ok(())
    }

    /// Current aggregate group progress, 0..=100.
    pub fn aggregate(&self) -> Result<u8, ProgressError> {
        let state = self.guard()?;
        Ok(Self::aggregate_locked(&state))
    }

    pub fn tracked_count(&self) -> Result<usize, ProgressError> {
        Ok(self.guard()?.tracked.len())
    }

    /// Clear all state, for reuse between group executions.
    pub fn reset(&self) -> Result<(), ProgressError> {
        let mut state = self.guard()?;
        state.tracked.clear();
        state.sum = 0;
        state.slots = 0;
        state.last_emitted = None;
        Ok(())
    }

    /// Idempotent; all further operations fail with `Disposed`.
    pub fn dispose(&self) {
        self.state.lock().unwrap().disposed = true;
    }
}

impl Default for GroupProgressManager {
    fn default() -> Self {
        Self::new()
    }
}
