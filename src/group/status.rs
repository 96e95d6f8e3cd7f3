//! Group counter bookkeeping and the wait/signal gate for the pump loop.
//!
//! The manager is the authoritative source of truth for scheduling: every
//! counter mutation re-evaluates one signal, asserted exactly when there is
//! nothing left to do (`remaining == 0`, the pump should exit) or there is
//! spare capacity and unscheduled work (`running < max && remaining >
//! running`). The pump blocks only here; there are no polling loops.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::StatusError;

use super::events::{EventSink, GroupCounters};

struct StatusState {
    remaining: usize,
    running: usize,
    completed: usize,
    max_running: usize,
    signaled: bool,
    /// Nesting depth of suspended updates; emission resumes at zero.
    suspend_depth: usize,
    disposed: bool,
}

/// Counters {remaining, running, completed, max_running} plus the wait
/// handle gating the scheduling loop. All operations fail with
/// [`StatusError::Disposed`] once disposed.
pub struct GroupStatusManager {
    state: Mutex<StatusState>,
    notify: Notify,
    sink: Mutex<Option<EventSink>>,
}

impl GroupStatusManager {
    /// A fresh manager has no tasks, so the signal starts asserted
    /// (`remaining == 0` means "nothing left to do").
    pub fn new(max_running: usize) -> Self {
        Self {
            state: Mutex::new(StatusState {
                remaining: 0,
                running: 0,
                completed: 0,
                max_running,
                signaled: true,
                suspend_depth: 0,
                disposed: false,
            }),
            notify: Notify::new(),
            sink: Mutex::new(None),
        }
    }

    pub(crate) fn set_sink(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn guard(&self) -> Result<MutexGuard<'_, StatusState>, StatusError> {
        let state = self.state.lock().unwrap();
        if state.disposed {
            return Err(StatusError::Disposed);
        }
        Ok(state)
    }

    fn snapshot(state: &StatusState) -> GroupCounters {
        GroupCounters {
            remaining: state.remaining,
            running: state.running,
            completed: state.completed,
            max_running: state.max_running,
        }
    }

    fn evaluate_locked(&self, state: &mut StatusState) {
        let assert = state.remaining == 0
            || (state.running < state.max_running && state.remaining > state.running);
        state.signaled = assert;
        if assert {
            self.notify.notify_waiters();
        }
    }

    /// Post-mutation step: re-evaluate the signal and hand back a counter
    /// snapshot to emit, unless updates are suspended.
    fn after_update(&self, state: &mut StatusState) -> Option<GroupCounters> {
        if state.suspend_depth > 0 {
            return None;
        }
        self.evaluate_locked(state);
        Some(Self::snapshot(state))
    }

    fn emit(&self, counters: Option<GroupCounters>) {
        if let Some(counters) = counters {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.emit(super::GroupEvent::StatusChanged(counters));
            }
        }
    }

    /// Claim a slot for one more running task.
    pub fn increment_running(&self) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            if state.running + 1 > state.remaining {
                return Err(StatusError::RunningExceedsRemaining);
            }
            if state.max_running > 0 && state.running + 1 > state.max_running {
                return Err(StatusError::RunningExceedsMax);
            }
            state.running += 1;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(())
    }

    pub fn decrement_running(&self) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            if state.running == 0 {
                return Err(StatusError::Underflow);
            }
            state.running -= 1;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(())
    }

    pub fn increment_completed(&self) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            state.completed += 1;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(())
    }

    pub fn decrement_completed(&self) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            if state.completed == 0 {
                return Err(StatusError::Underflow);
            }
            state.completed -= 1;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(())
    }

    /// Replace the remaining-task count. Returns false when unchanged.
    pub fn set_remaining(&self, remaining: usize) -> Result<bool, StatusError> {
        let emit = {
            let mut state = self.guard()?;
            if state.remaining == remaining {
                return Ok(false);
            }
            state.remaining = remaining;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(true)
    }

    pub(crate) fn add_remaining(&self, count: usize) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            state.remaining += count;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(())
    }

    pub(crate) fn sub_remaining(&self, count: usize) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            if state.remaining < count {
                return Err(StatusError::Underflow);
            }
            state.remaining -= count;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(())
    }

    pub fn max_running(&self) -> Result<usize, StatusError> {
        Ok(self.guard()?.max_running)
    }

    /// Change the concurrency cap and re-evaluate the signal, so a gated
    /// pump wakes up when the cap is raised above zero.
    pub fn set_max_running(&self, max_running: usize) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            if state.max_running == max_running {
                return Ok(());
            }
            state.max_running = max_running;
            self.after_update(&mut state)
        };
        self.emit(emit);
        Ok(())
    }

    pub fn remaining(&self) -> Result<usize, StatusError> {
        Ok(self.guard()?.remaining)
    }

    pub fn running(&self) -> Result<usize, StatusError> {
        Ok(self.guard()?.running)
    }

    pub fn completed(&self) -> Result<usize, StatusError> {
        Ok(self.guard()?.completed)
    }

    pub fn counters(&self) -> Result<GroupCounters, StatusError> {
        let state = self.guard()?;
        Ok(Self::snapshot(&state))
    }

    /// While suspended, mutations neither re-evaluate the signal nor emit
    /// StatusChanged; releasing the last suspension does both once, batching
    /// several counter mutations into one externally visible change.
    /// Suspensions nest, so concurrent batches cannot flush each other
    /// mid-mutation.
    pub fn set_suspend_update(&self, suspend: bool) -> Result<(), StatusError> {
        let emit = {
            let mut state = self.guard()?;
            if suspend {
                state.suspend_depth += 1;
                None
            } else {
                if state.suspend_depth == 0 {
                    return Ok(());
                }
                state.suspend_depth -= 1;
                if state.suspend_depth == 0 {
                    self.after_update(&mut state)
                } else {
                    None
                }
            }
        };
        self.emit(emit);
        Ok(())
    }

    /// Recompute the signal from the current counters.
    pub fn evaluate(&self) -> Result<(), StatusError> {
        let mut state = self.guard()?;
        self.evaluate_locked(&mut state);
        Ok(())
    }

    pub fn is_signaled(&self) -> Result<bool, StatusError> {
        Ok(self.guard()?.signaled)
    }

    /// Clear the signal; the next `evaluate` decides freshly.
    pub fn reset_wait(&self) -> Result<(), StatusError> {
        self.guard()?.signaled = false;
        Ok(())
    }

    /// Suspend until the signal is asserted. Returns `Disposed` when woken
    /// by disposal.
    pub async fn wait(&self) -> Result<(), StatusError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so an assert between the
            // check and the await is not lost.
            notified.as_mut().enable();
            {
                let state = self.state.lock().unwrap();
                if state.disposed {
                    return Err(StatusError::Disposed);
                }
                if state.signaled {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Idempotent; wakes any waiter so it can observe `Disposed`.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        self.notify.notify_waiters();
    }
}
