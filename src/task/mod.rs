//! Cancellable, progress-reporting unit of asynchronous work.
//!
//! A [`Task`] is a cheap clonable handle around shared state (status,
//! progress, group binding) plus the concrete behaviour behind the
//! [`TaskWork`] trait. The owning group only ever reads status and progress;
//! the work drives them through the [`TaskContext`] it receives in
//! [`TaskWork::execute`].

mod status;

pub use status::TaskStatus;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::error::TaskError;
use crate::group::GroupId;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Stable task identity, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque caller payload carried by a task.
pub type UserState = Arc<dyn Any + Send + Sync>;

/// Terminal result reported by [`TaskWork::execute`].
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded,
    /// The work observed a cancellation request and wound down.
    Cancelled,
    Failed(anyhow::Error),
}

/// Cooperative cancellation flag shared between a task and its work.
///
/// The engine never forcibly terminates executing work; it sets this token
/// and well-behaved work checks it and resolves to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The concrete behaviour behind a task.
#[async_trait]
pub trait TaskWork: Send + Sync + 'static {
    /// Begin the work. Invoked at most once per task; drives progress and
    /// intermediate status through `ctx` and resolves the task's terminal
    /// state through the returned outcome.
    async fn execute(&self, ctx: TaskContext) -> TaskOutcome;

    /// Request cooperative cancellation. The default sets the context's
    /// cancel token; `execute` is expected to observe it and wind down.
    /// There is no guarantee of an immediate stop.
    async fn cancel(&self, ctx: TaskContext) {
        ctx.cancel_token().cancel();
    }

    /// Pause hook; tasks that cannot pause keep the default.
    fn pause(&self) -> Result<(), TaskError> {
        Err(TaskError::NotSupported("pause"))
    }

    /// Resume hook; tasks that cannot resume keep the default.
    fn resume(&self) -> Result<(), TaskError> {
        Err(TaskError::NotSupported("resume"))
    }

    /// Stop hook; tasks that cannot stop keep the default.
    fn stop(&self) -> Result<(), TaskError> {
        Err(TaskError::NotSupported("stop"))
    }
}

/// Group-side sink for task transitions. Installed on association and always
/// called with no task lock held, so the handler may read the task freely.
pub(crate) trait TaskObserver: Send + Sync {
    fn task_status_changed(&self, task: &Task, old: TaskStatus, new: TaskStatus);
    fn task_progress_changed(&self, task: &Task, old: u8, new: u8);
}

#[derive(Clone)]
struct TaskBinding {
    group: GroupId,
    observer: Weak<dyn TaskObserver>,
}

struct TaskState {
    status: TaskStatus,
    progress: u8,
    started: bool,
    binding: Option<TaskBinding>,
    failure: Option<Arc<anyhow::Error>>,
}

struct TaskInner {
    id: TaskId,
    name: String,
    user_state: Option<UserState>,
    work: Arc<dyn TaskWork>,
    cancel: CancelToken,
    state: Mutex<TaskState>,
}

/// Handle to one unit of work. Clones share state.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new(name: impl Into<String>, work: impl TaskWork) -> Self {
        Self::build(name.into(), Arc::new(work), None)
    }

    pub fn with_user_state(name: impl Into<String>, work: impl TaskWork, user_state: UserState) -> Self {
        Self::build(name.into(), Arc::new(work), Some(user_state))
    }

    fn build(name: String, work: Arc<dyn TaskWork>, user_state: Option<UserState>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::next(),
                name,
                user_state,
                work,
                cancel: CancelToken::new(),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Ready,
                    progress: 0,
                    started: false,
                    binding: None,
                    failure: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn user_state(&self) -> Option<UserState> {
        self.inner.user_state.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn progress(&self) -> u8 {
        self.inner.state.lock().unwrap().progress
    }

    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    /// Group this task is associated with, if any.
    pub fn group_id(&self) -> Option<GroupId> {
        self.inner.state.lock().unwrap().binding.as_ref().map(|b| b.group)
    }

    /// Error recorded when the task failed, if any.
    pub fn failure(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.state.lock().unwrap().failure.clone()
    }

    /// Forwards to the work's pause hook.
    pub fn pause(&self) -> Result<(), TaskError> {
        self.inner.work.pause()
    }

    /// Forwards to the work's resume hook.
    pub fn resume(&self) -> Result<(), TaskError> {
        self.inner.work.resume()
    }

    /// Forwards to the work's stop hook; a no-op once terminal.
    pub fn stop(&self) -> Result<(), TaskError> {
        if self.is_completed() {
            return Ok(());
        }
        self.inner.work.stop()
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn work(&self) -> Arc<dyn TaskWork> {
        Arc::clone(&self.inner.work)
    }

    /// Associate with a group; set exactly once per association cycle.
    pub(crate) fn bind(&self, group: GroupId, observer: Weak<dyn TaskObserver>) -> Result<(), TaskError> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(existing) = state.binding.as_ref() {
            return Err(TaskError::AlreadyBound(existing.group));
        }
        state.binding = Some(TaskBinding { group, observer });
        Ok(())
    }

    pub(crate) fn unbind(&self) {
        self.inner.state.lock().unwrap().binding = None;
    }

    /// Claim the task for scheduling. Fails unless the task is `Ready` and
    /// has never been started, so a racing cancel cannot be double-counted.
    pub(crate) fn try_claim(&self) -> Result<(), TaskError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.started {
            return Err(TaskError::AlreadyStarted);
        }
        if state.status != TaskStatus::Ready {
            return Err(TaskError::NotReady(state.status));
        }
        state.started = true;
        Ok(())
    }

    /// Undo a claim whose slot reservation fell through.
    pub(crate) fn unclaim(&self) {
        self.inner.state.lock().unwrap().started = false;
    }

    /// Transition a claimed task to `Running`.
    pub(crate) fn begin(&self) {
        self.set_status(TaskStatus::Running);
    }

    /// Resolve the task from a finished work body.
    pub(crate) fn complete(&self, outcome: TaskOutcome) {
        let status = match outcome {
            TaskOutcome::Succeeded => TaskStatus::Succeeded,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
            TaskOutcome::Failed(err) => {
                tracing::warn!(task = %self.inner.id, name = %self.inner.name, error = %err, "task failed");
                self.inner.state.lock().unwrap().failure = Some(Arc::new(err));
                TaskStatus::Failed
            }
        };
        self.set_status(status);
    }

    /// Request cooperative cancellation. A task that was never scheduled
    /// resolves straight to `Cancelled`; a started one is asked to wind down.
    pub(crate) async fn request_cancel(&self) {
        let (terminal, started) = {
            let state = self.inner.state.lock().unwrap();
            (state.status.is_completed(), state.started)
        };
        if terminal {
            return;
        }
        if !started {
            self.set_status(TaskStatus::Cancelled);
            return;
        }
        self.inner.cancel.cancel();
        self.inner.work.cancel(TaskContext::new(self.clone())).await;
    }

    /// Set the status, delivering a change notification to the bound group.
    /// Same-value sets are no-ops and terminal states admit no transition.
    /// Returns whether the status actually changed.
    pub(crate) fn set_status(&self, new: TaskStatus) -> bool {
        let (old, binding) = {
            let mut state = self.inner.state.lock().unwrap();
            let old = state.status;
            if old == new || old.is_completed() {
                return false;
            }
            state.status = new;
            (old, state.binding.clone())
        };
        tracing::trace!(task = %self.inner.id, from = %old, to = %new, "task status changed");
        match binding.and_then(|b| b.observer.upgrade()) {
            Some(observer) => observer.task_status_changed(self, old, new),
            None => {
                tracing::trace!(task = %self.inner.id, "status change with no group binding");
            }
        }
        true
    }

    /// Set the progress (0..=100), delivering a change notification to the
    /// bound group. Same-value sets are no-ops.
    pub(crate) fn set_progress(&self, value: u8) -> Result<(), TaskError> {
        if value > 100 {
            return Err(TaskError::ProgressOutOfRange(value));
        }
        let (old, binding) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.status.is_completed() || state.progress == value {
                return Ok(());
            }
            let old = state.progress;
            state.progress = value;
            (old, state.binding.clone())
        };
        if let Some(observer) = binding.and_then(|b| b.observer.upgrade()) {
            observer.task_progress_changed(self, old, value);
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

/// Handle through which running work drives its own task's status and
/// progress. External readers only ever see the getters on [`Task`].
#[derive(Clone)]
pub struct TaskContext {
    task: Task,
}

impl TaskContext {
    pub(crate) fn new(task: Task) -> Self {
        Self { task }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn user_state(&self) -> Option<UserState> {
        self.task.user_state()
    }

    pub fn set_progress(&self, value: u8) -> Result<(), TaskError> {
        self.task.set_progress(value)
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.task.set_status(status);
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.inner.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.task.cancel_token()
    }
}
