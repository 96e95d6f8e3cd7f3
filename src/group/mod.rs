//! Task group orchestrator.
//!
//! A [`TaskGroup`] binds itself to one [`TaskCollection`], runs a pump loop
//! that starts ready tasks up to the concurrency cap, relays per-task and
//! group-level events on one serialized channel, and manages the
//! execute/cancel/stop/dispose lifecycle. Multiple independent groups can
//! coexist; there is no process-wide state beyond id allocation.

mod events;
mod progress;
mod pump;
mod status;

pub use events::{GroupCounters, GroupEvent};
pub use progress::GroupProgressManager;
pub use status::GroupStatusManager;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use crate::collection::{CollectionObserver, TaskCollection};
use crate::config::EngineConfig;
use crate::error::GroupError;
use crate::task::{Task, TaskContext, TaskObserver, TaskOutcome, TaskStatus};

use events::EventSink;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Stable group identity. Tasks record it on association; the group checks
/// it before mutating a task on the collection's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Executing,
    Cancelling,
}

struct GroupBook {
    run_state: RunState,
    /// Tasks presently executing; never longer than the concurrency cap.
    current: Vec<Task>,
}

struct GroupInner {
    id: GroupId,
    self_weak: Weak<GroupInner>,
    status: GroupStatusManager,
    progress: GroupProgressManager,
    collection: TaskCollection,
    book: Mutex<GroupBook>,
    sink: EventSink,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
    disposed: AtomicBool,
}

/// Bounded-concurrency task orchestrator bound to one collection.
pub struct TaskGroup {
    inner: Arc<GroupInner>,
    events: Mutex<Option<UnboundedReceiver<GroupEvent>>>,
}

impl TaskGroup {
    /// Create a group over `collection` running at most `max_running` tasks
    /// at once. A cap of zero keeps the group gated until raised.
    pub fn new(max_running: usize, collection: TaskCollection) -> Result<Self, GroupError> {
        Self::with_managers(
            collection,
            GroupStatusManager::new(max_running),
            GroupProgressManager::new(),
        )
    }

    pub fn from_config(config: &EngineConfig, collection: TaskCollection) -> Result<Self, GroupError> {
        Self::new(config.max_running_tasks, collection)
    }

    /// Create a group with externally supplied status/progress managers.
    pub fn with_managers(
        collection: TaskCollection,
        status: GroupStatusManager,
        progress: GroupProgressManager,
    ) -> Result<Self, GroupError> {
        let (sink, events_rx) = EventSink::channel();
        status.set_sink(sink.clone());
        progress.set_sink(sink.clone());

        let (stopped_tx, stopped_rx) = watch::channel(false);
        let inner = Arc::new_cyclic(|weak| GroupInner {
            id: GroupId::next(),
            self_weak: weak.clone(),
            status,
            progress,
            collection: collection.clone(),
            book: Mutex::new(GroupBook {
                run_state: RunState::Idle,
                current: Vec::new(),
            }),
            sink,
            stopped_tx,
            stopped_rx,
            disposed: AtomicBool::new(false),
        });

        collection.bind_observer(Arc::downgrade(&inner) as Weak<dyn CollectionObserver>)?;
        let existing = collection.snapshot();
        if !existing.is_empty() {
            inner.associate_tasks(&existing);
        }
        tracing::debug!(group = %inner.id, tasks = existing.len(), "task group created");

        Ok(Self {
            inner,
            events: Mutex::new(Some(events_rx)),
        })
    }

    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    pub fn collection(&self) -> &TaskCollection {
        &self.inner.collection
    }

    pub fn status_manager(&self) -> &GroupStatusManager {
        &self.inner.status
    }

    pub fn progress_manager(&self) -> &GroupProgressManager {
        &self.inner.progress
    }

    /// Take the single consumer of the group's serialized event channel.
    /// Returns `None` after the first call.
    pub fn take_events(&self) -> Option<UnboundedReceiver<GroupEvent>> {
        self.events.lock().unwrap().take()
    }

    pub fn remaining_tasks(&self) -> Result<usize, GroupError> {
        Ok(self.inner.status.remaining()?)
    }

    pub fn running_tasks(&self) -> Result<usize, GroupError> {
        Ok(self.inner.status.running()?)
    }

    pub fn completed_tasks(&self) -> Result<usize, GroupError> {
        Ok(self.inner.status.completed()?)
    }

    pub fn max_running_tasks(&self) -> Result<usize, GroupError> {
        Ok(self.inner.status.max_running()?)
    }

    pub fn set_max_running_tasks(&self, max_running: usize) -> Result<(), GroupError> {
        Ok(self.inner.status.set_max_running(max_running)?)
    }

    /// Aggregate group progress, 0..=100.
    pub fn progress(&self) -> Result<u8, GroupError> {
        Ok(self.inner.progress.aggregate()?)
    }

    pub fn is_executing(&self) -> bool {
        self.inner.book.lock().unwrap().run_state != RunState::Idle
    }

    /// Watch handle that becomes true each time the group stops.
    pub fn handle(&self) -> watch::Receiver<bool> {
        self.inner.stopped_rx.clone()
    }

    /// Suspend until the current run stops (returns immediately when idle
    /// and already stopped at least once, or after disposal).
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.stopped_rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Start executing tasks. No-op while a run (or a cancellation drain) is
    /// already in progress. A pump that cannot be spawned is reported as an
    /// immediately completed run: the group resets to Idle and emits
    /// `Stopped`.
    pub fn execute(&self) -> Result<(), GroupError> {
        if self.inner.is_disposed() {
            return Err(GroupError::Disposed);
        }
        {
            let mut book = self.inner.book.lock().unwrap();
            if book.run_state != RunState::Idle {
                return Ok(());
            }
            book.run_state = RunState::Executing;
        }
        let _ = self.inner.stopped_tx.send(false);
        self.inner.sink.emit(GroupEvent::Started);
        tracing::info!(group = %self.inner.id, "task group executing");

        if let Err(err) = self.inner.status.evaluate() {
            self.inner.finish_run();
            return Err(err.into());
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pump::run(Arc::clone(&self.inner)));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(group = %self.inner.id, error = %err, "pump spawn failed; run aborted");
                self.inner.finish_run();
                Ok(())
            }
        }
    }

    /// Request cooperative cancellation of the whole group. Only the first
    /// caller triggers propagation; queued tasks resolve to `Cancelled`
    /// without ever starting, in-flight tasks are asked to wind down, and
    /// the run stops once every task is terminal.
    pub async fn cancel(&self) -> Result<(), GroupError> {
        if self.inner.is_disposed() {
            return Err(GroupError::Disposed);
        }
        let propagate = {
            let mut book = self.inner.book.lock().unwrap();
            match book.run_state {
                RunState::Executing => {
                    book.run_state = RunState::Cancelling;
                    true
                }
                RunState::Cancelling => false,
                RunState::Idle => true,
            }
        };
        if !propagate {
            return Ok(());
        }
        tracing::info!(group = %self.inner.id, "cancelling task group");
        for task in self.inner.tracked_snapshot() {
            if !task.is_completed() {
                task.request_cancel().await;
            }
        }
        Ok(())
    }

    /// Forward the stop hook to every tracked task. Tasks without stop
    /// support keep running; their refusal is logged, not raised.
    pub fn stop(&self) -> Result<(), GroupError> {
        if self.inner.is_disposed() {
            return Err(GroupError::Disposed);
        }
        tracing::info!(group = %self.inner.id, "stopping task group");
        for task in self.inner.tracked_snapshot() {
            if let Err(err) = task.stop() {
                tracing::debug!(group = %self.inner.id, task = %task.id(), error = %err, "stop not honored");
            }
        }
        Ok(())
    }

    /// Tear down all associations. Idempotent, safe from any thread, and
    /// non-blocking: in-flight tasks are not waited for. Callers that need
    /// quiescence must cancel/stop and await `wait_stopped` first.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(group = %self.inner.id, "disposing task group");
        self.inner.collection.unbind_observer();
        for task in self.inner.collection.snapshot() {
            task.unbind();
        }
        let current = {
            let mut book = self.inner.book.lock().unwrap();
            book.run_state = RunState::Idle;
            std::mem::take(&mut book.current)
        };
        for task in current {
            task.unbind();
        }
        self.inner.progress.dispose();
        // Wakes the pump, whose wait() then observes Disposed and exits.
        self.inner.status.dispose();
        let _ = self.inner.stopped_tx.send(true);
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.inner.id)
            .field("executing", &self.is_executing())
            .finish()
    }
}

impl GroupInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn is_cancelling(&self) -> bool {
        self.book.lock().unwrap().run_state == RunState::Cancelling
    }

    /// All tasks the group currently knows about: the collection contents
    /// plus any in-flight task already removed from the collection.
    fn tracked_snapshot(&self) -> Vec<Task> {
        let mut tasks = self.collection.snapshot();
        let book = self.book.lock().unwrap();
        for task in &book.current {
            if !tasks.iter().any(|t| t.id() == task.id()) {
                tasks.push(task.clone());
            }
        }
        tasks
    }

    /// Wire new tasks into the group: bind, track progress, bump the
    /// remaining count, and announce the association.
    fn associate_tasks(&self, tasks: &[Task]) {
        let observer = self.self_weak.clone() as Weak<dyn TaskObserver>;
        let mut added = 0usize;
        for task in tasks {
            if let Err(err) = task.bind(self.id, observer.clone()) {
                tracing::error!(group = %self.id, task = %task.id(), error = %err, "cannot associate task");
                continue;
            }
            if let Err(err) = self.progress.add(task) {
                tracing::error!(group = %self.id, task = %task.id(), error = %err, "task not eligible for tracking");
                task.unbind();
                continue;
            }
            added += 1;
            self.sink.emit(GroupEvent::TaskAssociated(task.clone()));
            tracing::debug!(group = %self.id, task = %task.id(), name = %task.name(), "task associated");
        }
        if added > 0 {
            if let Err(err) = self.status.add_remaining(added) {
                tracing::warn!(group = %self.id, error = %err, "remaining count not updated");
            }
        }
    }

    /// Pump step: claim the earliest ready task, reserve a slot, and launch
    /// its work. A claim or slot race simply leaves the task for the next
    /// signal.
    fn schedule_next(&self) {
        let Some(task) = self.collection.first_ready() else {
            tracing::trace!(group = %self.id, "no ready task to schedule");
            return;
        };
        if task.try_claim().is_err() {
            return;
        }
        self.book.lock().unwrap().current.push(task.clone());
        if let Err(err) = self.status.increment_running() {
            tracing::debug!(group = %self.id, task = %task.id(), error = %err, "slot reservation failed");
            self.book.lock().unwrap().current.retain(|t| t.id() != task.id());
            task.unclaim();
            return;
        }
        self.sink.emit(GroupEvent::TaskStarted(task.clone()));
        tracing::debug!(group = %self.id, task = %task.id(), name = %task.name(), "task started");
        task.begin();
        self.spawn_execution(task);
    }

    /// Run the work body as its own tokio task. A panic inside the body is
    /// absorbed and folded into a `Failed` completion, so one bad task never
    /// halts the group.
    fn spawn_execution(&self, task: Task) {
        let work = task.work();
        let ctx = TaskContext::new(task.clone());
        let body = tokio::spawn(async move { work.execute(ctx).await });
        tokio::spawn(async move {
            match body.await {
                Ok(outcome) => task.complete(outcome),
                Err(err) => {
                    tracing::warn!(task = %task.id(), error = %err, "task body aborted");
                    task.complete(TaskOutcome::Failed(anyhow::anyhow!(
                        "task body aborted: {err}"
                    )));
                }
            }
        });
    }

    /// Completion accounting, batched into one externally visible counter
    /// change: release the slot, count the completion (cancellations do not
    /// count), and drop the task from the remaining pool.
    fn on_task_completed(&self, task: &Task, status: TaskStatus) {
        let was_current = {
            let mut book = self.book.lock().unwrap();
            let before = book.current.len();
            book.current.retain(|t| t.id() != task.id());
            before != book.current.len()
        };
        let _ = self.status.set_suspend_update(true);
        if was_current {
            if let Err(err) = self.status.decrement_running() {
                tracing::warn!(group = %self.id, task = %task.id(), error = %err, "running count not released");
            }
        }
        if status != TaskStatus::Cancelled {
            let _ = self.status.increment_completed();
        }
        if let Err(err) = self.status.sub_remaining(1) {
            tracing::warn!(group = %self.id, task = %task.id(), error = %err, "remaining count not released");
        }
        let _ = self.status.set_suspend_update(false);
        // A task removed from the collection mid-flight had its removal
        // deferred to this point: finish it by releasing the progress slot
        // and clearing the binding.
        let still_listed = self.collection.snapshot().iter().any(|t| t.id() == task.id());
        if !still_listed {
            if let Err(err) = self.progress.remove(task) {
                tracing::debug!(group = %self.id, task = %task.id(), error = %err, "task was not tracked");
            }
            task.unbind();
        }
        self.sink.emit(GroupEvent::TaskStopped(task.clone()));
        tracing::debug!(group = %self.id, task = %task.id(), status = %status, "task stopped");
    }

    /// Pump exit: back to Idle, announce `Stopped`, signal the handle.
    fn finish_run(&self) {
        {
            let mut book = self.book.lock().unwrap();
            book.run_state = RunState::Idle;
            book.current.clear();
        }
        tracing::info!(group = %self.id, "task group stopped");
        if !self.is_disposed() {
            self.sink.emit(GroupEvent::Stopped);
        }
        let _ = self.stopped_tx.send(true);
    }

    fn handle_removed(&self, task: &Task) {
        if task.group_id() != Some(self.id) {
            tracing::warn!(group = %self.id, task = %task.id(), "removed task does not belong to this group");
            return;
        }
        let in_current = {
            let book = self.book.lock().unwrap();
            book.current.iter().any(|t| t.id() == task.id())
        };
        if in_current {
            // In-flight: removal is deferred to the task's own completion;
            // just ask it to wind down.
            let task = task.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { task.request_cancel().await });
                }
                Err(_) => task.cancel_token().cancel(),
            }
            return;
        }
        match task.status() {
            TaskStatus::Ready | TaskStatus::Paused => {
                if let Err(err) = self.status.sub_remaining(1) {
                    tracing::warn!(group = %self.id, task = %task.id(), error = %err, "remaining count not released");
                }
            }
            status if status.is_completed() => {
                // Already accounted for at completion.
            }
            status => {
                tracing::warn!(group = %self.id, task = %task.id(), %status, "removed task in unexpected status");
            }
        }
        if let Err(err) = self.progress.remove(task) {
            tracing::debug!(group = %self.id, task = %task.id(), error = %err, "task was not tracked");
        }
        task.unbind();
    }
}

impl CollectionObserver for GroupInner {
    fn tasks_added(&self, tasks: &[Task]) {
        if self.is_disposed() {
            return;
        }
        self.associate_tasks(tasks);
    }

    fn tasks_removed(&self, tasks: &[Task]) {
        if self.is_disposed() {
            return;
        }
        for task in tasks {
            self.handle_removed(task);
        }
    }
}

impl TaskObserver for GroupInner {
    fn task_status_changed(&self, task: &Task, _old: TaskStatus, new: TaskStatus) {
        if self.is_disposed() {
            return;
        }
        self.sink.emit(GroupEvent::TaskStatusChanged {
            task: task.clone(),
            status: new,
        });
        if new.is_completed() {
            self.on_task_completed(task, new);
        }
    }

    fn task_progress_changed(&self, task: &Task, _old: u8, new: u8) {
        if self.is_disposed() {
            return;
        }
        self.sink.emit(GroupEvent::TaskProgressChanged {
            task: task.clone(),
            progress: new,
        });
        if let Err(err) = self.progress.update(task, new) {
            tracing::warn!(group = %self.id, task = %task.id(), error = %err, "progress update rejected");
        }
    }
}
