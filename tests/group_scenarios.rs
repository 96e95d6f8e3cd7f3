//! End-to-end scheduling scenarios for the task group engine.
//!
//! Each test drives a group through its public surface only: a collection,
//! a concurrency cap, and the serialized event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use taskgroup::collection::TaskCollection;
use taskgroup::error::{GroupError, TaskError};
use taskgroup::group::{GroupEvent, TaskGroup};
use taskgroup::task::{Task, TaskContext, TaskId, TaskOutcome, TaskStatus, TaskWork};

/// Work that reports progress and succeeds after a short delay.
struct QuickWork {
    delay: Duration,
}

impl QuickWork {
    fn instant() -> Self {
        Self {
            delay: Duration::from_millis(5),
        }
    }
}

#[async_trait]
impl TaskWork for QuickWork {
    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        ctx.set_progress(50).unwrap();
        tokio::time::sleep(self.delay).await;
        if ctx.is_cancelled() {
            return TaskOutcome::Cancelled;
        }
        ctx.set_progress(100).unwrap();
        TaskOutcome::Succeeded
    }
}

/// Work that runs until its cancel token is set.
struct UntilCancelled;

#[async_trait]
impl TaskWork for UntilCancelled {
    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        loop {
            if ctx.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Work whose body panics immediately: the scheduling-time failure case.
struct PanicWork;

#[async_trait]
impl TaskWork for PanicWork {
    async fn execute(&self, _ctx: TaskContext) -> TaskOutcome {
        panic!("deliberate test panic");
    }
}

async fn next_event(rx: &mut UnboundedReceiver<GroupEvent>) -> GroupEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a group event")
        .expect("event channel closed")
}

/// Collect events until (and including) `Stopped`.
async fn drain_until_stopped(rx: &mut UnboundedReceiver<GroupEvent>) -> Vec<GroupEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let stopped = matches!(event, GroupEvent::Stopped);
        events.push(event);
        if stopped {
            return events;
        }
    }
}

fn started_ids(events: &[GroupEvent]) -> Vec<TaskId> {
    events
        .iter()
        .filter_map(|e| match e {
            GroupEvent::TaskStarted(task) => Some(task.id()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn five_quick_tasks_run_under_a_cap_of_two() {
    let collection = TaskCollection::new();
    for i in 0..5 {
        collection.push(Task::new(format!("t{i}"), QuickWork::instant()));
    }
    let group = TaskGroup::new(2, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    let events = drain_until_stopped(&mut rx).await;

    let started = started_ids(&events).len();
    let stopped = events
        .iter()
        .filter(|e| matches!(e, GroupEvent::TaskStopped(_)))
        .count();
    assert_eq!(started, 5);
    assert_eq!(stopped, 5);
    assert_eq!(group.completed_tasks().unwrap(), 5);
    assert_eq!(group.remaining_tasks().unwrap(), 0);
    assert_eq!(group.running_tasks().unwrap(), 0);

    let max_observed_running = events
        .iter()
        .filter_map(|e| match e {
            GroupEvent::StatusChanged(c) => Some(c.running),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    assert!(max_observed_running <= 2, "cap exceeded: {max_observed_running}");

    for task in collection.snapshot() {
        assert_eq!(task.status(), TaskStatus::Succeeded);
        assert_eq!(task.progress(), 100);
    }
    assert_eq!(group.progress().unwrap(), 100);
    assert!(!group.is_executing());
}

#[tokio::test]
async fn cancel_mid_run_drains_every_task_without_starting_queued_ones() {
    let collection = TaskCollection::new();
    for i in 0..5 {
        collection.push(Task::new(format!("t{i}"), UntilCancelled));
    }
    let group = TaskGroup::new(3, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    // Wait for the three slots to fill.
    let mut events = Vec::new();
    while started_ids(&events).len() < 3 {
        events.push(next_event(&mut rx).await);
    }

    group.cancel().await.unwrap();
    events.extend(drain_until_stopped(&mut rx).await);

    // The two queued tasks never started; all five are terminal.
    assert_eq!(started_ids(&events).len(), 3);
    for task in collection.snapshot() {
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }
    // Cancellations do not count as completions: 0 + 5 == 5.
    assert_eq!(group.completed_tasks().unwrap(), 0);
    assert_eq!(group.remaining_tasks().unwrap(), 0);
    assert_eq!(group.running_tasks().unwrap(), 0);
}

#[tokio::test]
async fn task_added_mid_run_is_associated_then_scheduled() {
    let collection = TaskCollection::new();
    collection.push(Task::new(
        "first",
        QuickWork {
            delay: Duration::from_millis(50),
        },
    ));
    let group = TaskGroup::new(1, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    let mut events = Vec::new();
    while started_ids(&events).is_empty() {
        events.push(next_event(&mut rx).await);
    }

    let late = Task::new("late", QuickWork::instant());
    collection.push(late.clone());
    // Bookkeeping is synchronous: the count reflects the add immediately.
    assert_eq!(group.remaining_tasks().unwrap(), 2);

    events.extend(drain_until_stopped(&mut rx).await);

    let associated_at = events
        .iter()
        .position(|e| matches!(e, GroupEvent::TaskAssociated(t) if t.id() == late.id()))
        .expect("late task associated");
    let started_at = events
        .iter()
        .position(|e| matches!(e, GroupEvent::TaskStarted(t) if t.id() == late.id()))
        .expect("late task started");
    assert!(associated_at < started_at);
    assert_eq!(late.status(), TaskStatus::Succeeded);
    assert_eq!(group.completed_tasks().unwrap(), 2);
}

#[tokio::test]
async fn removing_a_ready_task_unqueues_it() {
    let collection = TaskCollection::new();
    let slow = Task::new(
        "slow",
        QuickWork {
            delay: Duration::from_millis(50),
        },
    );
    let queued = Task::new("queued", QuickWork::instant());
    collection.push_all(vec![slow.clone(), queued.clone()]);

    let group = TaskGroup::new(1, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    let mut events = Vec::new();
    while started_ids(&events).is_empty() {
        events.push(next_event(&mut rx).await);
    }

    assert!(collection.remove(&queued));
    assert_eq!(group.remaining_tasks().unwrap(), 1);

    events.extend(drain_until_stopped(&mut rx).await);

    assert!(!started_ids(&events).contains(&queued.id()));
    assert_eq!(queued.status(), TaskStatus::Ready);
    assert!(queued.group_id().is_none());
    assert_eq!(group.completed_tasks().unwrap(), 1);
}

#[tokio::test]
async fn removing_an_in_flight_task_disassociates_it_on_completion() {
    let collection = TaskCollection::new();
    let running = Task::new("running", UntilCancelled);
    let quick = Task::new("quick", QuickWork::instant());
    collection.push_all(vec![running.clone(), quick.clone()]);

    let group = TaskGroup::new(2, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    let mut events = Vec::new();
    while !started_ids(&events).contains(&running.id()) {
        events.push(next_event(&mut rx).await);
    }

    // Removal of an executing task is deferred to its completion.
    assert!(collection.remove(&running));
    events.extend(drain_until_stopped(&mut rx).await);

    assert_eq!(running.status(), TaskStatus::Cancelled);
    assert!(running.group_id().is_none());
    // Its progress slot was released, so the survivor alone defines the
    // aggregate.
    assert_eq!(group.progress().unwrap(), 100);
    assert_eq!(group.completed_tasks().unwrap(), 1);
    assert_eq!(group.remaining_tasks().unwrap(), 0);
}

#[tokio::test]
async fn stop_propagates_to_tasks_that_support_it() {
    struct StoppableWork {
        stop_requested: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskWork for StoppableWork {
        async fn execute(&self, _ctx: TaskContext) -> TaskOutcome {
            loop {
                if self.stop_requested.load(Ordering::Relaxed) {
                    return TaskOutcome::Succeeded;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        fn stop(&self) -> Result<(), TaskError> {
            self.stop_requested.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    let collection = TaskCollection::new();
    let stoppable = Task::new(
        "stoppable",
        StoppableWork {
            stop_requested: Arc::new(AtomicBool::new(false)),
        },
    );
    let stubborn = Task::new("stubborn", UntilCancelled);
    collection.push_all(vec![stoppable.clone(), stubborn.clone()]);

    let group = TaskGroup::new(2, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    let mut events = Vec::new();
    while started_ids(&events).len() < 2 {
        events.push(next_event(&mut rx).await);
    }

    // Stop succeeds as a whole even though one task keeps the default
    // refusing hook.
    group.stop().unwrap();
    // Wind down the task that ignored the stop request.
    group.cancel().await.unwrap();
    drain_until_stopped(&mut rx).await;

    assert_eq!(stoppable.status(), TaskStatus::Succeeded);
    assert_eq!(stubborn.status(), TaskStatus::Cancelled);
    assert_eq!(group.completed_tasks().unwrap(), 1);
    assert_eq!(group.remaining_tasks().unwrap(), 0);
}

#[tokio::test]
async fn zero_cap_gates_scheduling_until_raised() {
    let collection = TaskCollection::new();
    let tasks: Vec<Task> = (0..2)
        .map(|i| Task::new(format!("t{i}"), QuickWork::instant()))
        .collect();
    collection.push_all(tasks.clone());

    let group = TaskGroup::new(0, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(group.running_tasks().unwrap(), 0);
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(started_ids(&events).is_empty(), "nothing may start under a zero cap");
    assert!(group.is_executing());

    group.set_max_running_tasks(2).unwrap();
    events.extend(drain_until_stopped(&mut rx).await);

    assert_eq!(started_ids(&events).len(), 2);
    assert_eq!(group.completed_tasks().unwrap(), 2);
    for task in tasks {
        assert_eq!(task.status(), TaskStatus::Succeeded);
    }
}

#[tokio::test]
async fn a_panicking_task_is_absorbed_and_counted() {
    let collection = TaskCollection::new();
    let bad = Task::new("bad", PanicWork);
    let good = Task::new("good", QuickWork::instant());
    collection.push_all(vec![bad.clone(), good.clone()]);

    let group = TaskGroup::new(1, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();
    drain_until_stopped(&mut rx).await;

    assert_eq!(bad.status(), TaskStatus::Failed);
    assert!(bad.failure().is_some());
    assert_eq!(good.status(), TaskStatus::Succeeded);
    assert_eq!(group.completed_tasks().unwrap(), 2);
    assert_eq!(group.remaining_tasks().unwrap(), 0);
}

#[tokio::test]
async fn mixed_outcomes_obey_the_conservation_law() {
    struct FailingWork;

    #[async_trait]
    impl TaskWork for FailingWork {
        async fn execute(&self, _ctx: TaskContext) -> TaskOutcome {
            TaskOutcome::Failed(anyhow::anyhow!("deliberate failure"))
        }
    }

    struct SelfCancellingWork;

    #[async_trait]
    impl TaskWork for SelfCancellingWork {
        async fn execute(&self, _ctx: TaskContext) -> TaskOutcome {
            TaskOutcome::Cancelled
        }
    }

    let collection = TaskCollection::new();
    collection.push_all(vec![
        Task::new("ok-1", QuickWork::instant()),
        Task::new("ok-2", QuickWork::instant()),
        Task::new("bad", FailingWork),
        Task::new("quitter", SelfCancellingWork),
    ]);

    let group = TaskGroup::new(2, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();
    drain_until_stopped(&mut rx).await;

    let cancelled = collection
        .snapshot()
        .iter()
        .filter(|t| t.status() == TaskStatus::Cancelled)
        .count();
    assert_eq!(group.completed_tasks().unwrap() + cancelled, 4);
    assert_eq!(group.completed_tasks().unwrap(), 3);
    assert_eq!(group.remaining_tasks().unwrap(), 0);
}

#[tokio::test]
async fn group_progress_emission_is_deduplicated() {
    struct RepeatingProgressWork;

    #[async_trait]
    impl TaskWork for RepeatingProgressWork {
        async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
            for _ in 0..3 {
                ctx.set_progress(50).unwrap();
            }
            ctx.set_progress(100).unwrap();
            TaskOutcome::Succeeded
        }
    }

    let collection = TaskCollection::new();
    collection.push(Task::new("t", RepeatingProgressWork));
    let group = TaskGroup::new(1, collection).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    let events = drain_until_stopped(&mut rx).await;
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            GroupEvent::ProgressChanged(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![50, 100]);
}

#[tokio::test]
async fn execute_is_idempotent_while_running() {
    let collection = TaskCollection::new();
    collection.push(Task::new(
        "t",
        QuickWork {
            delay: Duration::from_millis(30),
        },
    ));
    let group = TaskGroup::new(1, collection).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();
    group.execute().unwrap();
    group.execute().unwrap();

    let events = drain_until_stopped(&mut rx).await;
    let started_events = events
        .iter()
        .filter(|e| matches!(e, GroupEvent::Started))
        .count();
    let stopped_events = events
        .iter()
        .filter(|e| matches!(e, GroupEvent::Stopped))
        .count();
    assert_eq!(started_events, 1);
    assert_eq!(stopped_events, 1);
}

#[tokio::test]
async fn a_group_can_be_executed_again_after_stopping() {
    let collection = TaskCollection::new();
    collection.push(Task::new("first", QuickWork::instant()));
    let group = TaskGroup::new(1, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();

    group.execute().unwrap();
    drain_until_stopped(&mut rx).await;
    assert_eq!(group.completed_tasks().unwrap(), 1);

    collection.push(Task::new("second", QuickWork::instant()));
    group.execute().unwrap();
    drain_until_stopped(&mut rx).await;
    assert_eq!(group.completed_tasks().unwrap(), 2);
    assert_eq!(group.remaining_tasks().unwrap(), 0);
}

#[tokio::test]
async fn wait_stopped_observes_the_end_of_a_run() {
    let collection = TaskCollection::new();
    collection.push(Task::new("t", QuickWork::instant()));
    let group = TaskGroup::new(1, collection).unwrap();

    group.execute().unwrap();
    timeout(Duration::from_secs(5), group.wait_stopped())
        .await
        .expect("run should stop");
    assert!(!group.is_executing());
    assert_eq!(group.remaining_tasks().unwrap(), 0);
}

#[tokio::test]
async fn dispose_is_idempotent_and_detaches_everything() {
    let collection = TaskCollection::new();
    let task = Task::new("t", QuickWork::instant());
    collection.push(task.clone());
    let group = TaskGroup::new(1, collection.clone()).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();
    drain_until_stopped(&mut rx).await;

    group.dispose();
    group.dispose();

    assert!(task.group_id().is_none());
    assert!(matches!(group.remaining_tasks(), Err(GroupError::Disposed)));
    assert!(matches!(group.execute(), Err(GroupError::Disposed)));

    // A fresh group can bind the collection again.
    let replacement = TaskGroup::new(1, collection).unwrap();
    drop(replacement);
}

#[tokio::test]
async fn dispose_mid_run_does_not_block_on_in_flight_work() {
    let collection = TaskCollection::new();
    let task = Task::new("t", UntilCancelled);
    collection.push(task.clone());
    let group = TaskGroup::new(1, collection).unwrap();
    let mut rx = group.take_events().unwrap();
    group.execute().unwrap();

    let mut events = Vec::new();
    while started_ids(&events).is_empty() {
        events.push(next_event(&mut rx).await);
    }

    group.dispose();
    assert!(matches!(group.remaining_tasks(), Err(GroupError::Disposed)));
    // The work keeps spinning; the test runtime aborts it on shutdown.
    assert_eq!(task.status(), TaskStatus::Running);
}
