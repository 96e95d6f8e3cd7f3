//! Observable, thread-safe task container consumed by a task group.
//!
//! The collection is owned by the caller; the group binds itself as the
//! single observer and reacts to add/remove notifications. Notifications are
//! delivered synchronously after the container mutation, outside the
//! container lock.

use std::sync::{Arc, Mutex, Weak};

use crate::error::GroupError;
use crate::task::{Task, TaskStatus};

/// Group-side sink for collection mutations.
pub(crate) trait CollectionObserver: Send + Sync {
    fn tasks_added(&self, tasks: &[Task]);
    fn tasks_removed(&self, tasks: &[Task]);
}

#[derive(Default)]
struct CollectionInner {
    tasks: Mutex<Vec<Task>>,
    observer: Mutex<Option<Weak<dyn CollectionObserver>>>,
}

/// Insertion-ordered task container. Clones share state.
#[derive(Clone)]
pub struct TaskCollection {
    inner: Arc<CollectionInner>,
}

impl TaskCollection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CollectionInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Task> {
        self.inner.tasks.lock().unwrap().get(index).cloned()
    }

    /// Copy of the current contents, in insertion order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.inner.tasks.lock().unwrap().clone()
    }

    pub fn push(&self, task: Task) {
        self.push_all(vec![task]);
    }

    /// Append a batch; observers see one notification for the whole batch.
    pub fn push_all(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        {
            let mut guard = self.inner.tasks.lock().unwrap();
            guard.extend(tasks.iter().cloned());
        }
        if let Some(observer) = self.observer() {
            observer.tasks_added(&tasks);
        }
    }

    /// Remove a task by identity. Returns whether it was present.
    pub fn remove(&self, task: &Task) -> bool {
        let removed = {
            let mut guard = self.inner.tasks.lock().unwrap();
            let before = guard.len();
            guard.retain(|t| t.id() != task.id());
            before != guard.len()
        };
        if removed {
            if let Some(observer) = self.observer() {
                observer.tasks_removed(std::slice::from_ref(task));
            }
        }
        removed
    }

    /// Earliest-added task still in `Ready` status, if any. FIFO is the only
    /// scheduling priority.
    pub(crate) fn first_ready(&self) -> Option<Task> {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.status() == TaskStatus::Ready)
            .cloned()
    }

    /// Install the single observer. Fails while a live observer is bound.
    pub(crate) fn bind_observer(&self, observer: Weak<dyn CollectionObserver>) -> Result<(), GroupError> {
        let mut slot = self.inner.observer.lock().unwrap();
        if slot.as_ref().is_some_and(|w| w.strong_count() > 0) {
            return Err(GroupError::CollectionAlreadyBound);
        }
        *slot = Some(observer);
        Ok(())
    }

    pub(crate) fn unbind_observer(&self) {
        *self.inner.observer.lock().unwrap() = None;
    }

    fn observer(&self) -> Option<Arc<dyn CollectionObserver>> {
        self.inner.observer.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

impl Default for TaskCollection {
    fn default() -> Self {
        Self::new()
    }
}
