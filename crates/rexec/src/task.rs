//! Asynchronous task handles

use crate::error::TaskContext;
use crate::session::TaskTracker;
use crate::TaskError;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

/// A handle to work running in the background
///
/// Tasks start as soon as they are created and register with the session that
/// created them. They unregister themselves exactly once, from their worker
/// thread, when they finish or time out.
pub trait Task: Send + Sync {
    /// Identity of the task
    fn id(&self) -> Uuid;

    /// Human readable description, used in error messages
    fn label(&self) -> &str;

    /// Whether the task is still running
    fn is_running(&self) -> bool;

    /// Terminal error of the task, if any
    ///
    /// Never fails itself; it only reports.
    fn error(&self) -> Option<TaskError>;

    /// Whether a caller waited on this task directly
    fn explicitly_waited(&self) -> bool;

    /// Record that a caller is waiting on this task
    fn mark_waited(&self);

    /// Whether the task reports its own errors through an `on_done` callback
    ///
    /// Handled errors are neither kept as silent errors nor collected by
    /// session-wide waits.
    fn error_handled(&self) -> bool {
        false
    }

    /// Block until the task's worker threads are done
    fn join(&self);

    /// Return the task's error, if any, as `Err`
    fn raise_if_error(&self) -> Result<(), TaskError> {
        match self.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Block until the task is finished
    ///
    /// Marks the task as explicitly waited before blocking. Safe to call any
    /// number of times.
    fn wait(&self, raise_if_error: bool) -> Result<(), TaskError> {
        self.mark_waited();
        self.join();
        if raise_if_error {
            self.raise_if_error()?;
        }
        Ok(())
    }
}

/// State shared by every task implementation
pub(crate) struct TaskCore {
    id: Uuid,
    label: String,
    tracker: TaskTracker,
    explicit_wait: AtomicBool,
    handles_errors: bool,
}

impl TaskCore {
    pub(crate) fn new(tracker: &TaskTracker, label: String, handles_errors: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            label,
            tracker: tracker.clone(),
            explicit_wait: AtomicBool::new(false),
            handles_errors,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(crate) fn handles_errors(&self) -> bool {
        self.handles_errors
    }

    pub(crate) fn explicitly_waited(&self) -> bool {
        self.explicit_wait.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_waited(&self) {
        self.explicit_wait.store(true, Ordering::SeqCst);
    }

    /// Context attached to errors of this task
    pub(crate) fn context(&self) -> TaskContext {
        TaskContext {
            session: self.tracker.label().to_string(),
            task: self.label.clone(),
            task_id: self.id,
        }
    }

    /// Remove `task` from its session
    pub(crate) fn unregister(&self, task: &dyn Task) {
        debug!("Task {} done", self.label);
        self.tracker.unregister(task);
    }
}
