//! Arbitrary work running on a session's behalf

use crate::session::TaskTracker;
use crate::task::{Task, TaskCore};
use crate::worker::Worker;
use crate::{Result, TaskError};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, OnceLock, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// Callback receiving a background task once it is done
pub type DoneCallback = Box<dyn FnOnce(&BackgroundTask) + Send>;

/// A callable running on its own thread
pub struct BackgroundTask {
    core: TaskCore,
    failure: Mutex<Option<TaskError>>,
    worker: OnceLock<Worker>,
}

impl BackgroundTask {
    /// Register a task with `tracker` and start running `work`
    ///
    /// A failure of `work`, including a panic, becomes the task's error.
    pub fn spawn<F>(tracker: &TaskTracker, name: &str, work: F, on_done: Option<DoneCallback>) -> Result<Arc<Self>>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let task = Arc::new(Self {
            core: TaskCore::new(tracker, format!("task `{}`", name), on_done.is_some()),
            failure: Mutex::new(None),
            worker: OnceLock::new(),
        });

        // the worker starts once the task is registered and joinable
        let (ready, gate) = mpsc::channel::<()>();
        let runner = task.clone();
        let worker = Worker::spawn(&format!("rexec-task-{}", name), move || {
            if gate.recv().is_err() {
                return;
            }
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(outcome) => outcome,
                Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))),
            };
            if let Err(cause) = outcome {
                debug!("{} failed: {:#}", runner.label(), cause);
                *runner.failure() = Some(TaskError::Failed {
                    context: runner.core.context(),
                    cause: Arc::new(cause),
                });
            }
            runner.core.unregister(runner.as_ref());
            if let Some(callback) = on_done {
                callback(&runner);
            }
        })?;

        let _ = task.worker.set(worker);
        tracker.register(task.clone());
        let _ = ready.send(());
        Ok(task)
    }

    fn failure(&self) -> std::sync::MutexGuard<'_, Option<TaskError>> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Label of the owning session
    pub fn session_name(&self) -> &str {
        self.core.tracker().label()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Task for BackgroundTask {
    fn id(&self) -> Uuid {
        self.core.id()
    }

    fn label(&self) -> &str {
        self.core.label()
    }

    fn is_running(&self) -> bool {
        self.worker.get().is_some_and(Worker::is_alive)
    }

    fn error(&self) -> Option<TaskError> {
        self.failure().clone()
    }

    fn explicitly_waited(&self) -> bool {
        self.core.explicitly_waited()
    }

    fn mark_waited(&self) {
        self.core.mark_waited();
    }

    fn error_handled(&self) -> bool {
        self.core.handles_errors()
    }

    fn join(&self) {
        if let Some(worker) = self.worker.get() {
            worker.join();
        }
    }
}

impl fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("id", &self.core.id())
            .field("label", &self.core.label())
            .field("running", &self.is_running())
            .finish()
    }
}
