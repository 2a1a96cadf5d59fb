//! Sessions and the bookkeeping of their live tasks

use crate::background::BackgroundTask;
use crate::command::{CommandOptions, CommandTask};
use crate::fs::{self, FileSystem, DEFAULT_CHUNK_SIZE};
use crate::{Result, Task, TaskError, TaskErrors};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Close the session when a scope around it ends
    pub auto_close: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { auto_close: true }
    }
}

#[derive(Default)]
struct TrackerState {
    /// Live tasks
    tasks: HashMap<Uuid, Arc<dyn Task>>,
    /// Errors of tasks that finished without being waited on
    silent_errors: Vec<TaskError>,
}

struct TrackerInner {
    label: String,
    state: Mutex<TrackerState>,
}

/// Live tasks and silent errors of one session
///
/// Cloning yields another handle to the same bookkeeping.
#[derive(Clone)]
pub struct TaskTracker {
    inner: Arc<TrackerInner>,
}

impl TaskTracker {
    /// Create an empty tracker; `label` names the session in error messages
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                label: label.into(),
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    /// Label of the owning session
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a task to the live set
    pub fn register(&self, task: Arc<dyn Task>) {
        debug!("Registering {} in {}", task.label(), self.label());
        self.state().tasks.insert(task.id(), task);
    }

    /// Remove a task from the live set
    ///
    /// Removing an absent task is a no-op. When the removed task carries an
    /// error nobody waited for, the error is kept as a silent error.
    pub fn unregister(&self, task: &dyn Task) {
        let mut state = self.state();
        if state.tasks.remove(&task.id()).is_none() {
            return;
        }
        if !task.error_handled() && !task.explicitly_waited() {
            if let Some(error) = task.error() {
                debug!("Keeping silent error of {}: {}", task.label(), error);
                state.silent_errors.push(error);
            }
        }
    }

    /// Snapshot of the live tasks
    pub fn tasks(&self) -> Vec<Arc<dyn Task>> {
        self.state().tasks.values().cloned().collect()
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.state().tasks.len()
    }

    /// Whether no task is live
    pub fn is_empty(&self) -> bool {
        self.state().tasks.is_empty()
    }

    /// Wait for every live task, including tasks started while waiting
    ///
    /// Returns the errors of waited tasks together with the silent errors of
    /// tasks that finished unobserved, in the order they were collected.
    pub fn collect_errors(&self) -> Vec<TaskError> {
        self.collect_unseen(&mut HashSet::new())
    }

    /// [`TaskTracker::collect_errors`], skipping tasks already in `seen`
    ///
    /// Every task waited here is added to `seen`, so a task that never
    /// unregisters is waited at most once.
    pub(crate) fn collect_unseen(&self, seen: &mut HashSet<Uuid>) -> Vec<TaskError> {
        let mut errors = Vec::new();

        loop {
            let (silent, pending) = {
                let mut state = self.state();
                let silent = std::mem::take(&mut state.silent_errors);
                let pending: Vec<_> = state
                    .tasks
                    .values()
                    .filter(|task| !seen.contains(&task.id()))
                    .cloned()
                    .collect();
                (silent, pending)
            };

            // errors of tasks waited below are collected from the task itself
            errors.extend(silent.into_iter().filter(|e| !seen.contains(&e.task_id())));

            if pending.is_empty() {
                break;
            }

            for task in pending {
                let _ = task.wait(false);
                if !task.error_handled() {
                    if let Some(error) = task.error() {
                        errors.push(error);
                    }
                }
                seen.insert(task.id());
            }
        }

        errors
    }

    /// Whether no silent error is pending and every live task is in `seen`
    pub(crate) fn is_settled(&self, seen: &HashSet<Uuid>) -> bool {
        let state = self.state();
        state.silent_errors.is_empty() && state.tasks.keys().all(|id| seen.contains(id))
    }

    /// Wait for every live task and report their errors
    ///
    /// With `raise_if_error`, collected errors are returned as `Err`.
    pub fn wait_for_tasks(&self, raise_if_error: bool) -> std::result::Result<Vec<TaskError>, TaskErrors> {
        let errors = self.collect_errors();
        if raise_if_error && !errors.is_empty() {
            return Err(TaskErrors::new(errors));
        }
        Ok(errors)
    }
}

/// An execution context, local or remote, owning the tasks it starts
pub trait Session: FileSystem + Send + Sync {
    /// Bookkeeping of this session's tasks
    fn tracker(&self) -> &TaskTracker;

    /// Start `command` in the background
    fn execute(&self, command: &str, options: CommandOptions) -> Result<Arc<CommandTask>>;

    /// Release the session's resources
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Whether scopes close this session when they end
    fn auto_close(&self) -> bool {
        true
    }

    /// Label used in error messages
    fn name(&self) -> &str {
        self.tracker().label()
    }

    /// Snapshot of the live tasks
    fn tasks(&self) -> Vec<Arc<dyn Task>> {
        self.tracker().tasks()
    }

    /// Wait for every live task, see [`TaskTracker::wait_for_tasks`]
    fn wait_for_tasks(&self, raise_if_error: bool) -> std::result::Result<Vec<TaskError>, TaskErrors> {
        self.tracker().wait_for_tasks(raise_if_error)
    }

    /// Run `work` as a background task of this session
    fn spawn<F>(&self, name: &str, work: F) -> Result<Arc<BackgroundTask>>
    where
        Self: Sized,
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        BackgroundTask::spawn(self.tracker(), name, work, None)
    }

    /// Run `work` as a background task of this session, then `on_done`
    ///
    /// `on_done` receives the finished task and takes over its error: the
    /// error is neither kept as a silent error nor collected by waits.
    fn spawn_with_done<F, D>(&self, name: &str, work: F, on_done: D) -> Result<Arc<BackgroundTask>>
    where
        Self: Sized,
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
        D: FnOnce(&BackgroundTask) + Send + 'static,
    {
        BackgroundTask::spawn(self.tracker(), name, work, Some(Box::new(on_done)))
    }

    /// Copy a file of this session to `dest` in another session
    fn copy_file_to(&self, src: &Path, dest_fs: &dyn FileSystem, dest: &Path) -> Result<u64>
    where
        Self: Sized,
    {
        fs::copy_file(self, src, dest_fs, dest, DEFAULT_CHUNK_SIZE)
    }

    /// Recursively copy a directory of this session to `dest` in another
    /// session; `dest` must not exist
    fn copy_dir_to(&self, src: &Path, dest_fs: &dyn FileSystem, dest: &Path) -> Result<()>
    where
        Self: Sized,
    {
        fs::copy_dir(self, src, dest_fs, dest, DEFAULT_CHUNK_SIZE)
    }

    /// Background version of [`Session::copy_file_to`]
    fn spawn_copy_file<D>(&self, src: PathBuf, dest_fs: D, dest: PathBuf) -> Result<Arc<BackgroundTask>>
    where
        Self: Clone + Sized + 'static,
        D: FileSystem + Send + 'static,
    {
        let source = self.clone();
        self.spawn("copy_file", move || {
            fs::copy_file(&source, &src, &dest_fs, &dest, DEFAULT_CHUNK_SIZE)?;
            Ok(())
        })
    }

    /// Background version of [`Session::copy_dir_to`]
    fn spawn_copy_dir<D>(&self, src: PathBuf, dest_fs: D, dest: PathBuf) -> Result<Arc<BackgroundTask>>
    where
        Self: Clone + Sized + 'static,
        D: FileSystem + Send + 'static,
    {
        let source = self.clone();
        self.spawn("copy_dir", move || {
            fs::copy_dir(&source, &src, &dest_fs, &dest, DEFAULT_CHUNK_SIZE)?;
            Ok(())
        })
    }

    /// Run `body`, then wait for every task of the session
    ///
    /// When the body succeeds, collected task errors are returned as `Err`.
    /// When the body fails, task errors are logged and the body's error is
    /// returned unchanged. The session is closed afterwards if it is
    /// configured to auto-close.
    fn scope<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        Self: Sized,
        F: FnOnce(&Self) -> std::result::Result<T, E>,
        E: From<TaskErrors>,
    {
        let result = body(self);
        let errors = self.tracker().collect_errors();
        if self.auto_close() {
            if let Err(e) = self.close() {
                warn!("Failed to close {}: {}", self.name(), e);
            }
        }
        finish_scope(result, errors)
    }
}

/// Combine a scope body's result with the task errors collected after it
pub(crate) fn finish_scope<T, E>(result: std::result::Result<T, E>, errors: Vec<TaskError>) -> std::result::Result<T, E>
where
    E: From<TaskErrors>,
{
    match result {
        Ok(value) if errors.is_empty() => Ok(value),
        Ok(_) => Err(TaskErrors::new(errors).into()),
        Err(e) => {
            // the body's own error wins; task errors are only reported
            for task_error in &errors {
                error!("ERROR: {}", task_error);
            }
            Err(e)
        }
    }
}
