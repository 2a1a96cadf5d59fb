//! Joinable background threads

use crate::{Result, RexecError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::warn;

/// Completion flag shared between a worker thread and its waiters
#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn set(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Marks completion when the thread body returns or unwinds
struct CompletionGuard(Arc<Completion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// A detached thread that any number of callers can wait on
///
/// The thread never keeps the process alive: it is only joined when a caller
/// asks for it.
pub(crate) struct Worker {
    name: String,
    thread_id: ThreadId,
    completion: Arc<Completion>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start `body` on a new named thread
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let completion = Arc::new(Completion::default());
        let guard = CompletionGuard(completion.clone());

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                body();
            })
            .map_err(|e| RexecError::Spawn(format!("Failed to start thread {}: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            thread_id: handle.thread().id(),
            completion,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the thread body is still running
    pub(crate) fn is_alive(&self) -> bool {
        !self.completion.is_set()
    }

    /// Block until the thread body has returned
    ///
    /// Returns immediately when called from the worker thread itself, so
    /// callbacks running on the worker may wait on their own task.
    pub(crate) fn join(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        self.completion.wait();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Worker thread {} panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_join_waits_for_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let worker = Worker::spawn("test-worker", move || {
            thread::sleep(Duration::from_millis(50));
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        worker.join();
        assert!(!worker.is_alive());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // joining again is a no-op
        worker.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_joins() {
        let worker = Arc::new(
            Worker::spawn("test-worker", || thread::sleep(Duration::from_millis(50))).unwrap(),
        );

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let worker = worker.clone();
                thread::spawn(move || worker.join())
            })
            .collect();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert!(!worker.is_alive());
    }

    #[test]
    fn test_panicking_body_completes() {
        let worker = Worker::spawn("test-worker", || panic!("boom")).unwrap();
        worker.join();
        assert!(!worker.is_alive());
    }
}
