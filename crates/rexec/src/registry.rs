//! Named collections of sessions used as one unit

use crate::session::{finish_scope, Session};
use crate::{Result, TaskError, TaskErrors};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sessions by name, in insertion order
#[derive(Default, Clone)]
pub struct SessionRegistry {
    sessions: Vec<(String, Arc<dyn Session>)>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` under `name`
    ///
    /// A session already registered under `name` is replaced in place and
    /// returned.
    pub fn insert(&mut self, name: impl Into<String>, session: Arc<dyn Session>) -> Option<Arc<dyn Session>> {
        let name = name.into();
        debug!("Registering {} as {}", session.name(), name);
        match self.sessions.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, session)),
            None => {
                self.sessions.push((name, session));
                None
            }
        }
    }

    /// Add a session by value, see [`SessionRegistry::insert`]
    pub fn add<S: Session + 'static>(&mut self, name: impl Into<String>, session: S) -> Option<Arc<dyn Session>> {
        self.insert(name, Arc::new(session))
    }

    /// Session registered under `name`
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Session>> {
        self.sessions.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Remove the session registered under `name`
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Session>> {
        let index = self.sessions.iter().position(|(n, _)| n == name)?;
        Some(self.sessions.remove(index).1)
    }

    /// Whether a session is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names, in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(|(n, _)| n.as_str())
    }

    /// Registered sessions with their names, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Session>)> {
        self.sessions.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn collect_errors(&self) -> Vec<TaskError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        // tasks of one session may start tasks in another, or fail into
        // a session whose pass already ran
        loop {
            for (_, session) in &self.sessions {
                errors.extend(session.tracker().collect_unseen(&mut seen));
            }
            if self.sessions.iter().all(|(_, s)| s.tracker().is_settled(&seen)) {
                return errors;
            }
        }
    }

    /// Wait for every task of every session
    ///
    /// With `raise_if_error`, collected errors are returned as `Err`.
    pub fn wait_for_tasks(&self, raise_if_error: bool) -> std::result::Result<Vec<TaskError>, TaskErrors> {
        let errors = self.collect_errors();
        if raise_if_error && !errors.is_empty() {
            return Err(TaskErrors::new(errors));
        }
        Ok(errors)
    }

    /// Close every session
    ///
    /// Every session is closed even when one fails; the first failure is
    /// returned.
    pub fn close(&self) -> Result<()> {
        let mut first = None;
        for (name, session) in &self.sessions {
            if let Err(e) = session.close() {
                warn!("Failed to close session {}: {}", name, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn close_auto(&self) {
        for (name, session) in &self.sessions {
            if session.auto_close() {
                if let Err(e) = session.close() {
                    warn!("Failed to close session {}: {}", name, e);
                }
            }
        }
    }

    /// Run `body`, then wait for every task of every session
    ///
    /// Behaves like [`Session::scope`] applied to all sessions at once.
    pub fn scope<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Self) -> std::result::Result<T, E>,
        E: From<TaskErrors>,
    {
        let result = body(self);
        let errors = self.collect_errors();
        self.close_auto();
        finish_scope(result, errors)
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.sessions.iter().map(|(n, s)| (n, s.name())))
            .finish()
    }
}
