//! Error types for the rexec library

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for rexec operations
#[derive(Debug, Error)]
pub enum RexecError {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command or worker thread could not be started
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Copy destination already exists
    #[error("Destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    /// Session errors
    #[error("Session error: {0}")]
    Session(String),

    /// A single task failed
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Several tasks failed
    #[error(transparent)]
    Tasks(#[from] TaskErrors),
}

impl From<rexec_ssh::TransportError> for RexecError {
    fn from(err: rexec_ssh::TransportError) -> Self {
        match err {
            rexec_ssh::TransportError::Connection(msg) => Self::Connection(msg),
            rexec_ssh::TransportError::Authentication(msg) => Self::Auth(msg),
            rexec_ssh::TransportError::Io(e) => Self::Io(e),
            rexec_ssh::TransportError::Configuration(msg) => Self::Transport(msg),
            rexec_ssh::TransportError::Channel(msg) => Self::Transport(msg),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Where a task error comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    /// Label of the owning session
    pub session: String,
    /// Label of the task
    pub task: String,
    /// Identity of the task
    pub task_id: Uuid,
}

impl fmt::Display for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.session, self.task)
    }
}

/// Terminal error of a task
///
/// Returned by [`Task::error`](crate::Task::error) and raised by waits.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The command's total or output deadline elapsed
    #[error("{context} (timeout)")]
    Timeout {
        /// Originating session and task
        context: TaskContext,
    },

    /// The command finished with an unexpected exit code
    #[error("{context} (bad exit code: got {code}, expected {expected})")]
    ExitCode {
        /// Originating session and task
        context: TaskContext,
        /// Observed exit code
        code: i32,
        /// Expected exit code
        expected: i32,
    },

    /// A background callable returned an error or panicked
    #[error("{context} ({cause})")]
    Failed {
        /// Originating session and task
        context: TaskContext,
        /// What the callable reported
        cause: Arc<anyhow::Error>,
    },
}

impl TaskError {
    /// Session and task this error belongs to
    pub fn context(&self) -> &TaskContext {
        match self {
            Self::Timeout { context } => context,
            Self::ExitCode { context, .. } => context,
            Self::Failed { context, .. } => context,
        }
    }

    /// Identity of the failed task
    pub fn task_id(&self) -> Uuid {
        self.context().task_id
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is an exit code mismatch
    pub fn is_exit_code(&self) -> bool {
        matches!(self, Self::ExitCode { .. })
    }
}

/// Errors of several tasks, in the order they were collected
#[derive(Debug, Clone, Default)]
pub struct TaskErrors {
    /// The individual errors
    pub errors: Vec<TaskError>,
}

impl TaskErrors {
    /// Wrap a list of errors
    pub fn new(errors: Vec<TaskError>) -> Self {
        Self { errors }
    }

    /// Number of errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether there are no errors
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for TaskErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskErrors {}

impl From<Vec<TaskError>> for TaskErrors {
    fn from(errors: Vec<TaskError>) -> Self {
        Self::new(errors)
    }
}
