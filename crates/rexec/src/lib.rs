//! # rexec
//!
//! Run shell commands locally or over SSH as tracked background tasks.
//!
//! Every command or callable started through a [`Session`] becomes a [`Task`]:
//! its output is streamed line by line to callbacks under optional total and
//! idle deadlines, and its errors are never lost. Errors of tasks nobody
//! waited for are kept by the session and reported by the next
//! [`Session::wait_for_tasks`] or when a [`Session::scope`] ends.
//!
//! ```no_run
//! use rexec::{CommandOptions, LocalSession, RexecError, Session};
//!
//! let session = LocalSession::new();
//! session.scope(|s| {
//!     s.execute("echo hello", CommandOptions::new().on_stdout(|_, line| println!("{}", line)))?;
//!     Ok::<_, RexecError>(())
//! })?;
//! # Ok::<_, RexecError>(())
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use rexec_ssh as transport;

/// Error types for the rexec library
pub mod error;

/// Line-oriented merging of command output streams
pub mod streams;

/// Task handles
pub mod task;

/// Command tasks and their configuration
pub mod command;

/// Background callables
pub mod background;

/// Sessions and task bookkeeping
pub mod session;

/// Named collections of sessions
pub mod registry;

/// Filesystem access and copies between sessions
pub mod fs;

/// Session on the local machine
pub mod local;

/// Session over SSH
#[cfg(feature = "ssh2")]
#[cfg_attr(docsrs, doc(cfg(feature = "ssh2")))]
pub mod ssh;

mod worker;

pub use background::BackgroundTask;
pub use command::{CommandOptions, CommandTask, CommandTransport};
pub use error::{RexecError, TaskContext, TaskError, TaskErrors};
pub use fs::{FileSystem, OpenMode, Walk, WalkEntry, WalkOptions};
pub use local::LocalSession;
pub use registry::SessionRegistry;
pub use session::{Session, SessionOptions, TaskTracker};
pub use streams::{MultiplexerConfig, StreamMultiplexer};
pub use task::Task;
pub use transport::SshConfig;

#[cfg(feature = "ssh2")]
pub use ssh::SshSession;

/// Result type alias for rexec operations
pub type Result<T> = std::result::Result<T, RexecError>;
