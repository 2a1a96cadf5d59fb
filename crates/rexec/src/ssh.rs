//! Session running commands and file operations over SSH

use crate::command::{CommandOptions, CommandStreams, CommandTask, CommandTransport};
use crate::fs::{FileSystem, OpenMode, SessionFile};
use crate::session::{Session, SessionOptions, TaskTracker};
use crate::streams::OutputStream;
use crate::{Result, RexecError};
use rexec_ssh::{Connection, ConnectionInfo, RemoteCommand, SshConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

struct SshInner {
    connection: Connection,
    tracker: TaskTracker,
    options: SessionOptions,
}

/// Remote execution context over an SSH connection
///
/// Commands run on their own channel of the connection and files are accessed
/// over SFTP. Clones share the connection and its tasks.
///
/// Concurrent commands and file operations take turns on the libssh2
/// session; no single call holds it longer than the session timeout.
#[derive(Clone)]
pub struct SshSession {
    inner: Arc<SshInner>,
}

impl SshSession {
    /// Connect with default session options
    pub fn connect(config: &SshConfig) -> Result<Self> {
        Self::connect_with_options(config, SessionOptions::default())
    }

    /// Connect with the given session options
    pub fn connect_with_options(config: &SshConfig, options: SessionOptions) -> Result<Self> {
        let connection = Connection::open(config)?;
        let label = format!("<SshSession {}>", connection.info());
        info!("Opened {}", label);
        Ok(Self {
            inner: Arc::new(SshInner {
                connection,
                tracker: TaskTracker::new(label),
                options,
            }),
        })
    }

    /// Identity of the remote end
    pub fn info(&self) -> &ConnectionInfo {
        self.inner.connection.info()
    }

    /// Options of this session
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    fn connection(&self) -> &Connection {
        &self.inner.connection
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("info", self.info())
            .field("tasks", &self.inner.tracker.len())
            .finish()
    }
}

/// A command running on a channel of the connection
struct RemoteChannel {
    command: Arc<RemoteCommand>,
}

impl CommandTransport for RemoteChannel {
    fn exit_status(&self) -> Result<i32> {
        Ok(self.command.exit_status()?)
    }

    fn terminate(&self) -> Result<()> {
        // a reader may hold the session lock until its read times out
        let command = self.command.clone();
        thread::Builder::new()
            .name("rexec-ssh-close".to_string())
            .spawn(move || {
                if let Err(e) = command.close() {
                    warn!("Failed to close timed out channel: {}", e);
                }
            })
            .map_err(|e| RexecError::Spawn(format!("Failed to start channel close: {}", e)))?;
        Ok(())
    }
}

impl FileSystem for SshSession {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn SessionFile>> {
        let file = match mode {
            OpenMode::Read => self.connection().open_read(path)?,
            OpenMode::Write => self.connection().open_write(path, false)?,
            OpenMode::Append => self.connection().open_write(path, true)?,
        };
        Ok(Box::new(file))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let names = self.connection().list_dir(path)?;
        Ok(names.into_iter().map(|name| path.join(name)).collect())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.connection().exists(path))
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(self.connection().is_dir(path))
    }

    fn is_link(&self, path: &Path) -> Result<bool> {
        Ok(self.connection().is_link(path))
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        Ok(self.connection().mkdir(path)?)
    }
}

impl Session for SshSession {
    fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    fn execute(&self, command: &str, options: CommandOptions) -> Result<Arc<CommandTask>> {
        CommandTask::launch(&self.inner.tracker, command, options, |combine_stderr| {
            let mut remote = self.connection().exec(command, combine_stderr)?;
            let streams = CommandStreams {
                stdout: remote.take_stdout().map(|s| Box::new(s) as OutputStream),
                stderr: remote.take_stderr().map(|s| Box::new(s) as OutputStream),
            };
            let transport: Box<dyn CommandTransport> = Box::new(RemoteChannel {
                command: Arc::new(remote),
            });
            Ok((transport, streams))
        })
    }

    fn close(&self) -> Result<()> {
        self.connection().disconnect()?;
        info!("Closed {}", self.name());
        Ok(())
    }

    fn auto_close(&self) -> bool {
        self.inner.options.auto_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failure_is_connection_error() {
        let config = SshConfig::from_target("nobody@127.0.0.1:1").with_connect_timeout(2);
        let result = SshSession::connect(&config);
        assert!(matches!(result, Err(RexecError::Connection(_))));
    }

    #[test]
    fn test_invalid_config() {
        let config = SshConfig {
            host: String::new(),
            ..SshConfig::default()
        };
        assert!(matches!(SshSession::connect(&config), Err(RexecError::Transport(_))));
    }
}
