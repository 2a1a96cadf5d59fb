//! Session running commands and file operations on this machine

use crate::command::{CommandOptions, CommandStreams, CommandTask, CommandTransport};
use crate::fs::{FileSystem, OpenMode, SessionFile};
use crate::session::{Session, SessionOptions, TaskTracker};
use crate::streams::OutputStream;
use crate::{Result, RexecError};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

const LABEL: &str = "<LocalSession>";

/// Local execution context
///
/// Commands run through the platform shell. Clones share their tasks.
#[derive(Clone)]
pub struct LocalSession {
    tracker: TaskTracker,
    options: SessionOptions,
}

impl LocalSession {
    /// Create a session with default options
    pub fn new() -> Self {
        Self::with_options(SessionOptions::default())
    }

    /// Create a session with the given options
    pub fn with_options(options: SessionOptions) -> Self {
        debug!("Opening {}", LABEL);
        Self {
            tracker: TaskTracker::new(LABEL),
            options,
        }
    }

    /// Options of this session
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSession")
            .field("tasks", &self.tracker.len())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn spawn_shell(command: &str, combine_stderr: bool) -> Result<(Box<dyn CommandTransport>, CommandStreams)> {
    let spawn_error = |e: io::Error| RexecError::Spawn(format!("Failed to run `{}`: {}", command, e));

    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null());

    let (child, streams) = if combine_stderr {
        let (reader, writer) = io::pipe()?;
        cmd.stdout(writer.try_clone()?).stderr(writer);
        let child = cmd.spawn().map_err(spawn_error)?;
        let stdout: OutputStream = Box::new(reader);
        (
            child,
            CommandStreams {
                stdout: Some(stdout),
                stderr: None,
            },
        )
    } else {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let stdout = child.stdout.take().map(|s| Box::new(s) as OutputStream);
        let stderr = child.stderr.take().map(|s| Box::new(s) as OutputStream);
        (child, CommandStreams { stdout, stderr })
    };
    // the parent's copies of the pipe's write end must be closed for EOF
    drop(cmd);

    debug!("Spawned `{}` as pid {}", command, child.id());
    Ok((
        Box::new(LocalProcess {
            child: Mutex::new(child),
        }),
        streams,
    ))
}

/// A child process of the local session
struct LocalProcess {
    child: Mutex<Child>,
}

impl LocalProcess {
    fn child(&self) -> std::sync::MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exit code, or the negated signal number for killed processes
fn exit_code(status: ExitStatus) -> Result<i32> {
    if let Some(code) = status.code() {
        return Ok(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Ok(-signal);
        }
    }
    Err(RexecError::Session(format!("no exit code in {}", status)))
}

impl CommandTransport for LocalProcess {
    fn exit_status(&self) -> Result<i32> {
        let status = self.child().wait()?;
        exit_code(status)
    }

    fn terminate(&self) -> Result<()> {
        let mut child = self.child();
        debug!("Killing pid {}", child.id());
        child.kill()?;
        child.wait()?;
        Ok(())
    }
}

fn exists_or_false(result: io::Result<bool>) -> Result<bool> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl FileSystem for LocalSession {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn SessionFile>> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        Ok(Box::new(options.open(path)?))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()).map_err(RexecError::from))
            .collect()
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        exists_or_false(fs::metadata(path).map(|_| true))
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        exists_or_false(fs::metadata(path).map(|m| m.is_dir()))
    }

    fn is_link(&self, path: &Path) -> Result<bool> {
        exists_or_false(fs::symlink_metadata(path).map(|m| m.file_type().is_symlink()))
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path)?;
        Ok(())
    }
}

impl Session for LocalSession {
    fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    fn execute(&self, command: &str, options: CommandOptions) -> Result<Arc<CommandTask>> {
        CommandTask::launch(&self.tracker, command, options, |combine_stderr| {
            spawn_shell(command, combine_stderr)
        })
    }

    fn close(&self) -> Result<()> {
        info!("Closed {}", LABEL);
        Ok(())
    }

    fn auto_close(&self) -> bool {
        self.options.auto_close
    }
}
