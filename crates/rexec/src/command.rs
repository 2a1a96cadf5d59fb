//! Commands running in the background with streamed output

use crate::background::panic_message;
use crate::session::TaskTracker;
use crate::streams::{LineSource, MultiplexerConfig, OutputStream, StreamHandler, StreamMultiplexer};
use crate::task::{Task, TaskCore};
use crate::{Result, RexecError, TaskError};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback receiving one output line
pub type LineCallback = Box<dyn FnMut(&CommandTask, &str) + Send>;

/// Callback receiving the task when it reaches a terminal state
pub type CommandCallback = Box<dyn FnOnce(&CommandTask) + Send>;

/// Process or channel running a command, as seen by a [`CommandTask`]
pub trait CommandTransport: Send + Sync + 'static {
    /// Exit status of the command
    ///
    /// Only called once every output stream reached end of file.
    fn exit_status(&self) -> Result<i32>;

    /// Stop the command, after a timeout the caller asked to kill on or when
    /// its output cannot be observed
    fn terminate(&self) -> Result<()> {
        Ok(())
    }
}

/// Output streams of a started command
///
/// `stderr` is absent when it was combined into `stdout`.
#[derive(Default)]
pub struct CommandStreams {
    /// Standard output
    pub stdout: Option<OutputStream>,
    /// Standard error
    pub stderr: Option<OutputStream>,
}

/// Configuration of a command execution
pub struct CommandOptions {
    /// Expected exit code; `None` disables the check
    pub expected_exit_code: Option<i32>,
    /// Combine stderr into stdout; `None` combines unless `on_stderr` is set
    pub combine_stderr: Option<bool>,
    /// Maximum total duration
    pub timeout: Option<Duration>,
    /// Maximum duration without output
    pub output_timeout: Option<Duration>,
    /// Ask the transport to stop the command when a deadline elapses
    pub kill_on_timeout: bool,
    on_stdout: Option<LineCallback>,
    on_stderr: Option<LineCallback>,
    on_finished: Option<CommandCallback>,
    on_timed_out: Option<CommandCallback>,
    on_done: Option<CommandCallback>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            expected_exit_code: Some(0),
            combine_stderr: None,
            timeout: None,
            output_timeout: None,
            kill_on_timeout: false,
            on_stdout: None,
            on_stderr: None,
            on_finished: None,
            on_timed_out: None,
            on_done: None,
        }
    }
}

impl fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOptions")
            .field("expected_exit_code", &self.expected_exit_code)
            .field("combine_stderr", &self.combine_stderr)
            .field("timeout", &self.timeout)
            .field("output_timeout", &self.output_timeout)
            .field("kill_on_timeout", &self.kill_on_timeout)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .field("on_finished", &self.on_finished.is_some())
            .field("on_timed_out", &self.on_timed_out.is_some())
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

impl CommandOptions {
    /// Default options: exit code 0 expected, no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the expected exit code; `None` disables the check
    pub fn with_expected_exit_code(mut self, code: Option<i32>) -> Self {
        self.expected_exit_code = code;
        self
    }

    /// Force combining (or separating) stderr and stdout
    pub fn with_combine_stderr(mut self, combine: bool) -> Self {
        self.combine_stderr = Some(combine);
        self
    }

    /// Set the maximum total duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the maximum duration without output
    pub fn with_output_timeout(mut self, timeout: Duration) -> Self {
        self.output_timeout = Some(timeout);
        self
    }

    /// Stop the command when a deadline elapses
    pub fn with_kill_on_timeout(mut self, kill: bool) -> Self {
        self.kill_on_timeout = kill;
        self
    }

    /// Called for each stdout line, and stderr lines when combined
    pub fn on_stdout<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&CommandTask, &str) + Send + 'static,
    {
        self.on_stdout = Some(Box::new(callback));
        self
    }

    /// Called for each stderr line
    pub fn on_stderr<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&CommandTask, &str) + Send + 'static,
    {
        self.on_stderr = Some(Box::new(callback));
        self
    }

    /// Called when the command finished, but not on timeout
    pub fn on_finished<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CommandTask) + Send + 'static,
    {
        self.on_finished = Some(Box::new(callback));
        self
    }

    /// Called when a deadline elapsed
    pub fn on_timed_out<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CommandTask) + Send + 'static,
    {
        self.on_timed_out = Some(Box::new(callback));
        self
    }

    /// Called last, on completion and on timeout
    ///
    /// A task with `on_done` handles its own errors: they are not reported by
    /// session-wide waits.
    pub fn on_done<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CommandTask) + Send + 'static,
    {
        self.on_done = Some(Box::new(callback));
        self
    }

    /// Whether stderr ends up in the stdout stream
    pub fn resolved_combine_stderr(&self) -> bool {
        self.combine_stderr.unwrap_or(self.on_stderr.is_none())
    }
}

#[derive(Debug, Default)]
struct CommandState {
    exit_code: Option<i32>,
    timed_out: bool,
}

/// A command started by a session
pub struct CommandTask {
    core: TaskCore,
    command: String,
    expected_exit_code: Option<i32>,
    combine_stderr: bool,
    kill_on_timeout: bool,
    state: Mutex<CommandState>,
    multiplexer: StreamMultiplexer,
    transport: Box<dyn CommandTransport>,
}

impl CommandTask {
    /// Start observing a command launched by a session
    ///
    /// `launch` receives the resolved stderr-combining flag and starts the
    /// command. The task is registered with `tracker` before any terminal
    /// callback runs.
    pub fn launch<F>(tracker: &TaskTracker, command: &str, options: CommandOptions, launch: F) -> Result<Arc<Self>>
    where
        F: FnOnce(bool) -> Result<(Box<dyn CommandTransport>, CommandStreams)>,
    {
        let combine_stderr = options.resolved_combine_stderr();
        let (transport, streams) = launch(combine_stderr)?;

        let CommandOptions {
            expected_exit_code,
            timeout,
            output_timeout,
            kill_on_timeout,
            on_stdout,
            on_stderr,
            on_finished,
            on_timed_out,
            on_done,
            ..
        } = options;

        let task = Arc::new(Self {
            core: TaskCore::new(tracker, format!("command `{}`", command), on_done.is_some()),
            command: command.to_string(),
            expected_exit_code,
            combine_stderr,
            kill_on_timeout,
            state: Mutex::new(CommandState::default()),
            multiplexer: StreamMultiplexer::new(MultiplexerConfig { timeout, output_timeout }),
            transport,
        });
        // terminal callbacks wait until the task is registered and joinable
        let (ready, gate) = mpsc::channel::<()>();
        let handler = CommandHandler {
            task: task.clone(),
            gate,
            on_stdout,
            on_stderr,
            on_finished,
            on_timed_out,
            on_done,
        };
        if let Err(e) = task.multiplexer.start(streams.stdout, streams.stderr, handler) {
            return Err(task.abort_start(e));
        }
        tracker.register(task.clone());
        let _ = ready.send(());

        debug!("Started {} in {}", task.label(), tracker.label());
        Ok(task)
    }

    /// Stop a command whose output could not be observed and pass `error` on
    fn abort_start(&self, error: RexecError) -> RexecError {
        warn!("Failed to observe {}: {}", self.label(), error);
        if let Err(e) = self.transport.terminate() {
            warn!("Failed to stop {}: {}", self.label(), e);
        }
        error
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CommandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The command line
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Expected exit code, if checked
    pub fn expected_exit_code(&self) -> Option<i32> {
        self.expected_exit_code
    }

    /// Whether stderr is read from the stdout stream
    pub fn combine_stderr(&self) -> bool {
        self.combine_stderr
    }

    /// Exit code, once finished without timeout
    pub fn exit_code(&self) -> Option<i32> {
        self.state().exit_code
    }

    /// Whether a deadline elapsed before the command finished
    pub fn timed_out(&self) -> bool {
        self.state().timed_out
    }

    /// Label of the owning session
    pub fn session_name(&self) -> &str {
        self.core.tracker().label()
    }

    #[cfg(test)]
    pub(crate) fn set_exit_code(&self, code: Option<i32>) {
        self.state().exit_code = code;
    }
}

impl Task for CommandTask {
    fn id(&self) -> Uuid {
        self.core.id()
    }

    fn label(&self) -> &str {
        self.core.label()
    }

    fn is_running(&self) -> bool {
        self.multiplexer.is_alive()
    }

    fn error(&self) -> Option<TaskError> {
        let state = self.state();
        if state.timed_out {
            return Some(TaskError::Timeout { context: self.core.context() });
        }
        match (state.exit_code, self.expected_exit_code) {
            (Some(code), Some(expected)) if code != expected => Some(TaskError::ExitCode {
                context: self.core.context(),
                code,
                expected,
            }),
            _ => None,
        }
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
        self.multiplexer.join();
    }
}

impl fmt::Debug for CommandTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTask")
            .field("id", &self.core.id())
            .field("command", &self.command)
            .field("state", &*self.state())
            .finish()
    }
}

/// Routes multiplexer events to a task and its callbacks
struct CommandHandler {
    task: Arc<CommandTask>,
    gate: mpsc::Receiver<()>,
    on_stdout: Option<LineCallback>,
    on_stderr: Option<LineCallback>,
    on_finished: Option<CommandCallback>,
    on_timed_out: Option<CommandCallback>,
    on_done: Option<CommandCallback>,
}

impl CommandHandler {
    fn done(&mut self) {
        let _ = self.gate.recv();
        self.task.core.unregister(self.task.as_ref());
    }
}

fn run_terminal(task: &CommandTask, kind: &str, callback: Option<CommandCallback>) {
    if let Some(callback) = callback {
        guarded(task, kind, || callback(task));
    }
}

/// Run a user callback; a panic is logged and does not reach the merge thread
fn guarded(task: &CommandTask, kind: &str, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        warn!("{} callback of {} panicked: {}", kind, task.label(), panic_message(payload.as_ref()));
    }
}

impl StreamHandler for CommandHandler {
    fn on_line(&mut self, source: LineSource, line: &str) {
        let (kind, callback) = match source {
            LineSource::Stdout => ("on_stdout", self.on_stdout.as_mut()),
            LineSource::Stderr => ("on_stderr", self.on_stderr.as_mut()),
        };
        if let Some(callback) = callback {
            guarded(&self.task, kind, || callback(&self.task, line));
        }
    }

    fn on_timed_out(&mut self) {
        debug!("{} timed out", self.task.label());
        self.task.state().timed_out = true;
        if self.task.kill_on_timeout {
            if let Err(e) = self.task.transport.terminate() {
                warn!("Failed to stop {}: {}", self.task.label(), e);
            }
        }
        self.done();
        run_terminal(&self.task, "on_timed_out", self.on_timed_out.take());
        run_terminal(&self.task, "on_done", self.on_done.take());
    }

    fn on_finished(&mut self) {
        match self.task.transport.exit_status() {
            Ok(code) => self.task.state().exit_code = Some(code),
            Err(e) => warn!("Exit status of {} unavailable: {}", self.task.label(), e),
        }
        self.done();
        run_terminal(&self.task, "on_finished", self.on_finished.take());
        run_terminal(&self.task, "on_done", self.on_done.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixedExit {
        code: i32,
        terminated: Arc<AtomicBool>,
    }

    impl CommandTransport for FixedExit {
        fn exit_status(&self) -> Result<i32> {
            Ok(self.code)
        }

        fn terminate(&self) -> Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Blocks forever, simulating a silent command
    struct Silent;

    impl std::io::Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_secs(3600));
            Ok(0)
        }
    }

    fn launch_with(
        tracker: &TaskTracker,
        options: CommandOptions,
        code: i32,
        stdout: Option<OutputStream>,
        stderr: Option<OutputStream>,
    ) -> (Arc<CommandTask>, Arc<AtomicBool>) {
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = terminated.clone();
        let task = CommandTask::launch(tracker, "cmd", options, move |_| {
            Ok((
                Box::new(FixedExit { code, terminated: flag }) as Box<dyn CommandTransport>,
                CommandStreams { stdout, stderr },
            ))
        })
        .unwrap();
        (task, terminated)
    }

    fn text(data: &str) -> Option<OutputStream> {
        Some(Box::new(Cursor::new(data.as_bytes().to_vec())))
    }

    #[test]
    fn test_combine_stderr_resolution() {
        assert!(CommandOptions::new().resolved_combine_stderr());
        assert!(!CommandOptions::new().on_stderr(|_, _| {}).resolved_combine_stderr());
        assert!(!CommandOptions::new().with_combine_stderr(false).resolved_combine_stderr());
        assert!(CommandOptions::new()
            .on_stderr(|_, _| {})
            .with_combine_stderr(true)
            .resolved_combine_stderr());
    }

    #[test]
    fn test_launch_receives_resolved_flag() {
        let tracker = TaskTracker::new("<TestSession>");
        let mut seen = None;
        let task = CommandTask::launch(&tracker, "cmd", CommandOptions::new().on_stderr(|_, _| {}), |combine| {
            seen = Some(combine);
            Ok((
                Box::new(FixedExit { code: 0, terminated: Arc::default() }) as Box<dyn CommandTransport>,
                CommandStreams::default(),
            ))
        })
        .unwrap();
        task.wait(true).unwrap();
        assert_eq!(seen, Some(false));
        assert!(!task.combine_stderr());
    }

    #[test]
    fn test_lines_and_finished() {
        let tracker = TaskTracker::new("<TestSession>");
        let out = Arc::new(Mutex::new(Vec::new()));
        let err = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicUsize::new(0));
        let (o, e, f) = (out.clone(), err.clone(), finished.clone());

        let options = CommandOptions::new()
            .on_stdout(move |_, line| o.lock().unwrap().push(line.to_string()))
            .on_stderr(move |_, line| e.lock().unwrap().push(line.to_string()))
            .on_finished(move |task| {
                assert!(task.exit_code().is_some());
                f.fetch_add(1, Ordering::SeqCst);
            });
        let (task, _) = launch_with(&tracker, options, 0, text("a\n"), text("b\n"));

        task.wait(true).unwrap();
        assert!(!task.is_running());
        assert!(!task.timed_out());
        assert_eq!(task.exit_code(), Some(0));
        assert!(task.error().is_none());
        assert_eq!(*out.lock().unwrap(), vec!["a"]);
        assert_eq!(*err.lock().unwrap(), vec!["b"]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_exit_code_error() {
        let tracker = TaskTracker::new("<TestSession>");
        let (task, _) = launch_with(&tracker, CommandOptions::new(), 1, None, None);

        let error = task.wait(true).unwrap_err();
        assert!(error.is_exit_code());
        assert_eq!(task.exit_code(), Some(1));
        // waiting again is harmless
        assert!(task.wait(false).is_ok());
    }

    #[test]
    fn test_exit_code_rules() {
        let tracker = TaskTracker::new("<TestSession>");
        let (task, _) = launch_with(&tracker, CommandOptions::new(), 0, None, None);
        task.wait(false).unwrap();

        task.set_exit_code(None);
        assert!(task.error().is_none());
        task.set_exit_code(Some(0));
        assert!(task.error().is_none());
        task.set_exit_code(Some(1));
        assert!(matches!(task.error(), Some(TaskError::ExitCode { code: 1, expected: 0, .. })));
    }

    #[test]
    fn test_no_expected_exit_code() {
        let tracker = TaskTracker::new("<TestSession>");
        let options = CommandOptions::new().with_expected_exit_code(None);
        let (task, _) = launch_with(&tracker, options, 3, None, None);

        task.wait(true).unwrap();
        assert_eq!(task.exit_code(), Some(3));
        assert!(task.error().is_none());
    }

    #[test]
    fn test_timeout() {
        let tracker = TaskTracker::new("<TestSession>");
        let timed_out = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (t, f) = (timed_out.clone(), finished.clone());
        let options = CommandOptions::new()
            .with_output_timeout(Duration::from_millis(50))
            .with_kill_on_timeout(true)
            .on_timed_out(move |_| {
                t.fetch_add(1, Ordering::SeqCst);
            })
            .on_finished(move |_| f.store(true, Ordering::SeqCst));
        let (task, terminated) = launch_with(&tracker, options, 0, Some(Box::new(Silent)), None);

        let error = task.wait(true).unwrap_err();
        assert!(error.is_timeout());
        assert!(task.timed_out());
        assert_eq!(task.exit_code(), None);
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
        assert!(!finished.load(Ordering::SeqCst));
        assert!(terminated.load(Ordering::SeqCst));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_timeout_without_kill() {
        let tracker = TaskTracker::new("<TestSession>");
        let options = CommandOptions::new().with_timeout(Duration::from_millis(30));
        let (task, terminated) = launch_with(&tracker, options, 0, Some(Box::new(Silent)), None);

        task.wait(false).unwrap();
        assert!(task.timed_out());
        assert!(!terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn test_on_done_marks_error_handled() {
        let tracker = TaskTracker::new("<TestSession>");
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let options = CommandOptions::new().on_done(move |task| {
            assert!(task.error().is_some());
            d.store(true, Ordering::SeqCst);
        });
        let (task, _) = launch_with(&tracker, options, 2, None, None);

        assert!(task.error_handled());
        assert!(tracker.wait_for_tasks(true).unwrap().is_empty());
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_line_callback() {
        let tracker = TaskTracker::new("<TestSession>");
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let options = CommandOptions::new()
            .on_stdout(|_, line| panic!("cannot handle {}", line))
            .on_finished(|_| panic!("finished callback failed"))
            .on_done(move |_| d.store(true, Ordering::SeqCst));
        let (task, _) = launch_with(&tracker, options, 0, text("hi\nthere\n"), None);

        task.wait(true).unwrap();
        assert!(!task.is_running());
        assert_eq!(task.exit_code(), Some(0));
        assert!(done.load(Ordering::SeqCst));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_abort_start_terminates_command() {
        let tracker = TaskTracker::new("<TestSession>");
        let (task, terminated) = launch_with(&tracker, CommandOptions::new(), 0, None, None);
        task.wait(true).unwrap();
        assert!(!terminated.load(Ordering::SeqCst));

        let error = task.abort_start(crate::RexecError::Spawn("no threads left".to_string()));
        assert!(matches!(error, crate::RexecError::Spawn(msg) if msg == "no threads left"));
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn test_launch_failure_registers_nothing() {
        let tracker = TaskTracker::new("<TestSession>");
        let result = CommandTask::launch(&tracker, "cmd", CommandOptions::new(), |_| {
            Err(crate::RexecError::Spawn("no such shell".to_string()))
        });
        assert!(result.is_err());
        assert!(tracker.is_empty());
    }
}
