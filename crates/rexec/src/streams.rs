//! Concurrent line reading and merging of command output streams
//!
//! A [`StreamMultiplexer`] runs one reader thread per output stream and one
//! merge thread. Readers push lines onto a shared channel; the merge thread
//! forwards them to a [`StreamHandler`] in arrival order and enforces the
//! total and output-idle deadlines. Exactly one terminal callback is issued,
//! after every line callback.

use crate::worker::Worker;
use crate::{Result, RexecError};
use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long the merge loop blocks on the channel before re-checking deadlines
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A readable output stream
pub type OutputStream = Box<dyn Read + Send>;

/// Which stream a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineSource {
    /// Standard output, or both streams when combined
    Stdout,
    /// Standard error
    Stderr,
}

/// How the multiplexer observation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every stream reached end of file
    Finished,
    /// A deadline elapsed first
    TimedOut,
}

/// Deadlines applied while reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// Maximum total duration
    pub timeout: Option<Duration>,
    /// Maximum duration without any output line
    pub output_timeout: Option<Duration>,
}

/// Receiver of multiplexed output
///
/// All methods run on the merge thread.
pub trait StreamHandler: Send + 'static {
    /// A line was read, without its line terminator
    fn on_line(&mut self, source: LineSource, line: &str);

    /// A deadline elapsed; no further callbacks follow
    fn on_timed_out(&mut self);

    /// Every stream was read to the end; no further callbacks follow
    fn on_finished(&mut self);
}

/// Reads up to two streams concurrently and merges their lines
pub struct StreamMultiplexer {
    config: MultiplexerConfig,
    worker: OnceLock<Worker>,
}

impl StreamMultiplexer {
    /// Create an idle multiplexer
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            config,
            worker: OnceLock::new(),
        }
    }

    /// Configured deadlines
    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Start reading
    ///
    /// An absent stream contributes no reader. A multiplexer can only be
    /// started once.
    pub fn start<H>(&self, stdout: Option<OutputStream>, stderr: Option<OutputStream>, handler: H) -> Result<()>
    where
        H: StreamHandler,
    {
        if self.worker.get().is_some() {
            return Err(RexecError::Session("stream multiplexer already started".to_string()));
        }

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stream) = stdout {
            readers.push(spawn_reader(stream, LineSource::Stdout, tx.clone())?);
        }
        if let Some(stream) = stderr {
            readers.push(spawn_reader(stream, LineSource::Stderr, tx.clone())?);
        }
        drop(tx);

        let config = self.config;
        let worker = Worker::spawn("rexec-merge", move || {
            let mut handler = handler;
            let outcome = merge(rx, readers, config, &mut handler);
            debug!("Stream multiplexer done: {:?}", outcome);
        })?;

        self.worker
            .set(worker)
            .map_err(|_| RexecError::Session("stream multiplexer already started".to_string()))
    }

    /// Whether the merge thread is still running, terminal callback included
    pub fn is_alive(&self) -> bool {
        self.worker.get().is_some_and(Worker::is_alive)
    }

    /// Block until the terminal callback has returned
    pub fn join(&self) {
        if let Some(worker) = self.worker.get() {
            worker.join();
        }
    }
}

fn spawn_reader(stream: OutputStream, source: LineSource, tx: Sender<(LineSource, String)>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("rexec-{:?}", source).to_lowercase())
        .spawn(move || read_lines(stream, source, tx))
        .map_err(|e| RexecError::Spawn(format!("Failed to start {:?} reader: {}", source, e)))
}

/// Push every line of `stream` onto the channel until end of file
fn read_lines(stream: OutputStream, source: LineSource, tx: Sender<(LineSource, String)>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((source, line)).is_err() {
                    // merge loop gave up after a timeout
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading {:?}: {}", source, e);
                break;
            }
        }
    }
}

fn strip_line_end(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Forward lines to `handler` until every reader is done or a deadline passes
///
/// Once every reader has exited, the lines still queued are delivered and
/// followed by `on_finished`, even when a deadline passed meanwhile.
pub(crate) fn merge<H: StreamHandler + ?Sized>(
    rx: Receiver<(LineSource, String)>,
    readers: Vec<JoinHandle<()>>,
    config: MultiplexerConfig,
    handler: &mut H,
) -> Outcome {
    let start = Instant::now();
    let deadline = config.timeout.map(|timeout| start + timeout);
    let mut output_deadline = config.output_timeout.map(|timeout| start + timeout);
    let mut timed_out = false;

    while readers.iter().any(|reader| !reader.is_finished()) {
        let received = rx.recv_timeout(POLL_INTERVAL);
        let now = Instant::now();
        match received {
            Ok((source, line)) => {
                if let Some(output_timeout) = config.output_timeout {
                    output_deadline = Some(now + output_timeout);
                }
                handler.on_line(source, strip_line_end(&line));
            }
            Err(RecvTimeoutError::Timeout) => {
                if output_deadline.is_some_and(|d| now > d) {
                    timed_out = true;
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if deadline.is_some_and(|d| now > d) {
            timed_out = true;
            break;
        }
    }

    if timed_out {
        handler.on_timed_out();
        return Outcome::TimedOut;
    }

    // lines pushed between the last poll and the readers exiting
    while let Ok((source, line)) = rx.try_recv() {
        handler.on_line(source, strip_line_end(&line));
    }
    for reader in readers {
        if reader.join().is_err() {
            warn!("Stream reader thread panicked");
        }
    }
    handler.on_finished();
    Outcome::Finished
}
