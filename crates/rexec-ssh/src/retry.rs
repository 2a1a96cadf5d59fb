//! Blocking I/O over a session with a short timeout
//!
//! libssh2 holds the session lock for the whole of a blocking call. With a
//! short session timeout every call returns regularly, so concurrent channels
//! and SFTP requests of the same session get their turn. A timed out call is
//! simply repeated: libssh2 keeps the state of the interrupted request.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// Session timeout, in milliseconds, of established connections
pub const SESSION_POLL_MS: u32 = 100;

/// Pause after a timeout so that a waiting thread can take the session lock
pub(crate) const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Reader or writer repeating calls that timed out
#[derive(Debug)]
pub struct RetryOnTimeout<T> {
    inner: T,
}

impl<T> RetryOnTimeout<T> {
    /// Wrap `inner`
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// The wrapped value
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwrap the value
    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Repeat `op` while it fails with [`io::ErrorKind::TimedOut`]
pub fn retry_io<R>(mut op: impl FnMut() -> io::Result<R>) -> io::Result<R> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => thread::sleep(RETRY_PAUSE),
            other => return other,
        }
    }
}

impl<T: Read> Read for RetryOnTimeout<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry_io(|| self.inner.read(buf))
    }
}

impl<T: Write> Write for RetryOnTimeout<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry_io(|| self.inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        retry_io(|| self.inner.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Times out a fixed number of times before each call succeeds
    struct Flaky {
        timeouts: usize,
        calls: usize,
        written: Vec<u8>,
    }

    impl Flaky {
        fn new(timeouts: usize) -> Self {
            Self { timeouts, calls: 0, written: Vec::new() }
        }

        fn step(&mut self) -> io::Result<()> {
            self.calls += 1;
            if self.timeouts > 0 {
                self.timeouts -= 1;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out waiting on socket"));
            }
            Ok(())
        }
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.step()?;
            buf[..4].copy_from_slice(b"data");
            Ok(4)
        }
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.step()?;
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_retries_timeouts() {
        let mut reader = RetryOnTimeout::new(Flaky::new(3));
        let mut buf = [0u8; 8];

        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"data");
        assert_eq!(reader.get_ref().calls, 4);
    }

    #[test]
    fn test_write_retries_timeouts() {
        let mut writer = RetryOnTimeout::new(Flaky::new(2));
        writer.write_all(b"payload").unwrap();
        writer.flush().unwrap();

        let inner = writer.into_inner();
        assert_eq!(inner.written, b"payload");
        assert_eq!(inner.calls, 3);
    }

    #[test]
    fn test_other_errors_are_returned() {
        let mut calls = 0;
        let result: io::Result<()> = retry_io(|| {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        });

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_end_of_file_is_returned() {
        let mut reader = RetryOnTimeout::new(io::empty());
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
