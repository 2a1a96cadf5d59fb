//! SSH connection management

use crate::retry::{RetryOnTimeout, RETRY_PAUSE, SESSION_POLL_MS};
use crate::{ConnectionInfo, SshConfig, TransportError};
use ssh2::{Channel, ErrorCode, ExtendedData, OpenFlags, OpenType, Session, Sftp};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Readable side of a remote command channel
pub type RemoteStream = RetryOnTimeout<ssh2::Stream>;

/// File opened over SFTP
pub type RemoteFile = RetryOnTimeout<ssh2::File>;

/// `LIBSSH2_ERROR_TIMEOUT`
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Permission bits used for files and directories created remotely
const DEFAULT_FILE_MODE: i32 = 0o644;
const DEFAULT_DIR_MODE: i32 = 0o755;

/// Authenticated SSH connection with an SFTP subsystem
pub struct Connection {
    /// libssh2 session
    session: Session,
    /// SFTP channel opened with the connection
    sftp: Mutex<Sftp>,
    /// Identity of the remote end
    info: ConnectionInfo,
}

impl Connection {
    /// Connect, handshake and authenticate using `config`
    pub fn open(config: &SshConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let info = config.connection_info();
        info!("Connecting to {}", info);

        let timeout = Duration::from_secs(config.connect_timeout);
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connection(format!("Failed to resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("No address found for {}", config.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TransportError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake()?;

        Self::authenticate(&session, config)?;

        // blocking calls hold the session lock until they return
        session.set_timeout(SESSION_POLL_MS);

        let sftp = retry(|| session.sftp())?;
        info!("Successfully connected to {}", info);

        Ok(Self {
            session,
            sftp: Mutex::new(sftp),
            info,
        })
    }

    fn authenticate(session: &Session, config: &SshConfig) -> Result<(), TransportError> {
        let username = config.username.as_str();

        if config.use_agent {
            match session.userauth_agent(username) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("Agent authentication failed for {}: {}", username, e),
            }
        }

        if let Some(key_path) = &config.key_path {
            match session.userauth_pubkey_file(username, None, key_path, config.key_passphrase.as_deref()) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("Key authentication failed for {}: {}", username, e),
            }
        }

        if let Some(password) = &config.password {
            match session.userauth_password(username, password) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("Password authentication failed for {}: {}", username, e),
            }
        }

        Err(TransportError::Authentication(format!(
            "no configured method accepted for {}@{}",
            config.username, config.host
        )))
    }

    /// Identity of the remote end
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Start `command` on a new channel
    ///
    /// With `combine_stderr`, stderr is merged into the stdout stream and no
    /// separate stderr stream is returned.
    pub fn exec(&self, command: &str, combine_stderr: bool) -> Result<RemoteCommand, TransportError> {
        let mut channel = retry(|| self.session.channel_session())?;
        if combine_stderr {
            retry(|| channel.handle_extended_data(ExtendedData::Merge))?;
        }
        retry(|| channel.exec(command))?;
        debug!("Started remote command on {}: {}", self.info, command);

        let stdout = RetryOnTimeout::new(channel.stream(0));
        let stderr = (!combine_stderr).then(|| RetryOnTimeout::new(channel.stderr()));

        Ok(RemoteCommand {
            channel: Mutex::new(channel),
            stdout: Some(stdout),
            stderr,
        })
    }

    fn sftp(&self) -> Result<MutexGuard<'_, Sftp>, TransportError> {
        self.sftp
            .lock()
            .map_err(|_| TransportError::Channel("SFTP lock poisoned".to_string()))
    }

    /// Open a remote file for reading
    pub fn open_read(&self, path: &Path) -> Result<RemoteFile, TransportError> {
        let sftp = self.sftp()?;
        Ok(RetryOnTimeout::new(retry(|| sftp.open(path))?))
    }

    /// Open a remote file for writing, truncating it unless `append` is set
    pub fn open_write(&self, path: &Path, append: bool) -> Result<RemoteFile, TransportError> {
        let flags = if append {
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND
        } else {
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
        };
        let sftp = self.sftp()?;
        let file = retry(|| sftp.open_mode(path, flags, DEFAULT_FILE_MODE, OpenType::File))?;
        Ok(RetryOnTimeout::new(file))
    }

    /// Names of the entries of a remote directory
    pub fn list_dir(&self, path: &Path) -> Result<Vec<String>, TransportError> {
        let sftp = self.sftp()?;
        let entries = retry(|| sftp.readdir(path))?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry, _)| entry.file_name().map(|name| name.to_string_lossy().into_owned()))
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    /// Whether `path` is a directory, following links
    pub fn is_dir(&self, path: &Path) -> bool {
        match self.sftp() {
            Ok(sftp) => retry(|| sftp.stat(path)).map(|stat| stat.is_dir()).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Whether `path` is a symbolic link
    pub fn is_link(&self, path: &Path) -> bool {
        match self.sftp() {
            Ok(sftp) => retry(|| sftp.lstat(path))
                .map(|stat| stat.file_type().is_symlink())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Whether anything exists at `path`, following links
    pub fn exists(&self, path: &Path) -> bool {
        match self.sftp() {
            Ok(sftp) => retry(|| sftp.stat(path)).is_ok(),
            Err(_) => false,
        }
    }

    /// Create a remote directory
    pub fn mkdir(&self, path: &Path) -> Result<(), TransportError> {
        let sftp = self.sftp()?;
        Ok(retry(|| sftp.mkdir(path, DEFAULT_DIR_MODE))?)
    }

    /// Disconnect the SSH session
    pub fn disconnect(&self) -> Result<(), TransportError> {
        info!("Disconnecting from {}", self.info);
        retry(|| self.session.disconnect(None, "closed by client", None))?;
        Ok(())
    }
}

/// Repeat a libssh2 call while it times out
fn retry<R>(mut op: impl FnMut() -> Result<R, ssh2::Error>) -> Result<R, ssh2::Error> {
    loop {
        match op() {
            Err(e) if matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) => thread::sleep(RETRY_PAUSE),
            other => return other,
        }
    }
}

/// A command running on a remote channel
pub struct RemoteCommand {
    /// Channel the command runs on
    channel: Mutex<Channel>,
    /// Standard output (and stderr when merged)
    stdout: Option<RemoteStream>,
    /// Standard error
    stderr: Option<RemoteStream>,
}

impl RemoteCommand {
    /// Take the stdout stream
    pub fn take_stdout(&mut self) -> Option<RemoteStream> {
        self.stdout.take()
    }

    /// Take the stderr stream, absent when merged into stdout
    pub fn take_stderr(&mut self) -> Option<RemoteStream> {
        self.stderr.take()
    }

    fn channel(&self) -> Result<MutexGuard<'_, Channel>, TransportError> {
        self.channel
            .lock()
            .map_err(|_| TransportError::Channel("channel lock poisoned".to_string()))
    }

    /// Wait for the channel to close and return the command's exit status
    ///
    /// Only valid once both output streams reached end of file.
    pub fn exit_status(&self) -> Result<i32, TransportError> {
        let mut channel = self.channel()?;
        retry(|| channel.wait_close())?;
        Ok(channel.exit_status()?)
    }

    /// Close the channel without waiting for the command
    pub fn close(&self) -> Result<(), TransportError> {
        let mut channel = self.channel()?;
        if let Err(e) = retry(|| channel.close()) {
            warn!("Failed to close channel: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = SshConfig { host: String::new(), ..Default::default() };
        let result = Connection::open(&config);
        assert!(matches!(result, Err(TransportError::Configuration(_))));
    }

    #[test]
    fn test_open_refused_connection() {
        // nothing listens on port 1 of the loopback interface
        let config = SshConfig::from_target("nobody@127.0.0.1:1").with_connect_timeout(2);
        let result = Connection::open(&config);
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
