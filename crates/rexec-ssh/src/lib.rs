//! # rexec SSH Transport
//!
//! SSH transport layer for rexec: connection settings, authenticated
//! connections, remote command channels and SFTP access.

#![warn(missing_docs)]

/// Connection configuration
pub mod transport;

/// SSH connection management
#[cfg(feature = "ssh2")]
pub mod connection;

/// SSH-specific error types
pub mod error;

/// Retrying of calls interrupted by the session timeout
pub mod retry;

pub use transport::{SshConfig, ConnectionInfo};
#[cfg(feature = "ssh2")]
pub use connection::{Connection, RemoteCommand, RemoteFile, RemoteStream};
pub use error::TransportError;
pub use retry::RetryOnTimeout;
