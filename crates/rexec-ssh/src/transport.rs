//! Connection configuration and identity

use crate::TransportError;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// SSH configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// Password, tried when set
    pub password: Option<String>,
    /// Private key path
    pub key_path: Option<PathBuf>,
    /// Passphrase for the private key
    pub key_passphrase: Option<String>,
    /// Try keys held by a running ssh-agent
    pub use_agent: bool,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            password: None,
            key_path: None,
            key_passphrase: None,
            use_agent: true,
            connect_timeout: 30,
        }
    }
}

impl SshConfig {
    /// Build a configuration from a `[user@]host[:port]` target string
    pub fn from_target(target: &str) -> Self {
        let (username, host, port) = parse_target(target);
        Self {
            host,
            port,
            username,
            ..Default::default()
        }
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the private key path
    pub fn with_key(mut self, key_path: PathBuf) -> Self {
        self.key_path = Some(key_path);
        self
    }

    /// Set the connection timeout in seconds
    pub fn with_connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout = seconds;
        self
    }

    /// Check that the configuration can be used to connect
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.trim().is_empty() {
            return Err(TransportError::Configuration("host must not be empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(TransportError::Configuration("username must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(TransportError::Configuration("port must not be 0".to_string()));
        }
        if self.password.is_none() && self.key_path.is_none() && !self.use_agent {
            return Err(TransportError::Configuration(
                "no authentication method configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Identity of the connection described by this configuration
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
        }
    }
}

/// Parse `[user@]host[:port]` into its components
fn parse_target(target: &str) -> (String, String, u16) {
    let mut username = "root".to_string();
    let mut host = target.to_string();
    let mut port = 22;

    if let Some(at_pos) = target.find('@') {
        username = target[..at_pos].to_string();
        host = target[at_pos + 1..].to_string();
    }

    if let Some(colon_pos) = host.rfind(':') {
        if let Ok(parsed_port) = host[colon_pos + 1..].parse::<u16>() {
            port = parsed_port;
            host = host[..colon_pos].to_string();
        }
    }

    (username, host, port)
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.host)?;
        if self.port != 22 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}
