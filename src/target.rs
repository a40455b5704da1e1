use std::{fmt, path::PathBuf};

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    None,
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::Password(_) => f.write_str("Password(..)"),
            Authentication::PrivateKey { path, .. } => {
                f.debug_struct("PrivateKey").field("path", path).finish()
            }
            Authentication::None => f.write_str("None"),
        }
    }
}

/// Where and as whom to connect. Port and username are optional and resolved
/// against the defaults when a session is negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub authentication: Authentication,
    pub verify_host_key: bool,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>) -> Self {
        ConnectionTarget {
            host: host.into(),
            port: None,
            username: None,
            authentication: Authentication::None,
            verify_host_key: true,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    pub fn skip_host_key_verification(mut self) -> Self {
        self.verify_host_key = false;
        self
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    pub fn effective_username(&self) -> String {
        match &self.username {
            Some(username) if !username.is_empty() => username.clone(),
            _ => local_username(),
        }
    }

    /// `user@host`, the identity used by the session cache.
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.effective_username(), self.host)
    }

    pub fn resolve(&self) -> ResolvedTarget {
        ResolvedTarget {
            host: self.host.clone(),
            port: self.effective_port(),
            username: self.effective_username(),
            authentication: self.authentication.clone(),
            verify_host_key: self.verify_host_key,
        }
    }
}

/// A target with every default applied, handed to the transport backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub authentication: Authentication,
    pub verify_host_key: bool,
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

pub fn local_username() -> String {
    whoami::username()
}

pub fn local_home_dir() -> String {
    dirs::home_dir()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default()
}
