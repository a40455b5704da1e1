use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid resource address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("Authentication failed for {0}")]
    Authentication(String),

    #[error("Host key for {0} was rejected")]
    HostKeyRejected(String),

    #[error("Couldn't establish session to {0}")]
    SessionUnavailable(String),

    #[error("Channel error: {message}")]
    Channel {
        message: String,
        exit_status: Option<i32>,
    },

    #[error("No such file: {0}")]
    NoSuchFile(String),

    #[error(
        "Cannot read from a directory. Append ';type=d' to the URL to retrieve the directory listing."
    )]
    ReadFromDirectory,

    #[error("Cannot write to a directory")]
    WriteToDirectory,

    #[error("{0} does not denote a directory")]
    NotADirectory(String),

    #[error("{0} exists and is not a directory")]
    ExistsNotDirectory(String),

    #[error("Can't create directory {0}")]
    CreateDirectory(String),

    #[error("Couldn't create local directory {0}")]
    CreateLocalDirectory(String),

    #[error("Execution canceled")]
    Cancelled,

    #[error("Command failed with exit code {exit_code}")]
    CommandFailed { exit_code: i32 },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn channel(message: impl Into<String>) -> Self {
        TransportError::Channel {
            message: message.into(),
            exit_status: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// Whether the innermost cause carries no message at all.
    pub(crate) fn is_blank(&self) -> bool {
        match self {
            TransportError::Other(message)
            | TransportError::Sftp(message)
            | TransportError::Connection { message, .. }
            | TransportError::Channel { message, .. } => message.trim().is_empty(),
            _ => false,
        }
    }
}

#[cfg(feature = "impl-russh")]
impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect | russh::Error::SendError => TransportError::Channel {
                message: err.to_string(),
                exit_status: None,
            },
            russh::Error::IO(io_err) => TransportError::Io(io_err),
            other => TransportError::Other(other.to_string()),
        }
    }
}

#[cfg(feature = "impl-russh")]
impl From<russh_sftp::client::error::Error> for TransportError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::{client::error::Error, protocol::StatusCode};

        match err {
            Error::Status(status) if status.status_code == StatusCode::NoSuchFile => {
                TransportError::NoSuchFile(status.error_message)
            }
            other => TransportError::Sftp(other.to_string()),
        }
    }
}
