use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::Result, target::ResolvedTarget};

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAttributes {
    pub size: u64,
    /// Seconds since the epoch.
    pub modified: i64,
    pub is_dir: bool,
}

/// The platform service that knows how to build sessions for a target.
pub trait SshTransport: Send + Sync {
    /// Creates an unconnected session object for the target.
    fn create_session(&self, target: &ResolvedTarget) -> Result<Arc<dyn Session>>;
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Negotiates and authenticates. May leave the session connected even when it fails
    /// (e.g. rejected credentials), callers disconnect in that case.
    async fn connect(&self, timeout: Option<Duration>) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);

    async fn open_transfer_channel(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn TransferChannel>>;

    async fn open_command_channel(&self, command: &str) -> Result<Box<dyn CommandChannel>>;
}

/// A file-transfer sub-channel, used for exactly one logical operation.
#[async_trait]
pub trait TransferChannel: Send {
    async fn stat(&mut self, path: &str) -> Result<RemoteAttributes>;

    /// Entry names of a directory, `.` and `..` included.
    async fn read_dir(&mut self, path: &str) -> Result<Vec<String>>;

    async fn create_dir(&mut self, path: &str) -> Result<()>;

    async fn remove_dir(&mut self, path: &str) -> Result<()>;

    async fn remove_file(&mut self, path: &str) -> Result<()>;

    async fn open_read(&mut self, path: &str) -> Result<RemoteReader>;

    /// Opens for writing, creating or truncating the file.
    async fn open_write(&mut self, path: &str) -> Result<RemoteWriter>;

    /// `-1` while the channel has not closed.
    fn exit_status(&self) -> i32;

    async fn disconnect(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

#[async_trait]
pub trait CommandChannel: Send {
    /// `None` once the channel has closed.
    async fn next_event(&mut self) -> Option<CommandEvent>;

    async fn close(&mut self);
}

pub(crate) fn is_pseudo_entry(name: &str) -> bool {
    name == "." || name == ".."
}

pub(crate) fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub(crate) fn parent_remote(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let index = trimmed.rfind('/')?;
    if index == 0 {
        return if trimmed.len() > 1 { Some("/") } else { None };
    }
    Some(&trimmed[..index])
}
