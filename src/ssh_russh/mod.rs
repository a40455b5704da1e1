//! [`SshTransport`](crate::transport::SshTransport) backed by `russh`, `russh-keys`
//! and `russh-sftp`.

pub mod connection;
mod executor;
mod filesystem;

use std::{future::Future, sync::Arc, time::Duration};

pub use connection::{HostKeyHandler, RusshSession};
use russh::client;

use crate::{
    error::{Result, TransportError},
    target::ResolvedTarget,
    transport::{Session, SshTransport},
};

pub struct RusshTransport {
    config: Arc<client::Config>,
}

impl Default for RusshTransport {
    fn default() -> Self {
        RusshTransport::new(client::Config::default())
    }
}

impl RusshTransport {
    pub fn new(config: client::Config) -> Self {
        RusshTransport {
            config: Arc::new(config),
        }
    }
}

impl SshTransport for RusshTransport {
    fn create_session(&self, target: &ResolvedTarget) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(RusshSession::new(target.clone(), self.config.clone())))
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) if !timeout.is_zero() => tokio::time::timeout(timeout, operation)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?,
        _ => operation.await,
    }
}
