use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use russh::{client, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    error::{Result, TransportError},
    target::{Authentication, ResolvedTarget},
    transport::{CommandChannel, Session, TransferChannel},
};

use super::{executor::RusshCommandChannel, filesystem::RusshTransferChannel, with_timeout};

/// Accepts known host keys, learns unknown ones and rejects changed ones.
/// With verification off every key is accepted.
#[derive(Debug)]
pub struct HostKeyHandler {
    host: String,
    port: u16,
    verify: bool,
}

impl HostKeyHandler {
    pub fn new(host: impl Into<String>, port: u16, verify: bool) -> Self {
        HostKeyHandler {
            host: host.into(),
            port,
            verify,
        }
    }
}

#[async_trait]
impl client::Handler for HostKeyHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if !self.verify {
            return Ok(true);
        }
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, port = self.port, "learning unknown host key");
                let learned =
                    russh_keys::learn_known_hosts(&self.host, self.port, server_public_key);
                if let Err(err) = learned {
                    warn!(host = %self.host, error = %err, "could not record host key");
                }
                Ok(true)
            }
            Err(err) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    error = %err,
                    "host key verification failed"
                );
                Err(TransportError::HostKeyRejected(format!("{}:{}", self.host, self.port)))
            }
        }
    }
}

pub struct RusshSession {
    target: ResolvedTarget,
    config: Arc<client::Config>,
    handle: OnceCell<client::Handle<HostKeyHandler>>,
    disconnected: AtomicBool,
}

impl RusshSession {
    pub(super) fn new(target: ResolvedTarget, config: Arc<client::Config>) -> Self {
        RusshSession {
            target,
            config,
            handle: OnceCell::new(),
            disconnected: AtomicBool::new(false),
        }
    }

    fn handle(&self) -> Result<&client::Handle<HostKeyHandler>> {
        match self.handle.get() {
            Some(handle) if self.is_connected() => Ok(handle),
            _ => Err(TransportError::channel(format!("session {} is not connected", self.target))),
        }
    }

    async fn authenticate(&self, handle: &mut client::Handle<HostKeyHandler>) -> Result<bool> {
        let username = self.target.username.clone();
        let authenticated = match &self.target.authentication {
            Authentication::Password(password) => {
                handle.authenticate_password(username, password.as_str()).await?
            }
            Authentication::PrivateKey { path, passphrase } => {
                let key_pair =
                    russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|err| {
                        TransportError::Authentication(format!(
                            "{} (key {}: {err})",
                            self.target,
                            path.display()
                        ))
                    })?;
                handle.authenticate_publickey(username, Arc::new(key_pair)).await?
            }
            Authentication::None => handle.authenticate_none(username).await?,
        };
        Ok(authenticated)
    }
}

#[async_trait]
impl Session for RusshSession {
    async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let handler = HostKeyHandler::new(
            &self.target.host,
            self.target.port,
            self.target.verify_host_key,
        );
        let address = (self.target.host.clone(), self.target.port);
        let connecting = async {
            client::connect(self.config.clone(), address, handler)
                .await
                .map_err(|err| match err {
                    TransportError::HostKeyRejected(_) => err,
                    other => TransportError::Connection {
                        host: self.target.host.clone(),
                        message: other.to_string(),
                    },
                })
        };
        let mut handle = with_timeout(timeout, connecting).await?;

        let authenticated = with_timeout(timeout, self.authenticate(&mut handle)).await;
        // kept even on failure so the owner can tear the transport down
        let _ = self.handle.set(handle);
        match authenticated {
            Ok(true) => {
                debug!(target = %self.target, "authenticated");
                Ok(())
            }
            Ok(false) => Err(TransportError::Authentication(self.target.to_string())),
            Err(err) => Err(err),
        }
    }

    fn is_connected(&self) -> bool {
        match self.handle.get() {
            Some(handle) => !self.disconnected.load(Ordering::SeqCst) && !handle.is_closed(),
            None => false,
        }
    }

    async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.get() {
            if let Err(err) = handle.disconnect(Disconnect::ByApplication, "", "English").await {
                debug!(
                    target = %self.target,
                    error = %err,
                    "disconnect after transport already closed"
                );
            }
        }
    }

    async fn open_transfer_channel(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn TransferChannel>> {
        let handle = self.handle()?;
        let opening = async {
            let channel = handle.channel_open_session().await?;
            channel.request_subsystem(true, "sftp").await?;
            let sftp = SftpSession::new(channel.into_stream()).await?;
            Ok::<_, TransportError>(sftp)
        };
        let sftp = with_timeout(timeout, opening).await?;
        Ok(Box::new(RusshTransferChannel::new(sftp)))
    }

    async fn open_command_channel(&self, command: &str) -> Result<Box<dyn CommandChannel>> {
        let handle = self.handle()?;
        let mut channel = handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        Ok(Box::new(RusshCommandChannel::new(channel)))
    }
}
