use std::{
    io::Cursor,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use chrono::DateTime;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

use crate::{
    address::ResourceAddress,
    cache::SessionCache,
    channel::{default_stale_predicate, StalePredicate},
    error::{Result, TransportError},
    session::SessionManager,
    target::ConnectionTarget,
    transport::{RemoteAttributes, RemoteReader, RemoteWriter, Session, TransferChannel},
};

pub const UNKNOWN_CONTENT_LENGTH: i64 = -1;
pub const UNKNOWN_DATE: i64 = 0;

/// Opens [`RemoteFileConnection`]s, sharing sessions through the injected cache.
#[derive(Clone)]
pub struct RemoteFileResolver {
    sessions: Arc<SessionManager>,
    cache: Arc<SessionCache>,
    stale: StalePredicate,
}

impl RemoteFileResolver {
    pub fn new(sessions: Arc<SessionManager>, cache: Arc<SessionCache>) -> Self {
        RemoteFileResolver {
            sessions,
            cache,
            stale: default_stale_predicate(),
        }
    }

    pub fn with_stale_predicate(mut self, stale: StalePredicate) -> Self {
        self.stale = stale;
        self
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn open(&self, address: &str) -> Result<RemoteFileConnection> {
        let address = ResourceAddress::parse(address)?;
        Ok(self.open_address(address))
    }

    pub fn open_address(&self, address: ResourceAddress) -> RemoteFileConnection {
        let target = address.connection_target();
        RemoteFileConnection {
            address,
            target,
            resolver: self.clone(),
            connected: false,
            attributes: None,
        }
    }

    /// Opens a transfer channel on the cached session for `target`. If that fails in a way
    /// the stale predicate attributes to a dead session, the cached session is
    /// invalidated and the open is retried once on a brand-new one.
    pub async fn open_channel(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn TransferChannel>> {
        let (channel, lease) = self.open_leased_channel(target).await?;
        lease.release().await;
        Ok(channel)
    }

    async fn open_leased_channel(
        &self,
        target: &ConnectionTarget,
    ) -> Result<(Box<dyn TransferChannel>, Lease)> {
        let session = self.cached_session(target, false).await?;
        let opened = session.open_transfer_channel(self.sessions.timeout()).await;
        let session = match opened {
            Ok(channel) => return Ok((channel, self.lease(target, session))),
            Err(err) if (self.stale)(session.as_ref(), &err) => {
                warn!(
                    key = %target.cache_key(),
                    error = %err,
                    "cached session looks stale, reconnecting"
                );
                drop(session);
                self.cached_session(target, true).await?
            }
            Err(err) => return Err(err),
        };
        let channel = session.open_transfer_channel(self.sessions.timeout()).await?;
        Ok((channel, self.lease(target, session)))
    }

    fn lease(&self, target: &ConnectionTarget, session: Arc<dyn Session>) -> Lease {
        Lease {
            key: target.cache_key(),
            session,
            cache: self.cache.clone(),
        }
    }

    async fn cached_session(
        &self,
        target: &ConnectionTarget,
        force_new: bool,
    ) -> Result<Arc<dyn Session>> {
        let key = target.cache_key();
        if force_new {
            self.cache.invalidate(&key).await;
        } else if let Some(session) = self.cache.get(&key).await {
            return Ok(session);
        }

        let session = self.sessions.connected_session(target).await?;
        self.cache.insert(&key, session.clone()).await;
        Ok(session)
    }
}

/// A connection to one remote file or directory.
pub struct RemoteFileConnection {
    address: ResourceAddress,
    target: ConnectionTarget,
    resolver: RemoteFileResolver,
    connected: bool,
    attributes: Option<RemoteAttributes>,
}

impl RemoteFileConnection {
    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Fetches the remote attributes. A missing file is not an error here,
    /// the attributes simply stay unknown.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        let mut held = Held::open(&self.resolver, &self.target).await?;
        let stat = held.channel.stat(&self.address.path).await;
        held.close().await;

        match stat {
            Ok(attributes) => self.attributes = Some(attributes),
            Err(TransportError::NoSuchFile(_)) => {
                debug!(path = %self.address.path, "remote file does not exist yet");
                self.attributes = None;
            }
            Err(err) => return Err(err),
        }
        self.connected = true;
        Ok(())
    }

    pub fn attributes(&self) -> Option<&RemoteAttributes> {
        self.attributes.as_ref()
    }

    pub fn content_length(&self) -> i64 {
        match &self.attributes {
            Some(attributes) => attributes.size as i64,
            None => UNKNOWN_CONTENT_LENGTH,
        }
    }

    /// Modification time in milliseconds since the epoch.
    pub fn date(&self) -> i64 {
        match &self.attributes {
            Some(attributes) => attributes.modified * 1000,
            None => UNKNOWN_DATE,
        }
    }

    pub fn header_field(&self, name: &str) -> Option<String> {
        let attributes = self.attributes.as_ref()?;
        match name.to_ascii_lowercase().as_str() {
            "content-type" => Some(
                if attributes.is_dir && self.address.directory_request {
                    "text/plain"
                } else {
                    "application/octet-stream"
                }
                .to_string(),
            ),
            "content-length" => Some(attributes.size.to_string()),
            "last-modified" => {
                DateTime::from_timestamp(attributes.modified, 0).map(|date| date.to_rfc2822())
            }
            _ => None,
        }
    }

    pub async fn open_read_stream(&mut self) -> Result<RemoteReadStream> {
        self.connect().await?;

        let is_dir = self.attributes.map(|attributes| attributes.is_dir).unwrap_or(false);
        if is_dir {
            if !self.address.directory_request {
                return Err(TransportError::ReadFromDirectory);
            }
            let mut held = Held::open(&self.resolver, &self.target).await?;
            let listing = held.channel.read_dir(&self.address.path).await;
            held.close().await;
            let listing = listing?.join("\n");
            return Ok(RemoteReadStream {
                inner: Box::new(Cursor::new(listing.into_bytes())),
                held: None,
            });
        }
        if self.address.directory_request {
            return Err(TransportError::NotADirectory(self.address.path.clone()));
        }

        let mut held = Held::open(&self.resolver, &self.target).await?;
        match held.channel.open_read(&self.address.path).await {
            Ok(inner) => Ok(RemoteReadStream {
                inner,
                held: Some(held),
            }),
            Err(err) => {
                held.close().await;
                Err(err)
            }
        }
    }

    pub async fn open_write_stream(&mut self) -> Result<RemoteWriteStream> {
        self.connect().await?;
        if self.attributes.map(|attributes| attributes.is_dir).unwrap_or(false) {
            return Err(TransportError::WriteToDirectory);
        }

        let mut held = Held::open(&self.resolver, &self.target).await?;
        match held.channel.open_write(&self.address.path).await {
            Ok(inner) => Ok(RemoteWriteStream {
                inner,
                held: Some(held),
            }),
            Err(err) => {
                held.close().await;
                Err(err)
            }
        }
    }
}

/// A cached session taken for the lifetime of one channel.
struct Lease {
    key: String,
    session: Arc<dyn Session>,
    cache: Arc<SessionCache>,
}

impl Lease {
    async fn release(self) {
        self.cache.release(&self.key, self.session).await;
    }
}

/// A transfer channel together with the session it was opened on.
struct Held {
    channel: Box<dyn TransferChannel>,
    lease: Lease,
}

impl Held {
    async fn open(resolver: &RemoteFileResolver, target: &ConnectionTarget) -> Result<Held> {
        let (channel, lease) = resolver.open_leased_channel(target).await?;
        Ok(Held { channel, lease })
    }

    async fn close(mut self) {
        self.channel.disconnect().await;
        self.lease.release().await;
    }

    /// Closes on the current runtime, for streams dropped without `close`.
    fn close_detached(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.close());
            }
            Err(_) => warn!(
                key = %self.lease.key,
                "stream dropped outside a runtime, channel left open"
            ),
        }
    }
}

/// Bytes of a remote file, or of a directory listing. [`close`](Self::close)
/// disconnects the channel backing the stream; dropping the stream does the
/// same in the background.
pub struct RemoteReadStream {
    inner: RemoteReader,
    held: Option<Held>,
}

impl RemoteReadStream {
    pub async fn close(mut self) {
        if let Some(held) = self.held.take() {
            held.close().await;
        }
    }
}

impl Drop for RemoteReadStream {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            debug!("read stream dropped without close");
            held.close_detached();
        }
    }
}

impl AsyncRead for RemoteReadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Sink for a remote file. [`close`](Self::close) flushes the data and
/// disconnects the channel backing the stream. A stream dropped without
/// `close` still has its channel disconnected, unflushed data may be lost.
pub struct RemoteWriteStream {
    inner: RemoteWriter,
    held: Option<Held>,
}

impl RemoteWriteStream {
    pub async fn close(mut self) -> Result<()> {
        let flushed = self.inner.shutdown().await;
        if let Some(held) = self.held.take() {
            held.close().await;
        }
        flushed?;
        Ok(())
    }
}

impl Drop for RemoteWriteStream {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            debug!("write stream dropped without close");
            held.close_detached();
        }
    }
}

impl AsyncWrite for RemoteWriteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
