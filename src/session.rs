use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TransportError},
    target::ConnectionTarget,
    transport::{Session, SshTransport},
};

/// Hands out connected sessions. Negotiations through one manager never overlap;
/// separate managers are independent of each other.
pub struct SessionManager {
    transport: Arc<dyn SshTransport>,
    timeout: Option<Duration>,
    negotiation: Mutex<()>,
    negotiations: AtomicUsize,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn SshTransport>) -> Self {
        SessionManager {
            transport,
            timeout: None,
            negotiation: Mutex::new(()),
            negotiations: AtomicUsize::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn transport(&self) -> &Arc<dyn SshTransport> {
        &self.transport
    }

    /// Number of negotiations started so far.
    pub fn negotiations(&self) -> usize {
        self.negotiations.load(Ordering::SeqCst)
    }

    pub async fn connected_session(&self, target: &ConnectionTarget) -> Result<Arc<dyn Session>> {
        let _guard = self.negotiation.lock().await;
        let resolved = target.resolve();
        self.negotiations.fetch_add(1, Ordering::SeqCst);
        debug!(target = %resolved, "negotiating session");

        let session = self.transport.create_session(&resolved)?;
        match session.connect(self.timeout).await {
            Ok(()) => {
                info!(target = %resolved, "session established");
                Ok(session)
            }
            Err(err) => {
                if session.is_connected() {
                    session.disconnect().await;
                }
                warn!(target = %resolved, error = %err, "session negotiation failed");
                if err.is_blank() {
                    return Err(TransportError::SessionUnavailable(resolved.to_string()));
                }
                Err(err)
            }
        }
    }
}
