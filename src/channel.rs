use std::sync::Arc;

use tracing::debug;

use crate::{
    error::{Result, TransportError},
    session::SessionManager,
    target::ConnectionTarget,
    transport::{Session, TransferChannel},
};

/// Decides whether a failed channel open was an artifact of a stale session
/// and deserves one retry on a fresh one.
pub type StalePredicate = Arc<dyn Fn(&dyn Session, &TransportError) -> bool + Send + Sync>;

/// Exit status a channel reports when it never got as far as running.
pub const UNSTARTED_EXIT_STATUS: i32 = -1;

pub fn default_stale_predicate() -> StalePredicate {
    Arc::new(|session: &dyn Session, err: &TransportError| {
        if !session.is_connected() {
            return true;
        }
        matches!(
            err,
            TransportError::Channel { exit_status: Some(status), .. }
                if *status != UNSTARTED_EXIT_STATUS
        )
    })
}

#[derive(Clone)]
pub struct ChannelFactory {
    sessions: Arc<SessionManager>,
}

impl ChannelFactory {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        ChannelFactory { sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Opens a transfer channel, on `session` if given, otherwise on a new one.
    /// A session the factory created itself is disconnected again if the channel can't be opened.
    pub async fn create_channel(
        &self,
        target: &ConnectionTarget,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(Box<dyn TransferChannel>, Arc<dyn Session>)> {
        let (session, owned) = match session {
            Some(session) => (session, false),
            None => (self.sessions.connected_session(target).await?, true),
        };

        match session.open_transfer_channel(self.sessions.timeout()).await {
            Ok(channel) => Ok((channel, session)),
            Err(err) => {
                debug!(host = %target.host, owned, error = %err, "transfer channel open failed");
                if owned {
                    session.disconnect().await;
                }
                Err(err)
            }
        }
    }
}
