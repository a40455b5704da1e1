use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};

/// The host engine's execution context as seen by long-running operations.
pub trait ExecutionMonitor: Send + Sync {
    fn check_canceled(&self) -> Result<()>;

    fn report_progress(&self, _message: &str) {}
}

impl ExecutionMonitor for CancellationToken {
    fn check_canceled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        Ok(())
    }
}

/// Monitor for callers that never cancel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmonitored;

impl ExecutionMonitor for Unmonitored {
    fn check_canceled(&self) -> Result<()> {
        Ok(())
    }
}
