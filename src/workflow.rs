use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{
    channel::ChannelFactory,
    config::TransportConfig,
    error::{Result, TransportError},
    executor::{CommandExecutor, OutputLog, RemoteRunner},
    monitor::{ExecutionMonitor, Unmonitored},
    session::SessionManager,
    settings::{CredentialDecryptor, RemoteExecSettings},
    target::ConnectionTarget,
    transfer,
    transport::{Session, SshTransport, TransferChannel},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport<T> {
    pub value: T,
    pub command: String,
    pub exit_code: i32,
}

/// Upload an input file, run the configured command on it, fetch the output
/// file and remove both remote files again.
pub struct RemoteExecution {
    settings: RemoteExecSettings,
    target: ConnectionTarget,
    channels: ChannelFactory,
    log: Arc<OutputLog>,
    command_timeout: Option<Duration>,
}

impl RemoteExecution {
    pub fn new(
        settings: RemoteExecSettings,
        decryptor: &dyn CredentialDecryptor,
        transport: Arc<dyn SshTransport>,
    ) -> Result<Self> {
        settings.validate()?;
        let target = settings.connection_target(decryptor)?;
        let sessions = SessionManager::new(transport).with_timeout(settings.connect_timeout());
        Ok(RemoteExecution {
            settings,
            target,
            channels: ChannelFactory::new(Arc::new(sessions)),
            log: Arc::new(OutputLog::default()),
            command_timeout: None,
        })
    }

    pub fn with_log(mut self, log: Arc<OutputLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Applies the process-wide output capacity and command timeout. The
    /// process-wide connect timeout is used when the settings leave it at zero.
    pub fn configure(mut self, config: &TransportConfig) -> Self {
        if let (None, Some(timeout)) = (self.settings.connect_timeout(), config.connect_timeout()) {
            let transport = self.channels.sessions().transport().clone();
            let sessions = SessionManager::new(transport).with_timeout(Some(timeout));
            self.channels = ChannelFactory::new(Arc::new(sessions));
        }
        self.with_log(Arc::new(config.output_log()))
            .with_command_timeout(config.command_timeout())
    }

    pub fn log(&self) -> &Arc<OutputLog> {
        &self.log
    }

    pub fn command(&self) -> String {
        self.settings.expanded_command()
    }

    /// Runs the whole sequence and hands the downloaded output file to `parse`.
    /// The remote input and output files are deleted afterwards whatever the outcome.
    pub async fn run<T, F>(
        &self,
        local_input: &Path,
        monitor: &dyn ExecutionMonitor,
        parse: F,
    ) -> Result<ExecutionReport<T>>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        monitor.check_canceled()?;
        let command = self.command();
        let session = self.channels.sessions().connected_session(&self.target).await?;

        let staged = self.stage_run_fetch(&session, &command, local_input, monitor).await;
        let parsed = match staged {
            Ok((_dir, local_output, exit_code)) => {
                parse(&local_output).map(|value| (value, exit_code))
            }
            Err(err) => Err(err),
        };

        self.cleanup(&session).await;
        session.disconnect().await;

        let (value, exit_code) = parsed?;
        info!(host = %self.target.host, command = %command, "remote execution finished");
        Ok(ExecutionReport {
            value,
            command,
            exit_code,
        })
    }

    async fn stage_run_fetch(
        &self,
        session: &Arc<dyn Session>,
        command: &str,
        local_input: &Path,
        monitor: &dyn ExecutionMonitor,
    ) -> Result<(TempDir, PathBuf, i32)> {
        let remote_input = &self.settings.remote_input_file;
        let remote_output = &self.settings.remote_output_file;

        let mut channel = self.channel_on(session).await?;
        let uploaded = transfer::upload(channel.as_mut(), local_input, remote_input, monitor).await;
        channel.disconnect().await;
        uploaded?;
        monitor.report_progress("input staged");

        let executor = CommandExecutor::new(RemoteRunner::new(session.clone()))
            .with_log(self.log.clone())
            .with_timeout(self.command_timeout);
        let exit_code = executor.execute(command, monitor).await?;
        monitor.report_progress("command finished");

        let dir = tempfile::tempdir()?;
        let local_output = dir.path().join(file_name(remote_output));
        let mut channel = self.channel_on(session).await?;
        let downloaded =
            transfer::download(channel.as_mut(), remote_output, &local_output, monitor).await;
        channel.disconnect().await;
        downloaded?;
        monitor.report_progress("output fetched");

        Ok((dir, local_output, exit_code))
    }

    async fn channel_on(&self, session: &Arc<dyn Session>) -> Result<Box<dyn TransferChannel>> {
        let (channel, _) = self.channels.create_channel(&self.target, Some(session.clone())).await?;
        Ok(channel)
    }

    async fn cleanup(&self, session: &Arc<dyn Session>) {
        let mut channel = match self.channel_on(session).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    host = %self.target.host,
                    error = %err,
                    "could not open channel to remove remote files"
                );
                return;
            }
        };
        for path in [&self.settings.remote_input_file, &self.settings.remote_output_file] {
            match transfer::delete(channel.as_mut(), path, &Unmonitored).await {
                Ok(()) => debug!(path = %path, "removed remote file"),
                Err(TransportError::NoSuchFile(_)) => {}
                Err(err) => warn!(path = %path, error = %err, "could not remove remote file"),
            }
        }
        channel.disconnect().await;
    }
}

fn file_name(remote: &str) -> String {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("output")
        .to_string()
}
