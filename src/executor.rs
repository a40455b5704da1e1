use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::broadcast,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TransportError},
    monitor::ExecutionMonitor,
    transport::{CommandChannel, CommandEvent, Session},
};

pub const DEFAULT_LINE_CAPACITY: usize = 500;
const SUBSCRIBER_BACKLOG: usize = 1024;
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Keeps the most recent `capacity` lines, dropping the oldest first.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        LineBuffer {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_LINE_CAPACITY)),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Output of one finished (or aborted) run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub command: String,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: Option<i32>,
}

/// Live and retained command output. Successful and failed runs are kept apart.
pub struct OutputLog {
    sender: broadcast::Sender<OutputLine>,
    capacity: usize,
    last_success: Mutex<Option<CapturedOutput>>,
    last_failure: Mutex<Option<CapturedOutput>>,
}

impl Default for OutputLog {
    fn default() -> Self {
        OutputLog::new(DEFAULT_LINE_CAPACITY)
    }
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        OutputLog {
            sender,
            capacity,
            last_success: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    /// A receiver for lines as they arrive. A subscriber that falls behind
    /// skips lines instead of stalling the command.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.sender.subscribe()
    }

    pub fn last_success(&self) -> Option<CapturedOutput> {
        lock(&self.last_success).clone()
    }

    pub fn last_failure(&self) -> Option<CapturedOutput> {
        lock(&self.last_failure).clone()
    }

    fn publish(&self, line: OutputLine) {
        // no subscribers is fine
        let _ = self.sender.send(line);
    }

    fn record(&self, output: CapturedOutput, succeeded: bool) {
        let slot = if succeeded { &self.last_success } else { &self.last_failure };
        *lock(slot) = Some(output);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Starts a command somewhere, local or remote.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// The command line reported for `command` in logs and captured output.
    fn command_line(&self, command: &str) -> String;

    async fn spawn(&self, command: &str) -> Result<Box<dyn CommandChannel>>;
}

/// Runs commands on a command channel of an existing session.
pub struct RemoteRunner {
    session: Arc<dyn Session>,
}

impl RemoteRunner {
    pub fn new(session: Arc<dyn Session>) -> Self {
        RemoteRunner { session }
    }
}

#[async_trait]
impl CommandRunner for RemoteRunner {
    fn command_line(&self, command: &str) -> String {
        command.to_string()
    }

    async fn spawn(&self, command: &str) -> Result<Box<dyn CommandChannel>> {
        self.session.open_command_channel(command).await
    }
}

pub struct CommandExecutor<R> {
    runner: R,
    log: Arc<OutputLog>,
    timeout: Option<Duration>,
}

impl<R: CommandRunner> CommandExecutor<R> {
    pub fn new(runner: R) -> Self {
        CommandExecutor {
            runner,
            log: Arc::new(OutputLog::default()),
            timeout: None,
        }
    }

    pub fn with_log(mut self, log: Arc<OutputLog>) -> Self {
        self.log = log;
        self
    }

    /// `None` or zero means no limit.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn log(&self) -> &Arc<OutputLog> {
        &self.log
    }

    /// Runs `command` to completion and returns its exit code (always zero,
    /// a non-zero exit is reported as [`TransportError::CommandFailed`]).
    pub async fn execute(&self, command: &str, monitor: &dyn ExecutionMonitor) -> Result<i32> {
        let command_line = self.runner.command_line(command);
        let mut capture = Capture::new(&self.log, command_line.clone());
        info!(command = %command_line, "executing command");

        let result = match self.drive(command, monitor, &mut capture).await {
            Ok(0) => Ok(0),
            Ok(exit_code) => Err(TransportError::CommandFailed { exit_code }),
            Err(err) => Err(err),
        };

        let exit_code = match &result {
            Ok(code) => Some(*code),
            Err(TransportError::CommandFailed { exit_code }) => Some(*exit_code),
            Err(_) => None,
        };
        let output = capture.finish(exit_code);
        match &result {
            Ok(_) => debug!(command = %command_line, "command succeeded"),
            Err(err) => warn!(command = %command_line, error = %err, "command failed"),
        }
        self.log.record(output, result.is_ok());
        result
    }

    async fn drive(
        &self,
        command: &str,
        monitor: &dyn ExecutionMonitor,
        capture: &mut Capture<'_>,
    ) -> Result<i32> {
        monitor.check_canceled()?;
        let deadline = self.timeout.map(|timeout| (Instant::now() + timeout, timeout));

        let mut channel = match deadline {
            Some((at, timeout)) => tokio::time::timeout_at(at, self.runner.spawn(command))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??,
            None => self.runner.spawn(command).await?,
        };
        let result = pump(channel.as_mut(), monitor, capture, deadline).await;
        channel.close().await;
        result
    }
}

/// Feeds channel events into `capture` until the channel ends, re-checking
/// the monitor at least every [`CANCEL_POLL_INTERVAL`] while the command is silent.
async fn pump(
    channel: &mut dyn CommandChannel,
    monitor: &dyn ExecutionMonitor,
    capture: &mut Capture<'_>,
    deadline: Option<(Instant, Duration)>,
) -> Result<i32> {
    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut exit_code = None;

    loop {
        monitor.check_canceled()?;
        tokio::select! {
            event = channel.next_event() => match event {
                Some(CommandEvent::Stdout(data)) => capture.feed(OutputStream::Stdout, &data),
                Some(CommandEvent::Stderr(data)) => capture.feed(OutputStream::Stderr, &data),
                Some(CommandEvent::Exit(code)) => exit_code = Some(code),
                None => break,
            },
            _ = poll.tick() => {}
            timeout = expiry(deadline) => return Err(TransportError::Timeout(timeout)),
        }
    }

    // a channel that closes without reporting a status never ran properly
    Ok(exit_code.unwrap_or(-1))
}

async fn expiry(deadline: Option<(Instant, Duration)>) -> Duration {
    match deadline {
        Some((at, timeout)) => {
            tokio::time::sleep_until(at).await;
            timeout
        }
        None => std::future::pending().await,
    }
}

struct Capture<'a> {
    log: &'a OutputLog,
    command: String,
    stdout: StreamCapture,
    stderr: StreamCapture,
}

impl<'a> Capture<'a> {
    fn new(log: &'a OutputLog, command: String) -> Self {
        Capture {
            log,
            command,
            stdout: StreamCapture::new(log.capacity),
            stderr: StreamCapture::new(log.capacity),
        }
    }

    fn feed(&mut self, stream: OutputStream, data: &[u8]) {
        let target = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        for text in target.feed(data) {
            self.log.publish(OutputLine { stream, text });
        }
    }

    fn finish(mut self, exit_code: Option<i32>) -> CapturedOutput {
        if let Some(text) = self.stdout.flush() {
            self.log.publish(OutputLine {
                stream: OutputStream::Stdout,
                text,
            });
        }
        if let Some(text) = self.stderr.flush() {
            self.log.publish(OutputLine {
                stream: OutputStream::Stderr,
                text,
            });
        }
        CapturedOutput {
            command: self.command,
            stdout: self.stdout.lines.to_vec(),
            stderr: self.stderr.lines.to_vec(),
            exit_code,
        }
    }
}

/// Splits a byte stream into lines, holding back an unterminated tail.
struct StreamCapture {
    pending: Vec<u8>,
    lines: LineBuffer,
}

impl StreamCapture {
    fn new(capacity: usize) -> Self {
        StreamCapture {
            pending: Vec::new(),
            lines: LineBuffer::new(capacity),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut complete = Vec::new();
        while let Some(index) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=index).collect();
            complete.push(self.take_line(&line[..line.len() - 1]));
        }
        complete
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(self.take_line(&line))
    }

    fn take_line(&mut self, raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw).into_owned();
        self.lines.push(text.clone());
        text
    }
}
