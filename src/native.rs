use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use bytes::Bytes;
use shell_escape::unix::escape;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    error::{Result, TransportError},
    executor::CommandRunner,
    transport::{CommandChannel, CommandEvent},
};

/// Runs `<executable> <arguments>` through the local shell.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    executable: PathBuf,
    working_dir: Option<PathBuf>,
}

impl LocalRunner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        LocalRunner {
            executable: executable.into(),
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    /// The configured working directory, or the directory holding the executable.
    pub async fn effective_working_dir(&self) -> Option<PathBuf> {
        let executable = resolve_executable(&self.executable).await;
        self.working_dir_for(&executable)
    }

    fn working_dir_for(&self, executable: &Path) -> Option<PathBuf> {
        self.working_dir
            .clone()
            .or_else(|| executable.parent().map(Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// Symlinks resolved, or the path as given if it can't be.
async fn resolve_executable(executable: &Path) -> PathBuf {
    tokio::fs::canonicalize(executable)
        .await
        .unwrap_or_else(|_| executable.to_path_buf())
}

/// `arguments` is appended verbatim, the executable path is quoted.
fn render(executable: &Path, arguments: &str) -> String {
    let executable = escape(executable.to_string_lossy()).into_owned();
    if arguments.trim().is_empty() {
        executable
    } else {
        format!("{executable} {arguments}")
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    fn command_line(&self, arguments: &str) -> String {
        render(&self.executable, arguments)
    }

    async fn spawn(&self, arguments: &str) -> Result<Box<dyn CommandChannel>> {
        let executable = resolve_executable(&self.executable).await;
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(render(&executable, arguments))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(working_dir) = self.working_dir_for(&executable) {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Other("stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Other("stderr was not piped".into()))?;

        let (sender, events) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            tokio::join!(
                forward(stdout, sender.clone(), CommandEvent::Stdout),
                forward(stderr, sender.clone(), CommandEvent::Stderr),
            );
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = sender.send(CommandEvent::Exit(code)).await;
        });

        Ok(Box::new(LocalCommandChannel { events, task }))
    }
}

async fn forward<R>(
    mut reader: R,
    sender: mpsc::Sender<CommandEvent>,
    wrap: fn(Bytes) -> CommandEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                if sender.send(wrap(Bytes::copy_from_slice(&buf[..read]))).await.is_err() {
                    break;
                }
            }
        }
    }
}

struct LocalCommandChannel {
    events: mpsc::Receiver<CommandEvent>,
    task: JoinHandle<()>,
}

#[async_trait]
impl CommandChannel for LocalCommandChannel {
    async fn next_event(&mut self) -> Option<CommandEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        self.events.close();
        // dropping the task drops the child, which kills it if still running
        self.task.abort();
    }
}

impl Drop for LocalCommandChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}
