#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    io::Cursor,
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use remote_transport::{
    error::{Result, TransportError},
    monitor::ExecutionMonitor,
    target::ResolvedTarget,
    transport::{
        CommandChannel, CommandEvent, RemoteAttributes, RemoteReader, RemoteWriter, Session,
        SshTransport, TransferChannel,
    },
};
use tokio::io::{self, AsyncWrite};
use uuid::Uuid;

pub const MODIFIED: i64 = 1_700_000_000;

/// Routes the crate's tracing output through the test harness.
/// Safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn gen_tmp_path() -> String {
    format!("/tmp/{}", Uuid::new_v4())
}

pub fn local_tmp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Could not create local temp dir")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(Vec<u8>),
    Dir,
}

/// Everything the fake remote side did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Stat(String),
    ReadDir(String),
    CreateDir(String),
    RemoveDir(String),
    RemoveFile(String),
    OpenRead(String),
    OpenWrite(String),
    Exec(String),
}

#[derive(Debug)]
pub struct FakeFs {
    pub nodes: BTreeMap<String, Node>,
    pub ops: Vec<Op>,
}

impl FakeFs {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        nodes.insert("/tmp".to_string(), Node::Dir);
        FakeFs { nodes, ops: Vec::new() }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.get(&normalize(path)) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(&normalize(path)), Some(Node::Dir))
    }

    pub fn put_file(&mut self, path: &str, content: &[u8]) {
        self.nodes.insert(normalize(path), Node::File(content.to_vec()));
    }

    pub fn put_dir(&mut self, path: &str) {
        self.nodes.insert(normalize(path), Node::Dir);
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        self.nodes
            .keys()
            .filter(|key| {
                key.starts_with(&prefix)
                    && key.len() > prefix.len()
                    && !key[prefix.len()..].contains('/')
            })
            .map(|key| key[prefix.len()..].to_string())
            .collect()
    }

    fn parent_is_dir(&self, path: &str) -> bool {
        match path.rfind('/') {
            Some(0) => true,
            Some(index) => self.is_dir(&path[..index]),
            None => false,
        }
    }
}

pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn failure(message: &str) -> TransportError {
    TransportError::Sftp(message.to_string())
}

pub type CommandScript = Arc<dyn Fn(&str, &mut FakeFs) -> Vec<CommandEvent> + Send + Sync>;

/// In-memory stand-in for an SSH server, shared by every session it hands out.
#[derive(Clone)]
pub struct FakeTransport {
    pub fs: Arc<Mutex<FakeFs>>,
    pub sessions: Arc<Mutex<Vec<Arc<FakeSession>>>>,
    pub channels_opened: Arc<AtomicUsize>,
    /// Transfer channels opened and not yet disconnected.
    pub channels_open: Arc<AtomicUsize>,
    pub commands_closed: Arc<AtomicUsize>,
    /// Commands stay silent forever once their scripted events are used up.
    pub hang_commands: Arc<AtomicBool>,
    pub fail_stat: Arc<AtomicBool>,
    /// Remote path whose open for write fails.
    pub fail_write: Arc<Mutex<Option<String>>>,
    pub reject_auth: Arc<AtomicBool>,
    pub connect_error: Arc<Mutex<Option<TransportError>>>,
    /// Exit status reported by the next failing channel open, if one should fail.
    pub fail_next_channel: Arc<Mutex<Option<i32>>>,
    pub script: CommandScript,
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport {
            fs: Arc::new(Mutex::new(FakeFs::new())),
            sessions: Arc::new(Mutex::new(Vec::new())),
            channels_opened: Arc::new(AtomicUsize::new(0)),
            channels_open: Arc::new(AtomicUsize::new(0)),
            commands_closed: Arc::new(AtomicUsize::new(0)),
            hang_commands: Arc::new(AtomicBool::new(false)),
            fail_stat: Arc::new(AtomicBool::new(false)),
            fail_write: Arc::new(Mutex::new(None)),
            reject_auth: Arc::new(AtomicBool::new(false)),
            connect_error: Arc::new(Mutex::new(None)),
            fail_next_channel: Arc::new(Mutex::new(None)),
            script: Arc::new(|_, _| vec![CommandEvent::Exit(0)]),
        }
    }

    pub fn with_script<F>(mut self, script: F) -> Self
    where
        F: Fn(&str, &mut FakeFs) -> Vec<CommandEvent> + Send + Sync + 'static,
    {
        self.script = Arc::new(script);
        self
    }

    pub fn shared(&self) -> Arc<dyn SshTransport> {
        Arc::new(self.clone())
    }

    pub fn fs(&self) -> std::sync::MutexGuard<'_, FakeFs> {
        self.fs.lock().unwrap()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.fs().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.fs().ops.clear();
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.channels_open.load(Ordering::SeqCst)
    }

    pub fn commands_closed(&self) -> usize {
        self.commands_closed.load(Ordering::SeqCst)
    }

    /// Kills every session behind the callers' backs.
    pub fn drop_all_sessions(&self) {
        for session in self.sessions.lock().unwrap().iter() {
            session.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn fail_next_channel(&self, exit_status: i32) {
        *self.fail_next_channel.lock().unwrap() = Some(exit_status);
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|session| session.connected.load(Ordering::SeqCst))
            .count()
    }
}

impl SshTransport for FakeTransport {
    fn create_session(&self, target: &ResolvedTarget) -> Result<Arc<dyn Session>> {
        let session = Arc::new(FakeSession {
            target: target.clone(),
            connected: AtomicBool::new(false),
            transport: self.clone(),
            last_timeout: Mutex::new(None),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct FakeSession {
    pub target: ResolvedTarget,
    pub connected: AtomicBool,
    transport: FakeTransport,
    pub last_timeout: Mutex<Option<Duration>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        *self.last_timeout.lock().unwrap() = timeout;
        if let Some(err) = self.transport.connect_error.lock().unwrap().take() {
            return Err(err);
        }
        // transport is up before credentials are checked
        self.connected.store(true, Ordering::SeqCst);
        if self.transport.reject_auth.load(Ordering::SeqCst) {
            return Err(TransportError::Authentication(self.target.to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn open_transfer_channel(
        &self,
        _timeout: Option<Duration>,
    ) -> Result<Box<dyn TransferChannel>> {
        if !self.is_connected() {
            return Err(TransportError::channel("session is down"));
        }
        if let Some(status) = self.transport.fail_next_channel.lock().unwrap().take() {
            return Err(TransportError::Channel {
                message: "subsystem request failed".into(),
                exit_status: Some(status),
            });
        }
        self.transport.channels_opened.fetch_add(1, Ordering::SeqCst);
        self.transport.channels_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel {
            fs: self.transport.fs.clone(),
            transport: self.transport.clone(),
            open: true,
        }))
    }

    async fn open_command_channel(&self, command: &str) -> Result<Box<dyn CommandChannel>> {
        if !self.is_connected() {
            return Err(TransportError::channel("session is down"));
        }
        let events = {
            let mut fs = self.transport.fs.lock().unwrap();
            fs.ops.push(Op::Exec(command.to_string()));
            (self.transport.script)(command, &mut fs)
        };
        Ok(Box::new(FakeCommandChannel {
            events: events.into(),
            hang: self.transport.hang_commands.load(Ordering::SeqCst),
            closed: self.transport.commands_closed.clone(),
        }))
    }
}

pub struct FakeChannel {
    fs: Arc<Mutex<FakeFs>>,
    transport: FakeTransport,
    open: bool,
}

impl FakeChannel {
    fn fs(&self) -> Result<std::sync::MutexGuard<'_, FakeFs>> {
        if !self.open {
            return Err(TransportError::channel("channel closed"));
        }
        Ok(self.fs.lock().unwrap())
    }
}

#[async_trait]
impl TransferChannel for FakeChannel {
    async fn stat(&mut self, path: &str) -> Result<RemoteAttributes> {
        if self.transport.fail_stat.load(Ordering::SeqCst) {
            return Err(failure("permission denied"));
        }
        let mut fs = self.fs()?;
        let path = normalize(path);
        fs.ops.push(Op::Stat(path.clone()));
        match fs.nodes.get(&path) {
            Some(Node::File(content)) => Ok(RemoteAttributes {
                size: content.len() as u64,
                modified: MODIFIED,
                is_dir: false,
            }),
            Some(Node::Dir) => Ok(RemoteAttributes {
                size: 4096,
                modified: MODIFIED,
                is_dir: true,
            }),
            None => Err(TransportError::NoSuchFile(path)),
        }
    }

    async fn read_dir(&mut self, path: &str) -> Result<Vec<String>> {
        let mut fs = self.fs()?;
        let path = normalize(path);
        fs.ops.push(Op::ReadDir(path.clone()));
        match fs.nodes.get(&path) {
            Some(Node::Dir) => {
                let mut names = vec![".".to_string(), "..".to_string()];
                names.extend(fs.children(&path));
                Ok(names)
            }
            Some(Node::File(_)) => Err(failure("not a directory")),
            None => Err(TransportError::NoSuchFile(path)),
        }
    }

    async fn create_dir(&mut self, path: &str) -> Result<()> {
        let mut fs = self.fs()?;
        let path = normalize(path);
        if fs.exists(&path) || !fs.parent_is_dir(&path) {
            return Err(failure("mkdir failed"));
        }
        fs.ops.push(Op::CreateDir(path.clone()));
        fs.nodes.insert(path, Node::Dir);
        Ok(())
    }

    async fn remove_dir(&mut self, path: &str) -> Result<()> {
        let mut fs = self.fs()?;
        let path = normalize(path);
        if !fs.is_dir(&path) || !fs.children(&path).is_empty() {
            return Err(failure("rmdir failed"));
        }
        fs.ops.push(Op::RemoveDir(path.clone()));
        fs.nodes.remove(&path);
        Ok(())
    }

    async fn remove_file(&mut self, path: &str) -> Result<()> {
        let mut fs = self.fs()?;
        let path = normalize(path);
        match fs.nodes.get(&path) {
            Some(Node::File(_)) => {
                fs.ops.push(Op::RemoveFile(path.clone()));
                fs.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(failure("is a directory")),
            None => Err(TransportError::NoSuchFile(path)),
        }
    }

    async fn open_read(&mut self, path: &str) -> Result<RemoteReader> {
        let mut fs = self.fs()?;
        let path = normalize(path);
        fs.ops.push(Op::OpenRead(path.clone()));
        match fs.nodes.get(&path) {
            Some(Node::File(content)) => Ok(Box::new(Cursor::new(content.clone()))),
            Some(Node::Dir) => Err(failure("is a directory")),
            None => Err(TransportError::NoSuchFile(path)),
        }
    }

    async fn open_write(&mut self, path: &str) -> Result<RemoteWriter> {
        if self.transport.fail_write.lock().unwrap().as_deref() == Some(path) {
            return Err(failure("disk full"));
        }
        let mut fs = self.fs()?;
        let path = normalize(path);
        if fs.is_dir(&path) || !fs.parent_is_dir(&path) {
            return Err(failure("open for write failed"));
        }
        fs.ops.push(Op::OpenWrite(path.clone()));
        fs.nodes.insert(path.clone(), Node::File(Vec::new()));
        Ok(Box::new(FakeWriter {
            fs: self.fs.clone(),
            path,
        }))
    }

    fn exit_status(&self) -> i32 {
        if self.open {
            -1
        } else {
            0
        }
    }

    async fn disconnect(&mut self) {
        if self.open {
            self.open = false;
            self.transport.channels_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct FakeWriter {
    fs: Arc<Mutex<FakeFs>>,
    path: String,
}

impl AsyncWrite for FakeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut fs = self.fs.lock().unwrap();
        if let Some(Node::File(content)) = fs.nodes.get_mut(&self.path) {
            content.extend_from_slice(buf);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct FakeCommandChannel {
    events: VecDeque<CommandEvent>,
    hang: bool,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandChannel for FakeCommandChannel {
    async fn next_event(&mut self) -> Option<CommandEvent> {
        tokio::task::yield_now().await;
        match self.events.pop_front() {
            Some(event) => Some(event),
            None if self.hang => std::future::pending().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        self.events.clear();
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn stdout(text: &str) -> CommandEvent {
    CommandEvent::Stdout(Bytes::copy_from_slice(text.as_bytes()))
}

pub fn stderr(text: &str) -> CommandEvent {
    CommandEvent::Stderr(Bytes::copy_from_slice(text.as_bytes()))
}

/// Lets the first `checks` cancellation checks pass, cancels every one after.
pub struct CancelAfter {
    remaining: AtomicUsize,
}

impl CancelAfter {
    pub fn new(checks: usize) -> Self {
        CancelAfter {
            remaining: AtomicUsize::new(checks),
        }
    }
}

impl ExecutionMonitor for CancelAfter {
    fn check_canceled(&self) -> Result<()> {
        let passed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if passed {
            Ok(())
        } else {
            Err(TransportError::Cancelled)
        }
    }
}

pub fn write_local_tree(root: &std::path::Path, files: &[(&str, &str)]) -> Vec<PathBuf> {
    files
        .iter()
        .map(|(relative, content)| {
            let path = root.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            path
        })
        .collect()
}
