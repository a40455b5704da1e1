use async_trait::async_trait;
use russh_sftp::{client::SftpSession, protocol::OpenFlags};

use crate::{
    channel::UNSTARTED_EXIT_STATUS,
    error::{Result, TransportError},
    transport::{RemoteAttributes, RemoteReader, RemoteWriter, TransferChannel},
};

pub(super) struct RusshTransferChannel {
    sftp: Option<SftpSession>,
    exit_status: i32,
}

impl RusshTransferChannel {
    pub(super) fn new(sftp: SftpSession) -> Self {
        RusshTransferChannel {
            sftp: Some(sftp),
            exit_status: UNSTARTED_EXIT_STATUS,
        }
    }

    fn sftp(&self) -> Result<&SftpSession> {
        self.sftp
            .as_ref()
            .ok_or_else(|| TransportError::channel("transfer channel is disconnected"))
    }
}

#[async_trait]
impl TransferChannel for RusshTransferChannel {
    async fn stat(&mut self, path: &str) -> Result<RemoteAttributes> {
        let metadata = self.sftp()?.metadata(path).await.map_err(|err| wrap_err(path, err))?;
        Ok(RemoteAttributes {
            size: metadata.size.unwrap_or(0),
            modified: metadata.mtime.map(i64::from).unwrap_or(0),
            is_dir: metadata.is_dir(),
        })
    }

    async fn read_dir(&mut self, path: &str) -> Result<Vec<String>> {
        let entries = self.sftp()?.read_dir(path).await.map_err(|err| wrap_err(path, err))?;
        let mut names: Vec<String> = entries.map(|entry| entry.file_name()).collect();
        for pseudo in ["..", "."] {
            if !names.iter().any(|name| name == pseudo) {
                names.insert(0, pseudo.to_string());
            }
        }
        Ok(names)
    }

    async fn create_dir(&mut self, path: &str) -> Result<()> {
        self.sftp()?.create_dir(path).await.map_err(|err| wrap_err(path, err))
    }

    async fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.sftp()?.remove_dir(path).await.map_err(|err| wrap_err(path, err))
    }

    async fn remove_file(&mut self, path: &str) -> Result<()> {
        self.sftp()?.remove_file(path).await.map_err(|err| wrap_err(path, err))
    }

    async fn open_read(&mut self, path: &str) -> Result<RemoteReader> {
        let file = self
            .sftp()?
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|err| wrap_err(path, err))?;
        Ok(Box::new(file))
    }

    async fn open_write(&mut self, path: &str) -> Result<RemoteWriter> {
        let file = self
            .sftp()?
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|err| wrap_err(path, err))?;
        Ok(Box::new(file))
    }

    fn exit_status(&self) -> i32 {
        self.exit_status
    }

    async fn disconnect(&mut self) {
        if let Some(sftp) = self.sftp.take() {
            let _ = sftp.close().await;
            self.exit_status = 0;
        }
    }
}

fn wrap_err(path: &str, err: russh_sftp::client::error::Error) -> TransportError {
    match TransportError::from(err) {
        TransportError::NoSuchFile(_) => TransportError::NoSuchFile(path.to_string()),
        other => other,
    }
}
