//! Whole-tree upload, download and delete over one open transfer channel.
//!
//! Every visited entry is a cancellation point. A cancelled or failed operation
//! leaves whatever was already transferred in place.

use std::path::{Path, PathBuf};

use tokio::{
    fs,
    io::{self, AsyncWriteExt},
};
use tracing::{debug, trace};

use crate::{
    error::{Result, TransportError},
    monitor::ExecutionMonitor,
    transport::{is_pseudo_entry, join_remote, parent_remote, TransferChannel},
};

/// Copies a local file, or a local directory tree, to `remote_dest`.
pub async fn upload(
    channel: &mut dyn TransferChannel,
    local: &Path,
    remote_dest: &str,
    monitor: &dyn ExecutionMonitor,
) -> Result<()> {
    let mut pending = vec![(local.to_path_buf(), remote_dest.to_string())];

    while let Some((local, remote)) = pending.pop() {
        monitor.check_canceled()?;
        let metadata = fs::metadata(&local).await?;
        if !metadata.is_dir() {
            upload_file(channel, &local, &remote).await?;
            monitor.report_progress(&format!("uploaded {}", local.display()));
            continue;
        }

        ensure_dir(channel, &remote).await?;
        let children = list_local_dir(&local).await;
        for (child, name) in children.into_iter().rev() {
            pending.push((child, join_remote(&remote, &name)));
        }
    }

    Ok(())
}

/// Copies a remote file, or a remote directory tree, to `local_dest`.
pub async fn download(
    channel: &mut dyn TransferChannel,
    remote_src: &str,
    local_dest: &Path,
    monitor: &dyn ExecutionMonitor,
) -> Result<()> {
    let mut pending = vec![(remote_src.to_string(), local_dest.to_path_buf())];

    while let Some((remote, local)) = pending.pop() {
        monitor.check_canceled()?;
        let names = match channel.read_dir(&remote).await {
            Ok(names) => names,
            Err(_) => {
                download_file(channel, &remote, &local).await?;
                monitor.report_progress(&format!("downloaded {remote}"));
                continue;
            }
        };

        prepare_local_dir(&local).await?;
        for name in names.into_iter().filter(|name| !is_pseudo_entry(name)).rev() {
            let child_local = local.join(&name);
            pending.push((join_remote(&remote, &name), child_local));
        }
    }

    Ok(())
}

enum DeleteStep {
    Visit(String),
    RemoveDir(String),
}

/// Removes a remote file, or a remote directory with everything below it.
pub async fn delete(
    channel: &mut dyn TransferChannel,
    remote: &str,
    monitor: &dyn ExecutionMonitor,
) -> Result<()> {
    let mut pending = vec![DeleteStep::Visit(remote.to_string())];

    while let Some(step) = pending.pop() {
        match step {
            DeleteStep::Visit(path) => {
                monitor.check_canceled()?;
                let attributes = channel.stat(&path).await?;
                if !attributes.is_dir {
                    trace!(path = %path, "removing remote file");
                    channel.remove_file(&path).await?;
                    continue;
                }

                let names = channel.read_dir(&path).await?;
                pending.push(DeleteStep::RemoveDir(path.clone()));
                for name in names.into_iter().filter(|name| !is_pseudo_entry(name)) {
                    pending.push(DeleteStep::Visit(join_remote(&path, &name)));
                }
            }
            DeleteStep::RemoveDir(path) => {
                trace!(path = %path, "removing remote directory");
                channel.remove_dir(&path).await?;
            }
        }
    }

    Ok(())
}

/// `mkdir -p` for a remote path.
pub async fn ensure_dir(channel: &mut dyn TransferChannel, remote: &str) -> Result<()> {
    match channel.stat(remote).await {
        Ok(attributes) if attributes.is_dir => return Ok(()),
        Ok(_) => return Err(TransportError::ExistsNotDirectory(remote.to_string())),
        Err(TransportError::NoSuchFile(_)) => {}
        Err(err) => return Err(err),
    }

    // (directory, parent known to exist)
    let mut pending = vec![(remote.to_string(), false)];
    while let Some((dir, parent_ready)) = pending.pop() {
        let err = match channel.create_dir(&dir).await {
            Ok(()) => {
                debug!(path = %dir, "created remote directory");
                continue;
            }
            Err(err) => err,
        };
        if parent_ready {
            return Err(err);
        }

        let parent =
            parent_remote(&dir).ok_or_else(|| TransportError::CreateDirectory(dir.clone()))?;
        match channel.stat(parent).await {
            Ok(attributes) if attributes.is_dir => pending.push((dir, true)),
            Ok(_) => return Err(TransportError::ExistsNotDirectory(parent.to_string())),
            Err(TransportError::NoSuchFile(_)) => {
                let parent = parent.to_string();
                pending.push((dir, true));
                pending.push((parent, false));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

async fn upload_file(channel: &mut dyn TransferChannel, local: &Path, remote: &str) -> Result<()> {
    trace!(local = %local.display(), remote = %remote, "uploading file");
    let mut source = fs::File::open(local).await?;
    let mut sink = channel.open_write(remote).await?;
    io::copy(&mut source, &mut sink).await?;
    sink.shutdown().await?;
    Ok(())
}

async fn download_file(
    channel: &mut dyn TransferChannel,
    remote: &str,
    local: &Path,
) -> Result<()> {
    trace!(remote = %remote, local = %local.display(), "downloading file");
    let mut source = channel.open_read(remote).await?;
    let mut sink = fs::File::create(local).await?;
    io::copy(&mut source, &mut sink).await?;
    sink.flush().await?;
    Ok(())
}

async fn prepare_local_dir(local: &Path) -> Result<()> {
    match fs::metadata(local).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(TransportError::ExistsNotDirectory(local.display().to_string())),
        Err(_) => fs::create_dir(local)
            .await
            .map_err(|_| TransportError::CreateLocalDirectory(local.display().to_string())),
    }
}

/// Children of a local directory. An unreadable directory has none.
async fn list_local_dir(local: &Path) -> Vec<(PathBuf, String)> {
    let mut entries = Vec::new();
    let Ok(mut read_dir) = fs::read_dir(local).await else {
        return entries;
    };
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((entry.path(), name));
    }
    entries.sort_by(|a, b| a.1.cmp(&b.1));
    entries
}
