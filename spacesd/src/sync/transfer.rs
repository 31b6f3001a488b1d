use std::{
    fs, io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::paths::{is_transfer_tmp, transfer_tmp_path};

pub const DEFAULT_CHUNK_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("source changed during transfer")]
    SourceModified,
    #[error("source is not a regular file: {0}")]
    NotAFile(PathBuf),
}

/// Metadata snapshot of one path on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub ino: u64,
    pub size: u64,
    pub modified_ns: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileStamp {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            ino: meta.ino(),
            size: meta.len(),
            modified_ns: meta
                .mtime()
                .saturating_mul(1_000_000_000)
                .saturating_add(meta.mtime_nsec()),
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
        }
    }

    pub fn modified_time(&self) -> SystemTime {
        match u64::try_from(self.modified_ns) {
            Ok(ns) => UNIX_EPOCH + Duration::from_nanos(ns),
            Err(_) => UNIX_EPOCH,
        }
    }

    fn same_content_stamp(&self, other: &Self) -> bool {
        self.ino == other.ino && self.size == other.size && self.modified_ns == other.modified_ns
    }
}

/// Stats `path` without following a final symlink, mapping "not found" to
/// `None`.
pub async fn stat(path: &Path) -> io::Result<Option<FileStamp>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(FileStamp::from_metadata(&meta))),
        Err(err) if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub chunk_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    AlreadyAbsent,
    /// Directory still has children; retried once they are gone.
    Deferred,
}

/// A fully written temp file next to its destination, not yet visible.
#[derive(Debug)]
pub struct StagedCopy {
    tmp: Option<PathBuf>,
    source: PathBuf,
    target: PathBuf,
    source_stamp: FileStamp,
}

impl StagedCopy {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn source_stamp(&self) -> FileStamp {
        self.source_stamp
    }

    /// Drops the temp file without touching the destination.
    pub async fn discard(mut self) {
        if let Some(tmp) = self.tmp.take() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }
}

impl Drop for StagedCopy {
    fn drop(&mut self) {
        if let Some(tmp) = self.tmp.take() {
            let _ = fs::remove_file(tmp);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SafeCopy {
    config: TransferConfig,
}

impl SafeCopy {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: TransferConfig {
                chunk_bytes: config.chunk_bytes.max(1),
            },
        }
    }

    /// Streams `source` into `<target>.sync-tmp`, polling `cancel` before each
    /// chunk.
    pub async fn stage(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<StagedCopy, TransferError> {
        let before = match stat(source).await? {
            Some(stamp) if stamp.is_dir || stamp.is_symlink => {
                return Err(TransferError::NotAFile(source.to_path_buf()));
            }
            Some(stamp) => stamp,
            None => return Err(TransferError::SourceModified),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = transfer_tmp_path(target);
        let staged = StagedCopy {
            tmp: Some(tmp.clone()),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            source_stamp: before,
        };

        // `staged` removes the temp file on every early return below.
        self.write_chunks(source, &tmp, cancel).await?;
        Ok(staged)
    }

    async fn write_chunks(
        &self,
        source: &Path,
        tmp: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut reader = match tokio::fs::File::open(source).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::SourceModified);
            }
            Err(err) => return Err(err.into()),
        };
        let mut writer = tokio::fs::File::create(tmp).await?;
        let mut buf = vec![0u8; self.config.chunk_bytes];
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            writer.write_all(&buf[..read]).await?;
        }
        writer.flush().await?;
        writer.sync_all().await?;
        Ok(())
    }

    /// Re-checks the source against the stamp taken before staging, then
    /// stamps the temp file with the source mtime, fsyncs it and renames it
    /// over the destination. Returns the destination's stamp.
    pub async fn commit(&self, mut staged: StagedCopy) -> Result<FileStamp, TransferError> {
        let Some(tmp) = staged.tmp.clone() else {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "staged copy already consumed",
            )));
        };
        let unchanged = stat(&staged.source)
            .await?
            .is_some_and(|after| after.same_content_stamp(&staged.source_stamp));
        if !unchanged {
            staged.discard().await;
            return Err(TransferError::SourceModified);
        }
        let modified = staged.source_stamp.modified_time();
        let stamp_path = tmp.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let file = fs::OpenOptions::new().write(true).open(&stamp_path)?;
            file.set_modified(modified)?;
            file.sync_all()
        })
        .await
        .map_err(io::Error::other)??;

        tokio::fs::rename(&tmp, &staged.target).await?;
        staged.tmp = None;

        stat(&staged.target)
            .await?
            .ok_or_else(|| TransferError::Io(io::Error::from(io::ErrorKind::NotFound)))
    }

    pub async fn ensure_dir(&self, target: &Path) -> Result<FileStamp, TransferError> {
        tokio::fs::create_dir_all(target).await?;
        stat(target)
            .await?
            .ok_or_else(|| TransferError::Io(io::Error::from(io::ErrorKind::NotFound)))
    }

    pub async fn remove(&self, target: &Path) -> Result<RemoveOutcome, TransferError> {
        let meta = match tokio::fs::symlink_metadata(target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(RemoveOutcome::AlreadyAbsent);
            }
            Err(err) => return Err(err.into()),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir(target).await
        } else {
            tokio::fs::remove_file(target).await
        };
        match result {
            Ok(()) => Ok(RemoveOutcome::Removed),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(RemoveOutcome::AlreadyAbsent),
            Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => {
                Ok(RemoveOutcome::Deferred)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Renames `from` to `to` inside one tree. Returns false when `from` is gone.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<bool, TransferError> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Deletes every leftover transfer temp file below `root`.
pub fn sweep_tmp_files(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
            } else if is_transfer_tmp(&path) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
        }
    }
    Ok(removed)
}

/// Every file and directory below `root`, as absolute paths, parents first.
pub fn walk_tree(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if is_transfer_tmp(&path) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                children.push(path.clone());
            }
            out.push(path);
        }
        children.sort();
        stack.extend(children.into_iter().rev());
    }
    Ok(out)
}
