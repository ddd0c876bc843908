//! Decorator that refuses every mutation.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::sync::Arc;

use crate::error::{UfsError, UfsResult};
use crate::ops::{Capabilities, DirEntry, FileHandle, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

/// Passes lookups and reads through; mutations fail with
/// [`UfsError::ReadOnly`] without reaching the wrapped backend.
#[derive(Debug)]
pub struct ReadOnly {
    inner: Arc<dyn Ufs>,
}

impl ReadOnly {
    pub fn new(inner: Arc<dyn Ufs>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Ufs for ReadOnly {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn start(&self) -> UfsResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> UfsResult<()> {
        self.inner.stop().await
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        self.inner.stat(path).await
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        self.inner.list(path).await
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        if mode.is_mutating() {
            return Err(UfsError::ReadOnly);
        }
        self.inner.open(path, mode).await
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        self.inner.seek(fh, pos).await
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        self.inner.read(fh, len).await
    }

    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        self.inner.read_at(fh, offset, len).await
    }

    async fn write(&self, _fh: FileHandle, _data: Bytes) -> UfsResult<usize> {
        Err(UfsError::ReadOnly)
    }

    async fn write_at(&self, _fh: FileHandle, _offset: u64, _data: Bytes) -> UfsResult<usize> {
        Err(UfsError::ReadOnly)
    }

    async fn truncate(&self, _fh: FileHandle, _len: u64) -> UfsResult<()> {
        Err(UfsError::ReadOnly)
    }

    async fn flush(&self, fh: FileHandle) -> UfsResult<()> {
        self.inner.flush(fh).await
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        self.inner.close(fh).await
    }

    async fn mkdir(&self, _path: &UfsPath) -> UfsResult<()> {
        Err(UfsError::ReadOnly)
    }

    async fn remove(&self, _path: &UfsPath) -> UfsResult<()> {
        Err(UfsError::ReadOnly)
    }

    async fn rmdir(&self, _path: &UfsPath) -> UfsResult<()> {
        Err(UfsError::ReadOnly)
    }

    async fn rename(&self, _from: &UfsPath, _to: &UfsPath) -> UfsResult<()> {
        Err(UfsError::ReadOnly)
    }

    async fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        self.inner.readlink(path).await
    }

    async fn symlink(&self, _target: &str, _link: &UfsPath) -> UfsResult<()> {
        Err(UfsError::ReadOnly)
    }

    async fn copy(&self, _from: &UfsPath, _to: &UfsPath) -> UfsResult<()> {
        Err(UfsError::ReadOnly)
    }
}
