//! Logging decorator.
//!
//! [`Traced`] logs every call that passes through it: successes at `debug`,
//! failures at `warn`, with the verb, its target and the elapsed time as
//! structured fields.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Display;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::UfsResult;
use crate::ops::{Capabilities, DirEntry, FileHandle, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

#[derive(Debug)]
pub struct Traced {
    inner: Arc<dyn Ufs>,
    label: String,
}

impl Traced {
    pub fn new(inner: Arc<dyn Ufs>) -> Self {
        Self {
            inner,
            label: "ufs".to_string(),
        }
    }

    /// Sets the label attached to every log line.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn log<T>(&self, verb: &'static str, target: &dyn Display, started: Instant, result: &UfsResult<T>) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        match result {
            Ok(_) => debug!(fs = %self.label, verb, on = %target, elapsed_us, "ok"),
            Err(e) => warn!(fs = %self.label, verb, on = %target, elapsed_us, error = %e, "failed"),
        }
    }
}

struct Pair<'a>(&'a UfsPath, &'a UfsPath);

impl Display for Pair<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.0, self.1)
    }
}

#[async_trait]
impl Ufs for Traced {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn start(&self) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.start().await;
        self.log("start", &self.label, started, &result);
        result
    }

    async fn stop(&self) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.stop().await;
        self.log("stop", &self.label, started, &result);
        result
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        let started = Instant::now();
        let result = self.inner.stat(path).await;
        self.log("stat", path, started, &result);
        result
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        let started = Instant::now();
        let result = self.inner.list(path).await;
        self.log("list", path, started, &result);
        result
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        let started = Instant::now();
        let result = self.inner.open(path, mode).await;
        self.log("open", path, started, &result);
        result
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        let started = Instant::now();
        let result = self.inner.seek(fh, pos).await;
        self.log("seek", &fh, started, &result);
        result
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        let started = Instant::now();
        let result = self.inner.read(fh, len).await;
        self.log("read", &fh, started, &result);
        result
    }

    async fn write(&self, fh: FileHandle, data: Bytes) -> UfsResult<usize> {
        let started = Instant::now();
        let result = self.inner.write(fh, data).await;
        self.log("write", &fh, started, &result);
        result
    }

    async fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.truncate(fh, len).await;
        self.log("truncate", &fh, started, &result);
        result
    }

    async fn flush(&self, fh: FileHandle) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.flush(fh).await;
        self.log("flush", &fh, started, &result);
        result
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.close(fh).await;
        self.log("close", &fh, started, &result);
        result
    }

    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        let started = Instant::now();
        let result = self.inner.read_at(fh, offset, len).await;
        self.log("read_at", &fh, started, &result);
        result
    }

    async fn write_at(&self, fh: FileHandle, offset: u64, data: Bytes) -> UfsResult<usize> {
        let started = Instant::now();
        let result = self.inner.write_at(fh, offset, data).await;
        self.log("write_at", &fh, started, &result);
        result
    }

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.mkdir(path).await;
        self.log("mkdir", path, started, &result);
        result
    }

    async fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.remove(path).await;
        self.log("remove", path, started, &result);
        result
    }

    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.rmdir(path).await;
        self.log("rmdir", path, started, &result);
        result
    }

    async fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.rename(from, to).await;
        self.log("rename", &Pair(from, to), started, &result);
        result
    }

    async fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        let started = Instant::now();
        let result = self.inner.readlink(path).await;
        self.log("readlink", path, started, &result);
        result
    }

    async fn symlink(&self, target: &str, link: &UfsPath) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.symlink(target, link).await;
        self.log("symlink", link, started, &result);
        result
    }

    async fn copy(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        let started = Instant::now();
        let result = self.inner.copy(from, to).await;
        self.log("copy", &Pair(from, to), started, &result);
        result
    }
}
