//! Instrumented backends for tests.
//!
//! - [`RecordingFs`] logs every call that reaches it, so a test can assert
//!   that a decorator above it delegated nothing.
//! - [`LatencyFs`] delays calls by a scripted amount per target and records
//!   the order in which they finish.
//!
//! Both wrap another backend, usually a [`MemoryFs`](crate::MemoryFs).
//!
//! ```
//! use std::sync::Arc;
//! use ufs_core::testing::RecordingFs;
//! use ufs_core::{MemoryFs, Ufs, UfsPath};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let recording = RecordingFs::new(Arc::new(MemoryFs::new()));
//! recording.stat(&UfsPath::root()).await.unwrap();
//! assert_eq!(recording.call_count(), 1);
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::UfsResult;
use crate::ops::{Capabilities, DirEntry, FileHandle, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

/// One call observed by a test backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: &'static str,
    /// The path, handle (`fh-N`) or `from -> to` pair the call acted on.
    pub target: String,
}

impl Call {
    fn new(verb: &'static str, target: impl Display) -> Self {
        Self {
            verb,
            target: target.to_string(),
        }
    }
}

fn pair(from: &UfsPath, to: &UfsPath) -> String {
    format!("{from} -> {to}")
}

/// Records every call before delegating it.
#[derive(Debug)]
pub struct RecordingFs {
    inner: Arc<dyn Ufs>,
    calls: Mutex<Vec<Call>>,
    capabilities: Option<Capabilities>,
}

impl RecordingFs {
    pub fn new(inner: Arc<dyn Ufs>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            capabilities: None,
        }
    }

    /// Reports `capabilities` instead of the inner backend's.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls other than `readlink`, i.e. the ones a jail delegates after
    /// resolution succeeded.
    pub fn delegated_calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.verb != "readlink")
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, verb: &'static str, target: impl Display) {
        self.calls.lock().push(Call::new(verb, target));
    }
}

#[async_trait]
impl Ufs for RecordingFs {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
            .unwrap_or_else(|| self.inner.capabilities())
    }

    async fn start(&self) -> UfsResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> UfsResult<()> {
        self.inner.stop().await
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        self.record("stat", path);
        self.inner.stat(path).await
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        self.record("list", path);
        self.inner.list(path).await
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        self.record("open", path);
        self.inner.open(path, mode).await
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        self.record("seek", fh);
        self.inner.seek(fh, pos).await
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        self.record("read", fh);
        self.inner.read(fh, len).await
    }

    async fn write(&self, fh: FileHandle, data: Bytes) -> UfsResult<usize> {
        self.record("write", fh);
        self.inner.write(fh, data).await
    }

    async fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()> {
        self.record("truncate", fh);
        self.inner.truncate(fh, len).await
    }

    async fn flush(&self, fh: FileHandle) -> UfsResult<()> {
        self.record("flush", fh);
        self.inner.flush(fh).await
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        self.record("close", fh);
        self.inner.close(fh).await
    }

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.record("mkdir", path);
        self.inner.mkdir(path).await
    }

    async fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        self.record("remove", path);
        self.inner.remove(path).await
    }

    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.record("rmdir", path);
        self.inner.rmdir(path).await
    }

    async fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        self.record("rename", pair(from, to));
        self.inner.rename(from, to).await
    }

    async fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        self.record("readlink", path);
        self.inner.readlink(path).await
    }

    async fn symlink(&self, target: &str, link: &UfsPath) -> UfsResult<()> {
        self.record("symlink", link);
        self.inner.symlink(target, link).await
    }

    async fn copy(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        self.record("copy", pair(from, to));
        self.inner.copy(from, to).await
    }

    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        self.record("read_at", fh);
        self.inner.read_at(fh, offset, len).await
    }

    async fn write_at(&self, fh: FileHandle, offset: u64, data: Bytes) -> UfsResult<usize> {
        self.record("write_at", fh);
        self.inner.write_at(fh, offset, data).await
    }
}

/// Delays calls before delegating them.
///
/// Each target has a queue of scripted delays; a call pops the next one for
/// its target, or uses the default delay once the queue is empty. Targets
/// are spelled as [`Call::target`] spells them.
#[derive(Debug)]
pub struct LatencyFs {
    inner: Arc<dyn Ufs>,
    default_delay: Duration,
    scripted: Mutex<HashMap<String, VecDeque<Duration>>>,
    completed: Mutex<Vec<Call>>,
    started: AtomicUsize,
    started_notify: Notify,
    capabilities: Option<Capabilities>,
}

impl LatencyFs {
    pub fn new(inner: Arc<dyn Ufs>) -> Self {
        Self {
            inner,
            default_delay: Duration::ZERO,
            scripted: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            started_notify: Notify::new(),
            capabilities: None,
        }
    }

    /// Reports `capabilities` instead of the inner backend's.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Delay applied to calls with nothing scripted.
    #[must_use]
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Queues delays for the next calls on `target`.
    pub fn script(&self, target: impl Display, delays: impl IntoIterator<Item = Duration>) {
        self.scripted
            .lock()
            .entry(target.to_string())
            .or_default()
            .extend(delays);
    }

    /// Calls that finished, in completion order.
    pub fn completed(&self) -> Vec<Call> {
        self.completed.lock().clone()
    }

    /// Number of calls that reached this backend.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` calls have reached this backend.
    pub async fn wait_started(&self, n: usize) {
        loop {
            let notified = self.started_notify.notified();
            if self.started() >= n {
                return;
            }
            notified.await;
        }
    }

    fn next_delay(&self, target: &str) -> Duration {
        self.scripted
            .lock()
            .get_mut(target)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default_delay)
    }

    async fn delayed<T>(
        &self,
        verb: &'static str,
        target: impl Display + Send,
        call: impl Future<Output = T> + Send,
    ) -> T {
        let call_record = Call::new(verb, target);
        let delay = self.next_delay(&call_record.target);
        self.started.fetch_add(1, Ordering::SeqCst);
        self.started_notify.notify_waiters();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = call.await;
        self.completed.lock().push(call_record);
        result
    }
}

#[async_trait]
impl Ufs for LatencyFs {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
            .unwrap_or_else(|| self.inner.capabilities())
    }

    async fn start(&self) -> UfsResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> UfsResult<()> {
        self.inner.stop().await
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        self.delayed("stat", path, self.inner.stat(path)).await
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        self.delayed("list", path, self.inner.list(path)).await
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        self.delayed("open", path, self.inner.open(path, mode)).await
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        self.delayed("seek", fh, self.inner.seek(fh, pos)).await
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        self.delayed("read", fh, self.inner.read(fh, len)).await
    }

    async fn write(&self, fh: FileHandle, data: Bytes) -> UfsResult<usize> {
        self.delayed("write", fh, self.inner.write(fh, data)).await
    }

    async fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()> {
        self.delayed("truncate", fh, self.inner.truncate(fh, len)).await
    }

    async fn flush(&self, fh: FileHandle) -> UfsResult<()> {
        self.delayed("flush", fh, self.inner.flush(fh)).await
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        self.delayed("close", fh, self.inner.close(fh)).await
    }

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.delayed("mkdir", path, self.inner.mkdir(path)).await
    }

    async fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        self.delayed("remove", path, self.inner.remove(path)).await
    }

    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.delayed("rmdir", path, self.inner.rmdir(path)).await
    }

    async fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        self.delayed("rename", pair(from, to), self.inner.rename(from, to))
            .await
    }

    async fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        self.delayed("readlink", path, self.inner.readlink(path)).await
    }

    async fn symlink(&self, target: &str, link: &UfsPath) -> UfsResult<()> {
        self.delayed("symlink", link, self.inner.symlink(target, link))
            .await
    }

    async fn copy(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        self.delayed("copy", pair(from, to), self.inner.copy(from, to))
            .await
    }

    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        self.delayed("read_at", fh, self.inner.read_at(fh, offset, len))
            .await
    }

    async fn write_at(&self, fh: FileHandle, offset: u64, data: Bytes) -> UfsResult<usize> {
        self.delayed("write_at", fh, self.inner.write_at(fh, offset, data))
            .await
    }
}
