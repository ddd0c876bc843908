//! Blocking entry point into the async core for foreign threads.
//!
//! Kernel filesystem drivers call back on their own threads and expect a
//! synchronous answer. [`SyncBridge::call_blocking`] spawns the submission
//! onto the tokio runtime and parks the calling thread on a oneshot that the
//! runtime signals exactly once. The calling thread holds no lock the core
//! needs while it waits.
//!
//! Never call it from a runtime worker thread: blocking there can starve the
//! very task that would complete the call.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{UfsError, UfsResult};
use crate::ops::{DirEntry, FileHandle, FileStat, OpenMode};
use crate::path::UfsPath;
use crate::scheduler::{Caller, SubmitOptions, UfsRequest, UfsResponse};

/// Statistics for bridge calls.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub operations_started: AtomicU64,
    pub operations_completed: AtomicU64,
    pub operations_failed: AtomicU64,
    pub operations_timed_out: AtomicU64,
    pub operations_rejected: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    fn record_result<T>(&self, result: &UfsResult<T>) {
        let counter = match result {
            Ok(_) => &self.operations_completed,
            Err(UfsError::Timeout) => &self.operations_timed_out,
            Err(UfsError::CoreShutdown) => &self.operations_rejected,
            Err(_) => &self.operations_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Synchronous adapter over a [`Caller`].
#[derive(Debug, Clone)]
pub struct SyncBridge {
    runtime: Handle,
    caller: Caller,
    timeout: Option<Duration>,
    stats: Arc<BridgeStats>,
}

impl SyncBridge {
    pub fn new(runtime: Handle, caller: Caller) -> Self {
        Self {
            runtime,
            caller,
            timeout: None,
            stats: BridgeStats::new(),
        }
    }

    /// Applies `timeout` as the deadline of every call, admission included.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Submits `request` and blocks until it completes.
    ///
    /// Fails with `CoreShutdown` without touching the runtime once the core
    /// is shutting down, and also if the runtime goes away mid-call.
    pub fn call_blocking(&self, request: UfsRequest) -> UfsResult<UfsResponse> {
        self.stats.record_start();
        if self.caller.is_shut_down() {
            let result = Err(UfsError::CoreShutdown);
            self.stats.record_result(&result);
            return result;
        }

        let verb = request.verb();
        let caller = self.caller.clone();
        let timeout = self.timeout;
        let options = SubmitOptions { deadline: timeout };
        let (tx, rx) = oneshot::channel();

        self.runtime.spawn(async move {
            let submit = caller.submit(request, options);
            let handle = match timeout {
                Some(t) => tokio::time::timeout(t, submit)
                    .await
                    .unwrap_or(Err(UfsError::Timeout)),
                None => submit.await,
            };
            let result = match handle {
                Ok(handle) => handle.await,
                Err(e) => Err(e),
            };
            // Receiver only disappears if the calling thread died.
            let _ = tx.send(result);
        });

        let result = rx.blocking_recv().unwrap_or(Err(UfsError::CoreShutdown));
        match &result {
            Ok(_) => trace!(verb, "Bridge call completed"),
            Err(e) => debug!(verb, error = %e, "Bridge call failed"),
        }
        self.stats.record_result(&result);
        result
    }

    pub fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        self.call_blocking(UfsRequest::Stat { path: path.clone() })?
            .into_stat()
    }

    pub fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        self.call_blocking(UfsRequest::List { path: path.clone() })?
            .into_entries()
    }

    pub fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        self.call_blocking(UfsRequest::Open {
            path: path.clone(),
            mode,
        })?
        .into_handle()
    }

    pub fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        self.call_blocking(UfsRequest::ReadAt { fh, offset, len })?
            .into_data()
    }

    pub fn write_at(&self, fh: FileHandle, offset: u64, data: Bytes) -> UfsResult<usize> {
        self.call_blocking(UfsRequest::WriteAt { fh, offset, data })?
            .into_written()
    }

    pub fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Truncate { fh, len })?
            .into_done()
    }

    pub fn flush(&self, fh: FileHandle) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Flush { fh })?.into_done()
    }

    pub fn close(&self, fh: FileHandle) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Close { fh })?.into_done()
    }

    pub fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Mkdir { path: path.clone() })?
            .into_done()
    }

    /// Creates a directory and returns its attributes in one call.
    pub fn mkdir_stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        self.call_blocking(UfsRequest::MkdirStat { path: path.clone() })?
            .into_stat()
    }

    /// Opens `path` and returns the handle with the file's attributes.
    pub fn create(
        &self,
        path: &UfsPath,
        mode: OpenMode,
        exclusive: bool,
    ) -> UfsResult<(FileHandle, FileStat)> {
        self.call_blocking(UfsRequest::Create {
            path: path.clone(),
            mode,
            exclusive,
        })?
        .into_created()
    }

    /// Sets the length of `path`, through `fh` if given, and returns the
    /// new attributes.
    pub fn resize(&self, path: &UfsPath, fh: Option<FileHandle>, len: u64) -> UfsResult<FileStat> {
        self.call_blocking(UfsRequest::Resize {
            path: path.clone(),
            fh,
            len,
        })?
        .into_stat()
    }

    pub fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Remove { path: path.clone() })?
            .into_done()
    }

    pub fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Rmdir { path: path.clone() })?
            .into_done()
    }

    pub fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Rename {
            from: from.clone(),
            to: to.clone(),
        })?
        .into_done()
    }

    pub fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        self.call_blocking(UfsRequest::Readlink { path: path.clone() })?
            .into_link()
    }

    pub fn symlink(&self, target: &str, link: &UfsPath) -> UfsResult<()> {
        self.call_blocking(UfsRequest::Symlink {
            target: target.to_string(),
            link: link.clone(),
        })?
        .into_done()
    }
}
