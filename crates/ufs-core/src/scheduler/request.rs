//! Request types for the async core.
//!
//! A submitted [`UfsRequest`] becomes a pending request owned by the
//! scheduler. The submitter keeps a [`RequestHandle`], which resolves
//! exactly once: with the backend's result, or with `Cancelled`, `Timeout`
//! or `CoreShutdown`.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::stats::SchedulerStats;
use crate::error::{UfsError, UfsResult};
use crate::ops::{DirEntry, FileHandle, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

/// Unique identifier for a request in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Atomic request ID generator.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a submitter. Ordering guarantees hold per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(pub u64);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// One operation of the contract, with owned arguments.
#[derive(Debug, Clone)]
pub enum UfsRequest {
    Stat { path: UfsPath },
    List { path: UfsPath },
    Open { path: UfsPath, mode: OpenMode },
    Seek { fh: FileHandle, pos: SeekFrom },
    Read { fh: FileHandle, len: usize },
    ReadAt { fh: FileHandle, offset: u64, len: usize },
    Write { fh: FileHandle, data: Bytes },
    WriteAt { fh: FileHandle, offset: u64, data: Bytes },
    Truncate { fh: FileHandle, len: u64 },
    Flush { fh: FileHandle },
    Close { fh: FileHandle },
    Mkdir { path: UfsPath },
    Remove { path: UfsPath },
    Rmdir { path: UfsPath },
    Rename { from: UfsPath, to: UfsPath },
    Readlink { path: UfsPath },
    Symlink { target: String, link: UfsPath },
    Copy { from: UfsPath, to: UfsPath },
    /// Creates a directory and returns its attributes.
    MkdirStat { path: UfsPath },
    /// Opens a file and returns the handle with the file's attributes.
    ///
    /// With `exclusive` set, fails with `AlreadyExists` if `path` exists.
    /// If the attributes cannot be read the handle is closed again.
    Create { path: UfsPath, mode: OpenMode, exclusive: bool },
    /// Sets the length of the file at `path` and returns its attributes.
    ///
    /// Goes through `fh` when given, otherwise through a short-lived handle.
    Resize { path: UfsPath, fh: Option<FileHandle>, len: u64 },
}

/// What a request is ordered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderingTarget {
    Path(UfsPath),
    Handle(FileHandle),
}

impl fmt::Display for OrderingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderingTarget::Path(path) => write!(f, "{path}"),
            OrderingTarget::Handle(fh) => write!(f, "{fh}"),
        }
    }
}

/// Requests with equal keys run one at a time, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderingKey {
    pub caller: CallerId,
    pub target: OrderingTarget,
}

impl UfsRequest {
    /// Short verb name, for logs.
    pub fn verb(&self) -> &'static str {
        match self {
            UfsRequest::Stat { .. } => "stat",
            UfsRequest::List { .. } => "list",
            UfsRequest::Open { .. } => "open",
            UfsRequest::Seek { .. } => "seek",
            UfsRequest::Read { .. } => "read",
            UfsRequest::ReadAt { .. } => "read_at",
            UfsRequest::Write { .. } => "write",
            UfsRequest::WriteAt { .. } => "write_at",
            UfsRequest::Truncate { .. } => "truncate",
            UfsRequest::Flush { .. } => "flush",
            UfsRequest::Close { .. } => "close",
            UfsRequest::Mkdir { .. } => "mkdir",
            UfsRequest::Remove { .. } => "remove",
            UfsRequest::Rmdir { .. } => "rmdir",
            UfsRequest::Rename { .. } => "rename",
            UfsRequest::Readlink { .. } => "readlink",
            UfsRequest::Symlink { .. } => "symlink",
            UfsRequest::Copy { .. } => "copy",
            UfsRequest::MkdirStat { .. } => "mkdir_stat",
            UfsRequest::Create { .. } => "create",
            UfsRequest::Resize { .. } => "resize",
        }
    }

    /// The path or handle this request is ordered against.
    ///
    /// Two-path verbs are keyed on their source. A resize through a handle
    /// is keyed on the handle.
    pub fn ordering_target(&self) -> OrderingTarget {
        match self {
            UfsRequest::Resize { fh: Some(fh), .. } => OrderingTarget::Handle(*fh),
            UfsRequest::Stat { path }
            | UfsRequest::MkdirStat { path }
            | UfsRequest::Create { path, .. }
            | UfsRequest::Resize { path, fh: None, .. }
            | UfsRequest::List { path }
            | UfsRequest::Open { path, .. }
            | UfsRequest::Mkdir { path }
            | UfsRequest::Remove { path }
            | UfsRequest::Rmdir { path }
            | UfsRequest::Readlink { path }
            | UfsRequest::Symlink { link: path, .. }
            | UfsRequest::Rename { from: path, .. }
            | UfsRequest::Copy { from: path, .. } => OrderingTarget::Path(path.clone()),
            UfsRequest::Seek { fh, .. }
            | UfsRequest::Read { fh, .. }
            | UfsRequest::ReadAt { fh, .. }
            | UfsRequest::Write { fh, .. }
            | UfsRequest::WriteAt { fh, .. }
            | UfsRequest::Truncate { fh, .. }
            | UfsRequest::Flush { fh }
            | UfsRequest::Close { fh } => OrderingTarget::Handle(*fh),
        }
    }

    pub(crate) fn ordering_key(&self, caller: CallerId) -> OrderingKey {
        OrderingKey {
            caller,
            target: self.ordering_target(),
        }
    }

    /// Runs this request against `fs`.
    pub async fn dispatch(self, fs: &dyn Ufs) -> UfsResult<UfsResponse> {
        Ok(match self {
            UfsRequest::Stat { path } => UfsResponse::Stat(fs.stat(&path).await?),
            UfsRequest::List { path } => UfsResponse::List(fs.list(&path).await?),
            UfsRequest::Open { path, mode } => UfsResponse::Opened(fs.open(&path, mode).await?),
            UfsRequest::Seek { fh, pos } => UfsResponse::Position(fs.seek(fh, pos).await?),
            UfsRequest::Read { fh, len } => UfsResponse::Data(fs.read(fh, len).await?),
            UfsRequest::ReadAt { fh, offset, len } => {
                UfsResponse::Data(fs.read_at(fh, offset, len).await?)
            }
            UfsRequest::Write { fh, data } => UfsResponse::Written(fs.write(fh, data).await?),
            UfsRequest::WriteAt { fh, offset, data } => {
                UfsResponse::Written(fs.write_at(fh, offset, data).await?)
            }
            UfsRequest::Truncate { fh, len } => {
                fs.truncate(fh, len).await?;
                UfsResponse::Done
            }
            UfsRequest::Flush { fh } => {
                fs.flush(fh).await?;
                UfsResponse::Done
            }
            UfsRequest::Close { fh } => {
                fs.close(fh).await?;
                UfsResponse::Done
            }
            UfsRequest::Mkdir { path } => {
                fs.mkdir(&path).await?;
                UfsResponse::Done
            }
            UfsRequest::Remove { path } => {
                fs.remove(&path).await?;
                UfsResponse::Done
            }
            UfsRequest::Rmdir { path } => {
                fs.rmdir(&path).await?;
                UfsResponse::Done
            }
            UfsRequest::Rename { from, to } => {
                fs.rename(&from, &to).await?;
                UfsResponse::Done
            }
            UfsRequest::Readlink { path } => UfsResponse::Link(fs.readlink(&path).await?),
            UfsRequest::Symlink { target, link } => {
                fs.symlink(&target, &link).await?;
                UfsResponse::Done
            }
            UfsRequest::Copy { from, to } => {
                fs.copy(&from, &to).await?;
                UfsResponse::Done
            }
            UfsRequest::MkdirStat { path } => {
                fs.mkdir(&path).await?;
                UfsResponse::Stat(fs.stat(&path).await?)
            }
            UfsRequest::Create {
                path,
                mode,
                exclusive,
            } => create(fs, &path, mode, exclusive).await?,
            UfsRequest::Resize { path, fh, len } => {
                resize(fs, &path, fh, len).await?;
                UfsResponse::Stat(fs.stat(&path).await?)
            }
        })
    }
}

async fn create(
    fs: &dyn Ufs,
    path: &UfsPath,
    mode: OpenMode,
    exclusive: bool,
) -> UfsResult<UfsResponse> {
    if exclusive {
        match fs.stat(path).await {
            Ok(_) => {
                return Err(UfsError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            Err(UfsError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    let fh = fs.open(path, mode).await?;
    match fs.stat(path).await {
        Ok(stat) => Ok(UfsResponse::Created(fh, stat)),
        Err(e) => {
            let _ = fs.close(fh).await;
            Err(e)
        }
    }
}

async fn resize(fs: &dyn Ufs, path: &UfsPath, fh: Option<FileHandle>, len: u64) -> UfsResult<()> {
    if let Some(fh) = fh {
        return fs.truncate(fh, len).await;
    }
    let fh = fs.open(path, OpenMode::read_write()).await?;
    let result = fs.truncate(fh, len).await;
    let closed = fs.close(fh).await;
    result.and(closed)
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UfsResponse {
    Stat(FileStat),
    List(Vec<DirEntry>),
    Opened(FileHandle),
    Created(FileHandle, FileStat),
    Position(u64),
    Data(Bytes),
    Written(usize),
    Link(Option<String>),
    Done,
}

fn mismatch(expected: &str, got: &UfsResponse) -> UfsError {
    UfsError::Backend(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("expected {expected} response, got {got:?}"),
    ))
}

impl UfsResponse {
    pub fn into_stat(self) -> UfsResult<FileStat> {
        match self {
            UfsResponse::Stat(stat) => Ok(stat),
            other => Err(mismatch("stat", &other)),
        }
    }

    pub fn into_entries(self) -> UfsResult<Vec<DirEntry>> {
        match self {
            UfsResponse::List(entries) => Ok(entries),
            other => Err(mismatch("list", &other)),
        }
    }

    pub fn into_handle(self) -> UfsResult<FileHandle> {
        match self {
            UfsResponse::Opened(fh) => Ok(fh),
            other => Err(mismatch("open", &other)),
        }
    }

    pub fn into_created(self) -> UfsResult<(FileHandle, FileStat)> {
        match self {
            UfsResponse::Created(fh, stat) => Ok((fh, stat)),
            other => Err(mismatch("create", &other)),
        }
    }

    pub fn into_position(self) -> UfsResult<u64> {
        match self {
            UfsResponse::Position(pos) => Ok(pos),
            other => Err(mismatch("seek", &other)),
        }
    }

    pub fn into_data(self) -> UfsResult<Bytes> {
        match self {
            UfsResponse::Data(data) => Ok(data),
            other => Err(mismatch("read", &other)),
        }
    }

    pub fn into_written(self) -> UfsResult<usize> {
        match self {
            UfsResponse::Written(n) => Ok(n),
            other => Err(mismatch("write", &other)),
        }
    }

    pub fn into_link(self) -> UfsResult<Option<String>> {
        match self {
            UfsResponse::Link(target) => Ok(target),
            other => Err(mismatch("readlink", &other)),
        }
    }

    pub fn into_done(self) -> UfsResult<()> {
        match self {
            UfsResponse::Done => Ok(()),
            other => Err(mismatch("unit", &other)),
        }
    }
}

/// Per-request submission options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Time allowed from submission to completion. Falls back to the
    /// scheduler's default deadline when unset.
    pub deadline: Option<Duration>,
}

impl SubmitOptions {
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Single-assignment result slot shared by the scheduler task and the handle.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    pub(crate) id: RequestId,
    reply: Mutex<Option<oneshot::Sender<UfsResult<UfsResponse>>>>,
    pub(crate) cancel: CancellationToken,
    started: AtomicBool,
    stats: Arc<SchedulerStats>,
}

impl RequestSlot {
    pub(crate) fn new(
        id: RequestId,
        reply: oneshot::Sender<UfsResult<UfsResponse>>,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            id,
            reply: Mutex::new(Some(reply)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stats,
        }
    }

    /// Completes the request. Only the first call has any effect.
    ///
    /// Returns `true` if this call delivered the result.
    pub(crate) fn finish(&self, result: UfsResult<UfsResponse>) -> bool {
        let Some(reply) = self.reply.lock().take() else {
            return false;
        };
        self.stats.record_outcome(&result);
        // The handle may already be gone; the outcome is still final.
        let _ = reply.send(result);
        true
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// The submitter's view of a pending request.
///
/// Awaiting the handle yields the request's single result. Dropping it does
/// not cancel the request.
#[derive(Debug)]
pub struct RequestHandle {
    pub(crate) slot: Arc<RequestSlot>,
    pub(crate) rx: oneshot::Receiver<UfsResult<UfsResponse>>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.slot.id
    }

    /// Returns true once the backend call for this request has begun.
    pub fn is_started(&self) -> bool {
        self.slot.is_started()
    }

    /// Cancels the request.
    ///
    /// A request that has not started is completed with `Cancelled` and never
    /// reaches the backend. A request already in flight also reports
    /// `Cancelled`; its backend call runs to completion and the result is
    /// discarded. Cancelling a completed request has no effect.
    pub fn cancel(&self) {
        self.slot.cancel.cancel();
        self.slot.finish(Err(UfsError::Cancelled));
    }

    /// Waits for the result.
    pub async fn wait(self) -> UfsResult<UfsResponse> {
        self.await
    }

    /// Blocks the current thread until the result is available.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_wait(self) -> UfsResult<UfsResponse> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(UfsError::CoreShutdown))
    }
}

impl Future for RequestHandle {
    type Output = UfsResult<UfsResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(UfsError::CoreShutdown)))
    }
}
