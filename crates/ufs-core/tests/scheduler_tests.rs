//! Ordering, cancellation, deadline and shutdown behaviour of the async core.

mod common;

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{latency_memory, p};
use ufs_core::scheduler::{Scheduler, SchedulerConfig, SubmitOptions, UfsRequest};
use ufs_core::{
    DirEntry, FileHandle, FileStat, MemoryFs, OpenMode, Ufs, UfsError, UfsPath, UfsResult,
};

const SLOW: Duration = Duration::from_millis(200);

fn opts() -> SubmitOptions {
    SubmitOptions::default()
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn same_caller_same_path_completes_in_submission_order() {
    let fs = latency_memory();
    fs.script("/dir", [SLOW]);
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());
    let caller = scheduler.caller();

    let mkdir = caller
        .submit(UfsRequest::Mkdir { path: p("/dir") }, opts())
        .await
        .unwrap();
    let stat = caller
        .submit(UfsRequest::Stat { path: p("/dir") }, opts())
        .await
        .unwrap();

    // The stat is fast but must not overtake the slow mkdir.
    let stat = stat.await.unwrap().into_stat().unwrap();
    assert!(stat.is_dir());
    mkdir.await.unwrap();

    let order: Vec<_> = fs.completed().into_iter().map(|c| c.verb).collect();
    assert_eq!(order, vec!["mkdir", "stat"]);
    assert_eq!(scheduler.stats().snapshot().waited_for_order, 1);
}

#[tokio::test(start_paused = true)]
async fn same_handle_writes_apply_in_order() {
    let fs = latency_memory();
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());
    let caller = scheduler.caller();

    let fh = caller
        .submit(
            UfsRequest::Open {
                path: p("/f"),
                mode: OpenMode::read_write().with_create(true),
            },
            opts(),
        )
        .await
        .unwrap()
        .await
        .unwrap()
        .into_handle()
        .unwrap();
    fs.script(fh, [SLOW, Duration::ZERO]);

    let w1 = caller
        .submit(
            UfsRequest::WriteAt {
                fh,
                offset: 0,
                data: Bytes::from_static(b"aaaa"),
            },
            opts(),
        )
        .await
        .unwrap();
    let w2 = caller
        .submit(
            UfsRequest::WriteAt {
                fh,
                offset: 0,
                data: Bytes::from_static(b"bb"),
            },
            opts(),
        )
        .await
        .unwrap();
    w2.await.unwrap();
    w1.await.unwrap();

    let data = fs.read_at(fh, 0, 16).await.unwrap();
    assert_eq!(&data[..], b"bbaa");
}

#[tokio::test(start_paused = true)]
async fn distinct_paths_may_complete_out_of_order() {
    let fs = latency_memory();
    fs.script("/slow", [SLOW]);
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());
    let caller = scheduler.caller();

    let slow = caller
        .submit(UfsRequest::Mkdir { path: p("/slow") }, opts())
        .await
        .unwrap();
    let fast = caller
        .submit(UfsRequest::Mkdir { path: p("/fast") }, opts())
        .await
        .unwrap();
    fast.await.unwrap();
    slow.await.unwrap();

    let order: Vec<_> = fs.completed().into_iter().map(|c| c.target).collect();
    assert_eq!(order, vec!["/fast", "/slow"]);
}

#[tokio::test(start_paused = true)]
async fn different_callers_are_not_ordered() {
    let fs = latency_memory();
    fs.script("/", [SLOW]);
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());

    let slow = scheduler
        .caller()
        .submit(UfsRequest::List { path: p("/") }, opts())
        .await
        .unwrap();
    let fast = scheduler
        .caller()
        .submit(UfsRequest::Stat { path: p("/") }, opts())
        .await
        .unwrap();
    fast.await.unwrap();
    assert!(!fs.completed().iter().any(|c| c.verb == "list"));
    slow.await.unwrap();
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancel_before_start_never_reaches_backend() {
    let fs = latency_memory();
    fs.script("/a", [SLOW]);
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());
    let caller = scheduler.caller();

    let blocker = caller
        .submit(UfsRequest::Mkdir { path: p("/a") }, opts())
        .await
        .unwrap();
    let queued = caller
        .submit(UfsRequest::Rmdir { path: p("/a") }, opts())
        .await
        .unwrap();
    assert!(!queued.is_started());
    queued.cancel();

    assert!(matches!(queued.await, Err(UfsError::Cancelled)));
    blocker.await.unwrap();

    // Drain, then check the rmdir never ran.
    scheduler.shutdown().await.unwrap();
    assert_eq!(fs.started(), 1);
    assert!(fs.stat(&p("/a")).await.unwrap().is_dir());
    assert_eq!(scheduler.stats().snapshot().cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_in_flight_reports_cancelled() {
    let fs = latency_memory();
    fs.script("/b", [SLOW]);
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());
    let caller = scheduler.caller();

    let handle = caller
        .submit(UfsRequest::Mkdir { path: p("/b") }, opts())
        .await
        .unwrap();
    fs.wait_started(1).await;
    handle.cancel();
    assert!(matches!(handle.await, Err(UfsError::Cancelled)));
    assert!(fs.completed().is_empty());

    // The backend call still runs to completion, and the key is released
    // only after it did.
    let stat = caller
        .submit(UfsRequest::Stat { path: p("/b") }, opts())
        .await
        .unwrap()
        .await
        .unwrap()
        .into_stat()
        .unwrap();
    assert!(stat.is_dir());
    let order: Vec<_> = fs.completed().into_iter().map(|c| c.verb).collect();
    assert_eq!(order, ["mkdir", "stat"]);
}

#[tokio::test]
async fn cancel_after_completion_keeps_result() {
    let fs = latency_memory();
    let scheduler = Scheduler::new(fs, SchedulerConfig::default());
    let handle = scheduler
        .caller()
        .submit(UfsRequest::Stat { path: p("/") }, opts())
        .await
        .unwrap();
    while scheduler.stats().snapshot().completed == 0 {
        tokio::task::yield_now().await;
    }
    handle.cancel();
    assert!(handle.await.is_ok());
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn deadline_expires_in_flight() {
    let fs = latency_memory();
    fs.script("/", [Duration::from_secs(10)]);
    let scheduler = Scheduler::new(fs, SchedulerConfig::default());

    let result = scheduler
        .caller()
        .submit(
            UfsRequest::Stat { path: p("/") },
            opts().with_deadline(Duration::from_millis(50)),
        )
        .await
        .unwrap()
        .await;
    assert!(matches!(result, Err(UfsError::Timeout)));
    assert_eq!(scheduler.stats().snapshot().timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn default_deadline_applies_while_queued() {
    let fs = latency_memory();
    fs.script("/", [Duration::from_secs(10)]);
    let scheduler = Scheduler::new(
        fs.clone(),
        SchedulerConfig::default().with_default_deadline(Duration::from_secs(1)),
    );
    let caller = scheduler.caller();

    let first = caller
        .submit(UfsRequest::List { path: p("/") }, opts())
        .await
        .unwrap();
    let second = caller
        .submit(UfsRequest::Stat { path: p("/") }, opts())
        .await
        .unwrap();

    assert!(matches!(second.await, Err(UfsError::Timeout)));
    assert!(matches!(first.await, Err(UfsError::Timeout)));
    assert_eq!(fs.started(), 1);
}

// ============================================================================
// Backpressure and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn submit_waits_when_in_flight_limit_reached() {
    let fs = latency_memory();
    fs.script("/", [SLOW]);
    let scheduler = Scheduler::new(fs, SchedulerConfig::default().with_max_in_flight(1));
    let caller = scheduler.caller();

    let first = caller
        .submit(UfsRequest::List { path: p("/") }, opts())
        .await
        .unwrap();

    let blocked = tokio::time::timeout(
        Duration::from_millis(10),
        caller.submit(UfsRequest::Mkdir { path: p("/x") }, opts()),
    )
    .await;
    assert!(blocked.is_err(), "second submit should wait for a permit");

    first.await.unwrap();
    let second = caller
        .submit(UfsRequest::Mkdir { path: p("/x") }, opts())
        .await
        .unwrap();
    second.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_queued_and_drains_running() {
    let fs = latency_memory();
    fs.script("/a", [SLOW]);
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default());
    let caller = scheduler.caller();

    let running = caller
        .submit(UfsRequest::Mkdir { path: p("/a") }, opts())
        .await
        .unwrap();
    let queued = caller
        .submit(UfsRequest::Stat { path: p("/a") }, opts())
        .await
        .unwrap();
    fs.wait_started(1).await;

    scheduler.shutdown().await.unwrap();

    assert!(running.await.is_ok());
    assert!(matches!(queued.await, Err(UfsError::CoreShutdown)));
    assert_eq!(fs.started(), 1);
    assert!(matches!(
        caller
            .submit(UfsRequest::Stat { path: p("/") }, opts())
            .await,
        Err(UfsError::CoreShutdown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_callers_many_paths() {
    let fs = latency_memory();
    let scheduler = Scheduler::new(fs.clone(), SchedulerConfig::default().with_max_in_flight(8));

    let mut tasks = Vec::new();
    for c in 0..8 {
        let caller = scheduler.caller();
        tasks.push(tokio::spawn(async move {
            let dir = p(&format!("/c{c}"));
            caller
                .submit(UfsRequest::Mkdir { path: dir.clone() }, SubmitOptions::default())
                .await
                .unwrap()
                .await
                .unwrap();
            for i in 0..20 {
                let path = dir.join(&format!("d{i}")).unwrap();
                caller
                    .submit(UfsRequest::Mkdir { path: path.clone() }, SubmitOptions::default())
                    .await
                    .unwrap();
                caller
                    .submit(UfsRequest::Rmdir { path }, SubmitOptions::default())
                    .await
                    .unwrap()
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    scheduler.shutdown().await.unwrap();

    let snap = scheduler.stats().snapshot();
    assert_eq!(snap.submitted, 8 * 41);
    assert_eq!(snap.failed, 0);
    assert_eq!(snap.in_flight, 0);
    for c in 0..8 {
        assert!(fs.list(&p(&format!("/c{c}"))).await.unwrap().is_empty());
    }
}

// ============================================================================
// Backend panics
// ============================================================================

/// Memory backend whose `truncate` panics.
#[derive(Debug, Default)]
struct PanicOnTruncate {
    inner: MemoryFs,
}

#[async_trait]
impl Ufs for PanicOnTruncate {
    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        self.inner.stat(path).await
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        self.inner.list(path).await
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        self.inner.open(path, mode).await
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        self.inner.seek(fh, pos).await
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        self.inner.read(fh, len).await
    }

    async fn write(&self, fh: FileHandle, data: Bytes) -> UfsResult<usize> {
        self.inner.write(fh, data).await
    }

    async fn truncate(&self, _fh: FileHandle, len: u64) -> UfsResult<()> {
        panic!("cannot truncate to {len}");
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        self.inner.close(fh).await
    }

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.inner.mkdir(path).await
    }

    async fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        self.inner.remove(path).await
    }

    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        self.inner.rmdir(path).await
    }
}

#[tokio::test]
async fn backend_panic_completes_request_and_frees_its_key() {
    let scheduler = Scheduler::new(Arc::new(PanicOnTruncate::default()), SchedulerConfig::default());
    let caller = scheduler.caller();

    let fh = caller
        .submit(
            UfsRequest::Open {
                path: p("/f"),
                mode: OpenMode::write(),
            },
            opts(),
        )
        .await
        .unwrap()
        .await
        .unwrap()
        .into_handle()
        .unwrap();

    let truncate = caller
        .submit(UfsRequest::Truncate { fh, len: u64::MAX }, opts())
        .await
        .unwrap();
    let flush = caller
        .submit(UfsRequest::Flush { fh }, opts())
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), truncate)
        .await
        .expect("panicking request must still complete");
    match result {
        Err(UfsError::Backend(e)) => assert!(e.to_string().contains("truncate")),
        other => panic!("expected Backend error, got {other:?}"),
    }

    // The next request on the same handle is not stuck behind the panic.
    tokio::time::timeout(Duration::from_secs(3), flush)
        .await
        .expect("request queued behind a panic must run")
        .unwrap();

    scheduler.shutdown().await.unwrap();
    let snap = scheduler.stats().snapshot();
    assert_eq!(snap.failed, 1);
    assert_eq!(snap.in_flight, 0);
}
