//! Async core: owns pending requests and enforces ordering, cancellation,
//! deadlines and backpressure.
//!
//! # Architecture
//!
//! ```text
//! Caller::submit ──▶ admission ──▶ per-key queue ──▶ backend call ──▶ result slot
//!                    (semaphore)   (caller, path)     (tokio task)     (oneshot)
//!                                  (caller, handle)
//! ```
//!
//! Every submitted request gets its own task. The task first waits for its
//! turn on the request's ordering key, then calls the backend. At every
//! step it races the request's cancellation token, its deadline and (before
//! starting) scheduler shutdown; whichever fires first decides the single
//! result delivered to the [`RequestHandle`].
//!
//! A backend call that has started is never abandoned: if the request is
//! cancelled or times out in flight, the handle resolves at once but the
//! ordering key is only passed on after the backend returns, so later
//! requests on the same key still observe submission order.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use ufs_core::scheduler::{Scheduler, SchedulerConfig, SubmitOptions, UfsRequest};
//! use ufs_core::{MemoryFs, UfsPath};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ufs_core::UfsResult<()> {
//! let scheduler = Scheduler::new(Arc::new(MemoryFs::new()), SchedulerConfig::default());
//! let caller = scheduler.caller();
//!
//! let path = UfsPath::normalize("/docs")?;
//! let handle = caller
//!     .submit(UfsRequest::Mkdir { path: path.clone() }, SubmitOptions::default())
//!     .await?;
//! handle.await?;
//!
//! let stat = caller
//!     .submit(UfsRequest::Stat { path }, SubmitOptions::default())
//!     .await?
//!     .await?
//!     .into_stat()?;
//! assert!(stat.is_dir());
//!
//! scheduler.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod per_path;
pub mod request;
pub mod stats;

pub use per_path::{OrderingStats, PerPathOrdering, Turn};
pub use request::{
    CallerId, OrderingKey, OrderingTarget, RequestHandle, RequestId, RequestIdGenerator,
    SubmitOptions, UfsRequest, UfsResponse,
};
pub use stats::{SchedulerStats, SchedulerStatsSnapshot};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace};

use crate::error::{UfsError, UfsResult};
use crate::ops::Ufs;
use request::RequestSlot;

/// Default bound on requests admitted but not yet completed.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Requests admitted at once, queued or running. Further submitters
    /// wait for a slot.
    pub max_in_flight: usize,
    /// Deadline applied to requests submitted without one.
    #[serde(with = "humantime_serde")]
    pub default_deadline: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            default_deadline: None,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    #[must_use]
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }
}

struct Shared {
    fs: Arc<dyn Ufs>,
    config: SchedulerConfig,
    ids: RequestIdGenerator,
    next_caller: AtomicU64,
    ordering: PerPathOrdering,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<SchedulerStats>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("fs", &self.fs)
            .field("config", &self.config)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The async core. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler in front of `fs`.
    ///
    /// Requests are run as tokio tasks, so submission must happen inside a
    /// tokio runtime.
    pub fn new(fs: Arc<dyn Ufs>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        debug!(max_in_flight = config.max_in_flight, "Creating scheduler");
        Self {
            shared: Arc::new(Shared {
                fs,
                config,
                ids: RequestIdGenerator::new(),
                next_caller: AtomicU64::new(1),
                ordering: PerPathOrdering::new(),
                permits,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                stats: Arc::new(SchedulerStats::default()),
            }),
        }
    }

    /// Issues a new caller identity.
    pub fn caller(&self) -> Caller {
        let id = CallerId(self.shared.next_caller.fetch_add(1, Ordering::Relaxed));
        Caller {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the backend's `start` hook.
    pub async fn start(&self) -> UfsResult<()> {
        self.shared.fs.start().await
    }

    /// Stops admission, fails every request that has not started with
    /// `CoreShutdown`, waits for running backend calls to finish, then runs
    /// the backend's `stop` hook.
    pub async fn shutdown(&self) -> UfsResult<()> {
        if !self.shared.shutdown.is_cancelled() {
            info!(
                in_flight = self.shared.stats.in_flight.load(Ordering::Relaxed),
                "Scheduler shutting down"
            );
        }
        self.shared.shutdown.cancel();
        self.shared.permits.close();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        debug!("Scheduler drained");
        self.shared.fs.stop().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.shared.stats
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn ordering_stats(&self) -> &OrderingStats {
        self.shared.ordering.stats()
    }
}

/// A submitter. Requests from one caller on one path (or handle) complete
/// in submission order.
#[derive(Debug, Clone)]
pub struct Caller {
    id: CallerId,
    shared: Arc<Shared>,
}

impl Caller {
    pub fn id(&self) -> CallerId {
        self.id
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Submits a request.
    ///
    /// Waits while `max_in_flight` requests are already admitted. Fails with
    /// `CoreShutdown` once shutdown has begun.
    pub async fn submit(
        &self,
        request: UfsRequest,
        options: SubmitOptions,
    ) -> UfsResult<RequestHandle> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            shared.stats.record_rejected();
            return Err(UfsError::CoreShutdown);
        }

        let permit = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => None,
            permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            shared.stats.record_rejected();
            return Err(UfsError::CoreShutdown);
        };

        let id = shared.ids.next();
        let key = request.ordering_key(self.id);
        let turn = shared.ordering.enqueue(&key, id);
        let deadline = options
            .deadline
            .or(shared.config.default_deadline)
            .map(|d| Instant::now() + d);

        let (reply_tx, reply_rx) = oneshot::channel();
        let slot = Arc::new(RequestSlot::new(id, reply_tx, Arc::clone(&shared.stats)));
        shared.stats.record_submit();
        trace!(
            request = %id,
            caller = %self.id,
            verb = request.verb(),
            key = %key.target,
            waiting = matches!(turn, Turn::Wait(_)),
            "Request submitted"
        );

        shared.tracker.spawn(run_request(
            Arc::clone(shared),
            Arc::clone(&slot),
            request,
            key,
            turn,
            deadline,
            permit,
        ));

        Ok(RequestHandle { slot, rx: reply_rx })
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Completes the slot with `CoreShutdown` if the request task is dropped
/// before delivering a result, as happens when the runtime goes away.
struct FinishOnDrop<'a>(&'a RequestSlot);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finish(Err(UfsError::CoreShutdown));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// Runs the backend call, turning a panic into a `Backend` error.
async fn call_backend(fs: &dyn Ufs, request: UfsRequest) -> UfsResult<UfsResponse> {
    let verb = request.verb();
    match AssertUnwindSafe(request.dispatch(fs)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(verb, panic = msg, "Backend call panicked");
            Err(UfsError::Backend(io::Error::other(format!(
                "backend panicked during {verb}: {msg}"
            ))))
        }
    }
}

async fn run_request(
    shared: Arc<Shared>,
    slot: Arc<RequestSlot>,
    request: UfsRequest,
    key: OrderingKey,
    turn: Turn,
    deadline: Option<Instant>,
    _permit: OwnedSemaphorePermit,
) {
    let _finish = FinishOnDrop(&slot);
    if let Turn::Wait(ready) = turn {
        shared.stats.record_waited();
        let waited = tokio::select! {
            biased;
            () = slot.cancel.cancelled() => Err(UfsError::Cancelled),
            () = shared.shutdown.cancelled() => Err(UfsError::CoreShutdown),
            () = expire(deadline) => Err(UfsError::Timeout),
            ready = ready => match ready {
                Ok(()) => Ok(()),
                Err(_) => {
                    slot.finish(Err(UfsError::CoreShutdown));
                    return;
                }
            },
        };
        if let Err(err) = waited {
            debug!(request = %slot.id, reason = %err, "Request dropped before start");
            shared.ordering.abandon(&key, slot.id);
            slot.finish(Err(err));
            return;
        }
    }

    // The key is held from here until release.
    let refused = if slot.cancel.is_cancelled() {
        Some(UfsError::Cancelled)
    } else if shared.shutdown.is_cancelled() {
        Some(UfsError::CoreShutdown)
    } else if deadline.is_some_and(|d| d <= Instant::now()) {
        Some(UfsError::Timeout)
    } else {
        None
    };
    if let Some(err) = refused {
        debug!(request = %slot.id, reason = %err, "Request dropped before start");
        slot.finish(Err(err));
        shared.ordering.release(&key);
        return;
    }

    slot.mark_started();
    shared.stats.record_call_start();
    let verb = request.verb();
    let call = call_backend(shared.fs.as_ref(), request);
    tokio::pin!(call);

    let finished = tokio::select! {
        biased;
        result = &mut call => {
            trace!(request = %slot.id, verb, ok = result.is_ok(), "Request completed");
            slot.finish(result);
            true
        }
        () = slot.cancel.cancelled() => false,
        () = expire(deadline) => {
            debug!(request = %slot.id, verb, "Request timed out in flight");
            slot.finish(Err(UfsError::Timeout));
            false
        }
    };
    if !finished {
        // Result is discarded, but later requests on this key must not
        // overtake the running call.
        let _ = call.await;
    }

    shared.stats.record_call_end();
    shared.ordering.release(&key);
}
