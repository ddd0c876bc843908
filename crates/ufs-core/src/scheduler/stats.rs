//! Counters for the async core.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{UfsError, UfsResult};

/// Live counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub timed_out: AtomicU64,
    /// Completed with `CoreShutdown`, or refused at submission.
    pub rejected: AtomicU64,
    /// Requests that waited behind an earlier one with the same key.
    pub waited_for_order: AtomicU64,
    /// Backend calls currently running.
    pub in_flight: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub waited_for_order: u64,
    pub in_flight: u64,
}

impl SchedulerStats {
    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_waited(&self) {
        self.waited_for_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_start(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_end(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Counts the final outcome of one request.
    pub fn record_outcome<T>(&self, result: &UfsResult<T>) {
        let counter = match result {
            Ok(_) => &self.completed,
            Err(UfsError::Cancelled) => &self.cancelled,
            Err(UfsError::Timeout) => &self.timed_out,
            Err(UfsError::CoreShutdown) => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            waited_for_order: self.waited_for_order.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
