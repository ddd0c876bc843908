//! Per-key ordering of requests.
//!
//! Requests sharing an [`OrderingKey`] run one at a time in submission
//! order. The first request for an idle key proceeds at once; later ones
//! queue a oneshot and wait to be handed the key when the running request
//! releases it. Keys with nothing running are dropped from the map.
//!
//! All bookkeeping sits behind one `parking_lot::Mutex`, held only to update
//! the map and never across an await.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::request::{OrderingKey, RequestId};

/// Whether a request may run now or must wait for its turn.
#[derive(Debug)]
pub enum Turn {
    Now,
    Wait(oneshot::Receiver<()>),
}

#[derive(Debug)]
struct Waiter {
    request_id: RequestId,
    ready_tx: oneshot::Sender<()>,
}

/// Presence in the map means a request holds the key.
#[derive(Debug, Default)]
struct KeyState {
    pending: VecDeque<Waiter>,
}

/// Statistics for per-key ordering.
#[derive(Debug, Default)]
pub struct OrderingStats {
    /// Requests that had to wait for an earlier one.
    pub ops_waited: AtomicU64,
    /// Requests that proceeded immediately.
    pub ops_immediate: AtomicU64,
    /// Waiters that gave up before their turn.
    pub ops_abandoned: AtomicU64,
}

#[derive(Debug, Default)]
pub struct PerPathOrdering {
    keys: Mutex<HashMap<OrderingKey, KeyState>>,
    stats: OrderingStats,
}

impl PerPathOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request for `key`.
    pub fn enqueue(&self, key: &OrderingKey, request_id: RequestId) -> Turn {
        let mut keys = self.keys.lock();
        match keys.entry(key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(KeyState::default());
                self.stats.ops_immediate.fetch_add(1, Ordering::Relaxed);
                Turn::Now
            }
            Entry::Occupied(mut entry) => {
                let (ready_tx, ready_rx) = oneshot::channel();
                entry.get_mut().pending.push_back(Waiter {
                    request_id,
                    ready_tx,
                });
                self.stats.ops_waited.fetch_add(1, Ordering::Relaxed);
                Turn::Wait(ready_rx)
            }
        }
    }

    /// Releases `key` held by the caller, handing it to the next waiter.
    pub fn release(&self, key: &OrderingKey) {
        let mut keys = self.keys.lock();
        Self::hand_off(&mut keys, key);
    }

    /// Withdraws a waiting request that will not run.
    ///
    /// If the key was already handed to it, the key moves on to the next
    /// waiter instead.
    pub fn abandon(&self, key: &OrderingKey, request_id: RequestId) {
        self.stats.ops_abandoned.fetch_add(1, Ordering::Relaxed);
        let mut keys = self.keys.lock();
        if let Some(state) = keys.get_mut(key)
            && let Some(index) = state
                .pending
                .iter()
                .position(|w| w.request_id == request_id)
        {
            state.pending.remove(index);
            return;
        }
        Self::hand_off(&mut keys, key);
    }

    fn hand_off(keys: &mut HashMap<OrderingKey, KeyState>, key: &OrderingKey) {
        let Some(state) = keys.get_mut(key) else {
            return;
        };
        while let Some(waiter) = state.pending.pop_front() {
            if waiter.ready_tx.send(()).is_ok() {
                return;
            }
        }
        keys.remove(key);
    }

    /// Number of keys currently held.
    pub fn active_keys(&self) -> usize {
        self.keys.lock().len()
    }

    /// Number of requests waiting on `key`.
    pub fn pending_count(&self, key: &OrderingKey) -> usize {
        self.keys.lock().get(key).map_or(0, |s| s.pending.len())
    }

    pub fn stats(&self) -> &OrderingStats {
        &self.stats
    }
}
