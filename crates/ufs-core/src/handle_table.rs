//! Concurrent table of open file handles.
//!
//! Backends keep their per-handle state here. IDs are issued from an
//! incrementing counter that starts at 1 and skips 0 on wraparound, so a
//! [`FileHandle`] of 0 is never valid.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::{Ref, RefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{UfsError, UfsResult};
use crate::ops::FileHandle;

/// Thread-safe map from [`FileHandle`] to backend state.
///
/// ```
/// use ufs_core::handle_table::HandleTable;
///
/// let table: HandleTable<String> = HandleTable::new();
/// let fh = table.insert("report.txt".to_string());
/// assert_eq!(fh.raw(), 1);
/// assert_eq!(*table.get(fh).unwrap(), "report.txt");
/// assert_eq!(table.remove(fh).unwrap(), "report.txt");
/// assert!(table.get(fh).is_err());
/// ```
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores `value` under a fresh handle.
    pub fn insert(&self, value: V) -> FileHandle {
        let mut value = Some(value);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(id)
                && let Some(value) = value.take()
            {
                entry.insert(value);
                return FileHandle(id);
            }
        }
    }

    /// Borrows the state for `fh`.
    ///
    /// The returned guard locks a shard of the table; drop it before awaiting.
    pub fn get(&self, fh: FileHandle) -> UfsResult<Ref<'_, u64, V>> {
        self.handles
            .get(&fh.raw())
            .ok_or(UfsError::InvalidHandle(fh.raw()))
    }

    /// Mutably borrows the state for `fh`.
    pub fn get_mut(&self, fh: FileHandle) -> UfsResult<RefMut<'_, u64, V>> {
        self.handles
            .get_mut(&fh.raw())
            .ok_or(UfsError::InvalidHandle(fh.raw()))
    }

    /// Removes and returns the state for `fh`.
    pub fn remove(&self, fh: FileHandle) -> UfsResult<V> {
        self.handles
            .remove(&fh.raw())
            .map(|(_, v)| v)
            .ok_or(UfsError::InvalidHandle(fh.raw()))
    }

    pub fn contains(&self, fh: FileHandle) -> bool {
        self.handles.contains_key(&fh.raw())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V: Clone> HandleTable<V> {
    /// Clones the state for `fh` out of the table.
    ///
    /// Use this when the state must be held across an await point.
    pub fn get_cloned(&self, fh: FileHandle) -> UfsResult<V> {
        self.get(fh).map(|r| r.value().clone())
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ids_start_at_one() {
        let table: HandleTable<&str> = HandleTable::new();
        assert_eq!(table.insert("a"), FileHandle(1));
        assert_eq!(table.insert("b"), FileHandle(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_unknown_handle() {
        let table: HandleTable<&str> = HandleTable::new();
        assert!(matches!(
            table.remove(FileHandle(42)),
            Err(UfsError::InvalidHandle(42))
        ));
        assert!(matches!(
            table.get(FileHandle(0)),
            Err(UfsError::InvalidHandle(0))
        ));
    }

    #[test]
    fn test_get_mut() {
        let table: HandleTable<u64> = HandleTable::new();
        let fh = table.insert(10);
        *table.get_mut(fh).unwrap() += 5;
        assert_eq!(table.get_cloned(fh).unwrap(), 15);
    }

    #[test]
    fn test_skips_zero_on_wrap() {
        let table: HandleTable<&str> = HandleTable::new();
        table.next_id.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(table.insert("last"), FileHandle(u64::MAX));
        assert_eq!(table.insert("wrapped"), FileHandle(1));
    }

    #[test]
    fn test_concurrent_inserts_are_unique() {
        let table: Arc<HandleTable<usize>> = Arc::new(HandleTable::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || (0..100).map(|i| table.insert(t * 100 + i)).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<_> = threads
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        assert_eq!(table.len(), 800);
    }
}
