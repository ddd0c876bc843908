//! Inode management for the FUSE filesystem.
//!
//! Maps kernel inode numbers to backend paths and back, with the `nlookup`
//! reference count the kernel expects: `lookup`, `create`, `mkdir` and
//! `symlink` replies add a reference, `forget` drops them, and an inode is
//! evicted when its count reaches zero.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use std::sync::atomic::{AtomicU64, Ordering};
use ufs_core::{FileKind, UfsPath};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// The path in the backend's namespace.
    pub path: UfsPath,
    pub kind: FileKind,
    /// Lookup count for proper `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    /// Creates a new inode entry with nlookup = 1.
    pub fn new(path: UfsPath, kind: FileKind) -> Self {
        Self::with_nlookup(path, kind, 1)
    }

    /// Creates a new inode entry with nlookup = 0, for entries returned from
    /// `readdir()`, which must not add a reference.
    pub fn new_no_lookup(path: UfsPath, kind: FileKind) -> Self {
        Self::with_nlookup(path, kind, 0)
    }

    fn with_nlookup(path: UfsPath, kind: FileKind, nlookup: u64) -> Self {
        Self {
            path,
            kind,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count by `count` and returns the new value.
    /// Returns `None` if the count would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe table mapping between inodes and backend paths.
#[derive(Debug)]
pub struct InodeTable {
    entries: DashMap<u64, InodeEntry>,
    by_path: DashMap<UfsPath, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a table whose root inode maps to `root`.
    pub fn new(root: UfsPath) -> Self {
        let entries = DashMap::new();
        let by_path = DashMap::new();
        by_path.insert(root.clone(), ROOT_INODE);
        entries.insert(ROOT_INODE, InodeEntry::new(root, FileKind::Directory));
        Self {
            entries,
            by_path,
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Returns the inode for `path`, allocating one if needed, and adds a
    /// lookup reference.
    pub fn get_or_insert(&self, path: &UfsPath, kind: FileKind) -> u64 {
        self.insert_with(path, kind, true)
    }

    /// Returns the inode for `path`, allocating one if needed, without
    /// adding a lookup reference (`readdir`).
    pub fn get_or_insert_no_lookup_inc(&self, path: &UfsPath, kind: FileKind) -> u64 {
        self.insert_with(path, kind, false)
    }

    fn insert_with(&self, path: &UfsPath, kind: FileKind, lookup: bool) -> u64 {
        // The path shard stays locked while a new entry is created, so two
        // racing lookups of one path agree on the inode.
        match self.by_path.entry(path.clone()) {
            Entry::Occupied(slot) => {
                let inode = *slot.get();
                if let Some(mut entry) = self.entries.get_mut(&inode) {
                    entry.kind = kind;
                    if lookup {
                        entry.inc_nlookup();
                    }
                }
                inode
            }
            Entry::Vacant(slot) => {
                let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
                let entry = if lookup {
                    InodeEntry::new(path.clone(), kind)
                } else {
                    InodeEntry::new_no_lookup(path.clone(), kind)
                };
                self.entries.insert(inode, entry);
                slot.insert(inode);
                inode
            }
        }
    }

    /// Looks up an entry by inode number.
    pub fn get(&self, inode: u64) -> Option<Ref<'_, u64, InodeEntry>> {
        self.entries.get(&inode)
    }

    /// The path of `inode`, if it is known.
    pub fn path(&self, inode: u64) -> Option<UfsPath> {
        self.entries.get(&inode).map(|entry| entry.path.clone())
    }

    /// Looks up an inode by path.
    pub fn get_inode(&self, path: &UfsPath) -> Option<u64> {
        self.by_path.get(path).map(|inode| *inode)
    }

    /// Drops `nlookup` references from `inode` and evicts it when none are
    /// left. Returns `true` if the inode was evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }

        if let Some(entry) = self.entries.get(&inode)
            && let Some(remaining) = entry.dec_nlookup(nlookup)
            && remaining == 0
        {
            drop(entry);
            return self.evict(inode);
        }
        false
    }

    fn evict(&self, inode: u64) -> bool {
        let Some((_, entry)) = self.entries.remove(&inode) else {
            return false;
        };
        self.by_path.remove_if(&entry.path, |_, mapped| *mapped == inode);
        true
    }

    /// Removes the path mapping after a delete.
    ///
    /// The inode entry itself stays until the kernel forgets it, since the
    /// kernel may still pass the inode number to later calls.
    pub fn invalidate_path(&self, path: &UfsPath) {
        self.by_path.remove(path);
    }

    /// Re-paths `from` and everything below it to `to` after a rename.
    ///
    /// Any inode previously mapped at a destination path loses its mapping.
    pub fn rename_path(&self, from: &UfsPath, to: &UfsPath) {
        let moved: Vec<(u64, UfsPath)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let rest = entry.path.strip_prefix(from)?;
                let mut path = to.clone();
                for segment in rest {
                    path = path.join(segment).ok()?;
                }
                Some((*entry.key(), path))
            })
            .collect();

        self.by_path
            .retain(|path, _| !to.is_prefix_of(path) && !from.is_prefix_of(path));
        for (inode, path) in moved {
            if let Some(mut entry) = self.entries.get_mut(&inode) {
                entry.path = path.clone();
            }
            self.by_path.insert(path, inode);
        }
    }

    /// Returns the number of inodes currently in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table only contains the root inode.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}
