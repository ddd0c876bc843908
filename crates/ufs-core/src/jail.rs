//! Containment wrapper that keeps every operation under a fixed root.
//!
//! A [`Jail`] decorates any [`Ufs`] and re-resolves each path argument
//! before delegating: the path must lie under the root, and so must every
//! symlink met while walking it, component by component. Anything else
//! fails with [`UfsError::PathEscape`] and the wrapped backend is not
//! called for the operation at all.
//!
//! Handles are checked too: a jail only accepts handles that its own `open`
//! issued, so a handle opened on the shared backend outside the root cannot
//! be used through it.
//!
//! Resolution is iterative with an explicit budget
//! ([`MAX_LINK_DEPTH`] by default), so link chains and cycles end in
//! [`UfsError::TooManyLinks`] instead of recursion.
//!
//! # Namespace lock
//!
//! A backend that follows links itself (a host directory) re-walks the path
//! after the jail has checked it. For such backends the jail holds a
//! namespace lock for the duration of each call, shared for lookups and
//! exclusive for mutations, so no mutation made through this jail can swap
//! a checked component for a link in between. Mutations made behind the
//! jail's back are not covered.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::error::{PathError, UfsError, UfsResult};
use crate::ops::{Capabilities, DirEntry, FileHandle, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

/// Default number of symlinks followed while resolving one path.
pub const MAX_LINK_DEPTH: usize = 40;

/// How far symlinks are followed along a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Follow {
    /// Follow links in every component, including the last.
    All,
    /// Follow links in the parent components only; the last component is
    /// the entry being acted on.
    Parent,
}

/// Outcome of resolving a path against the jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// The real path to delegate, always under the root.
    pub path: UfsPath,
    /// Number of symlinks followed on the way.
    pub links_followed: usize,
    /// The resolved path is the root itself.
    pub at_root: bool,
}

/// Confines an inner filesystem to the subtree at `root`.
#[derive(Debug)]
pub struct Jail {
    inner: Arc<dyn Ufs>,
    root: UfsPath,
    max_link_depth: usize,
    namespace: Option<RwLock<()>>,
    handles: DashSet<FileHandle>,
}

enum NamespaceGuard<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
    Unlocked,
}

impl Jail {
    pub fn new(inner: Arc<dyn Ufs>, root: UfsPath) -> Self {
        let namespace = inner.capabilities().follows_links.then(|| RwLock::new(()));
        Self {
            inner,
            root,
            max_link_depth: MAX_LINK_DEPTH,
            namespace,
            handles: DashSet::new(),
        }
    }

    /// Sets how many symlinks one resolution may follow.
    #[must_use]
    pub fn with_max_link_depth(mut self, depth: usize) -> Self {
        self.max_link_depth = depth;
        self
    }

    pub fn root(&self) -> &UfsPath {
        &self.root
    }

    pub fn inner(&self) -> &Arc<dyn Ufs> {
        &self.inner
    }

    /// Number of handles opened through this jail and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn check_handle(&self, fh: FileHandle) -> UfsResult<FileHandle> {
        if self.handles.contains(&fh) {
            Ok(fh)
        } else {
            warn!(handle = %fh, root = %self.root, "Rejected handle not opened through jail");
            Err(UfsError::InvalidHandle(fh.raw()))
        }
    }

    /// Joins an untrusted relative fragment onto the root.
    ///
    /// `..` that climbs out of the root and absolute fragments are reported
    /// as [`UfsError::PathEscape`].
    pub fn confine(&self, fragment: &str) -> UfsResult<UfsPath> {
        let path = self.root.join(fragment).map_err(|e| match e {
            UfsError::InvalidPath {
                reason: PathError::AboveRoot | PathError::AbsoluteFragment,
                ..
            } => UfsError::escape(fragment),
            other => other,
        })?;
        if !self.root.is_prefix_of(&path) {
            return Err(UfsError::escape(fragment));
        }
        Ok(path)
    }

    async fn shared(&self) -> NamespaceGuard<'_> {
        match &self.namespace {
            Some(lock) => NamespaceGuard::Shared(lock.read().await),
            None => NamespaceGuard::Unlocked,
        }
    }

    async fn exclusive(&self) -> NamespaceGuard<'_> {
        match &self.namespace {
            Some(lock) => NamespaceGuard::Exclusive(lock.write().await),
            None => NamespaceGuard::Unlocked,
        }
    }

    /// Resolves `path` against the wrapped backend.
    ///
    /// Every component is checked; symlinks are read through the backend's
    /// `readlink` and their targets re-validated against the root. Absolute
    /// targets are paths in the backend's namespace, relative targets are
    /// taken from the link's directory.
    pub async fn resolve(&self, path: &UfsPath, follow: Follow) -> UfsResult<Resolved> {
        let Some(rest) = path.strip_prefix(&self.root) else {
            warn!(path = %path, root = %self.root, "Rejected path outside jail");
            return Err(UfsError::escape(path));
        };

        if !self.inner.capabilities().symlinks {
            return Ok(Resolved {
                at_root: *path == self.root,
                path: path.clone(),
                links_followed: 0,
            });
        }

        let mut pending: VecDeque<String> = rest.map(str::to_string).collect();
        let mut current = self.root.clone();
        let mut links_followed = 0;

        while let Some(segment) = pending.pop_front() {
            let candidate = current.join(&segment)?;
            if pending.is_empty() && follow == Follow::Parent {
                current = candidate;
                break;
            }

            let Some(target) = self.inner.readlink(&candidate).await? else {
                current = candidate;
                continue;
            };

            links_followed += 1;
            if links_followed > self.max_link_depth {
                warn!(path = %path, depth = self.max_link_depth, "Symlink budget exhausted");
                return Err(UfsError::TooManyLinks {
                    path: path.to_string(),
                });
            }

            let target_path = self.link_target(&current, &target, &candidate)?;
            trace!(link = %candidate, resolved = %target_path, "Following symlink");

            // Restart from the root so every component of the target is
            // checked again, then continue with what was left of the path.
            let Some(target_rest) = target_path.strip_prefix(&self.root) else {
                warn!(link = %candidate, link_target = %target, "Rejected symlink leaving jail");
                return Err(UfsError::escape(&candidate));
            };
            let mut next: VecDeque<String> = target_rest.map(str::to_string).collect();
            next.extend(pending);
            pending = next;
            current = self.root.clone();
        }

        Ok(Resolved {
            at_root: current == self.root,
            path: current,
            links_followed,
        })
    }

    fn link_target(&self, dir: &UfsPath, target: &str, link: &UfsPath) -> UfsResult<UfsPath> {
        let resolved = if target.starts_with('/') {
            UfsPath::normalize(target)
        } else {
            dir.join(target)
        };
        resolved.map_err(|e| match e {
            UfsError::InvalidPath {
                reason: PathError::AboveRoot,
                ..
            } => {
                warn!(link = %link, link_target = target, root = %self.root, "Rejected symlink leaving jail");
                UfsError::escape(link)
            }
            other => other,
        })
    }

    /// Resolves the entry a mutation acts on, refusing the root itself.
    async fn resolve_entry(&self, path: &UfsPath) -> UfsResult<UfsPath> {
        let resolved = self.resolve(path, Follow::Parent).await?;
        if resolved.at_root {
            warn!(path = %path, "Rejected mutation of jail root");
            return Err(UfsError::escape(path));
        }
        Ok(resolved.path)
    }
}

#[async_trait]
impl Ufs for Jail {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn start(&self) -> UfsResult<()> {
        debug!(root = %self.root, "Starting jail");
        self.inner.start().await
    }

    async fn stop(&self) -> UfsResult<()> {
        self.inner.stop().await
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        let _ns = self.shared().await;
        let resolved = self.resolve(path, Follow::All).await?;
        self.inner.stat(&resolved.path).await
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        let _ns = self.shared().await;
        let resolved = self.resolve(path, Follow::All).await?;
        self.inner.list(&resolved.path).await
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        let _ns = if mode.create {
            self.exclusive().await
        } else {
            self.shared().await
        };
        let resolved = self.resolve(path, Follow::All).await?;
        let fh = self.inner.open(&resolved.path, mode).await?;
        self.handles.insert(fh);
        Ok(fh)
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        self.inner.seek(self.check_handle(fh)?, pos).await
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        self.inner.read(self.check_handle(fh)?, len).await
    }

    async fn write(&self, fh: FileHandle, data: Bytes) -> UfsResult<usize> {
        self.inner.write(self.check_handle(fh)?, data).await
    }

    async fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()> {
        self.inner.truncate(self.check_handle(fh)?, len).await
    }

    async fn flush(&self, fh: FileHandle) -> UfsResult<()> {
        self.inner.flush(self.check_handle(fh)?).await
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        self.check_handle(fh)?;
        self.handles.remove(&fh);
        self.inner.close(fh).await
    }

    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        self.inner.read_at(self.check_handle(fh)?, offset, len).await
    }

    async fn write_at(&self, fh: FileHandle, offset: u64, data: Bytes) -> UfsResult<usize> {
        self.inner.write_at(self.check_handle(fh)?, offset, data).await
    }

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        let _ns = self.exclusive().await;
        let resolved = self.resolve(path, Follow::Parent).await?;
        self.inner.mkdir(&resolved.path).await
    }

    async fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        let _ns = self.exclusive().await;
        let target = self.resolve_entry(path).await?;
        self.inner.remove(&target).await
    }

    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        let _ns = self.exclusive().await;
        let target = self.resolve_entry(path).await?;
        self.inner.rmdir(&target).await
    }

    async fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        let _ns = self.exclusive().await;
        let source = self.resolve_entry(from).await?;
        let dest = self.resolve_entry(to).await?;
        // A link may only be moved if what it points at is inside as well.
        self.resolve(from, Follow::All).await?;
        self.inner.rename(&source, &dest).await
    }

    async fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        let _ns = self.shared().await;
        let resolved = self.resolve(path, Follow::Parent).await?;
        if !self.inner.capabilities().symlinks {
            return Ok(None);
        }
        self.inner.readlink(&resolved.path).await
    }

    async fn symlink(&self, target: &str, link: &UfsPath) -> UfsResult<()> {
        let _ns = self.exclusive().await;
        let resolved = self.resolve_entry(link).await?;
        if target.starts_with('/') {
            let target_path = UfsPath::normalize(target)?;
            if !self.root.is_prefix_of(&target_path) {
                warn!(link = %link, link_target = target, "Rejected symlink pointing outside jail");
                return Err(UfsError::escape(target));
            }
        }
        self.inner.symlink(target, &resolved).await
    }

    async fn copy(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        let _ns = self.exclusive().await;
        let source = self.resolve(from, Follow::All).await?;
        let dest = self.resolve(to, Follow::All).await?;
        self.inner.copy(&source.path, &dest.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFs;

    fn p(raw: &str) -> UfsPath {
        UfsPath::normalize(raw).unwrap()
    }

    async fn jailed() -> (Arc<MemoryFs>, Jail) {
        let fs = Arc::new(MemoryFs::new());
        fs.mkdir(&p("/jail")).await.unwrap();
        fs.mkdir(&p("/jail/sub")).await.unwrap();
        let jail = Jail::new(fs.clone(), p("/jail"));
        (fs, jail)
    }

    #[tokio::test]
    async fn test_confine() {
        let (_fs, jail) = jailed().await;
        assert_eq!(jail.confine("sub/file").unwrap(), p("/jail/sub/file"));
        assert_eq!(jail.confine("").unwrap(), p("/jail"));
        assert!(matches!(
            jail.confine("../etc/passwd"),
            Err(UfsError::PathEscape { .. })
        ));
        assert!(matches!(
            jail.confine("/etc/passwd"),
            Err(UfsError::PathEscape { .. })
        ));
        assert!(matches!(
            jail.confine("a\0b"),
            Err(UfsError::InvalidPath { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_plain_path() {
        let (_fs, jail) = jailed().await;
        let resolved = jail.resolve(&p("/jail/sub/x"), Follow::All).await.unwrap();
        assert_eq!(resolved.path, p("/jail/sub/x"));
        assert_eq!(resolved.links_followed, 0);
        assert!(!resolved.at_root);

        let root = jail.resolve(&p("/jail"), Follow::All).await.unwrap();
        assert!(root.at_root);
    }

    #[tokio::test]
    async fn test_resolve_relative_link() {
        let (fs, jail) = jailed().await;
        fs.symlink("sub", &p("/jail/alias")).await.unwrap();
        let resolved = jail
            .resolve(&p("/jail/alias/file"), Follow::All)
            .await
            .unwrap();
        assert_eq!(resolved.path, p("/jail/sub/file"));
        assert_eq!(resolved.links_followed, 1);
    }

    #[tokio::test]
    async fn test_relative_link_climbing_out() {
        let (fs, jail) = jailed().await;
        fs.symlink("../../etc", &p("/jail/sub/up")).await.unwrap();
        assert!(matches!(
            jail.resolve(&p("/jail/sub/up/passwd"), Follow::All).await,
            Err(UfsError::PathEscape { .. })
        ));
    }

    #[tokio::test]
    async fn test_parent_follow_keeps_last_link() {
        let (fs, jail) = jailed().await;
        fs.symlink("/etc/passwd", &p("/jail/bad")).await.unwrap();
        let resolved = jail.resolve(&p("/jail/bad"), Follow::Parent).await.unwrap();
        assert_eq!(resolved.path, p("/jail/bad"));
        // Removing the link itself is fine; following it is not.
        jail.remove(&p("/jail/bad")).await.unwrap();
    }

    #[tokio::test]
    async fn test_root_mutations_refused() {
        let (_fs, jail) = jailed().await;
        assert!(matches!(
            jail.rmdir(&p("/jail")).await,
            Err(UfsError::PathEscape { .. })
        ));
        assert!(matches!(
            jail.rename(&p("/jail"), &p("/jail/sub/x")).await,
            Err(UfsError::PathEscape { .. })
        ));
    }

    #[tokio::test]
    async fn test_symlink_creation_checks_absolute_target() {
        let (_fs, jail) = jailed().await;
        jail.symlink("/jail/sub", &p("/jail/ok")).await.unwrap();
        assert!(matches!(
            jail.symlink("/etc", &p("/jail/nope")).await,
            Err(UfsError::PathEscape { .. })
        ));
    }

    #[tokio::test]
    async fn test_nested_jails() {
        let (fs, outer) = jailed().await;
        fs.symlink("/jail", &p("/jail/sub/top")).await.unwrap();
        let inner = Jail::new(Arc::new(outer), p("/jail/sub"));

        // Fine for the outer jail, outside the inner one.
        assert!(matches!(
            inner.list(&p("/jail/sub/top")).await,
            Err(UfsError::PathEscape { .. })
        ));
        assert!(inner.list(&p("/jail/sub")).await.is_ok());
    }

    #[tokio::test]
    async fn test_link_cycle() {
        let (fs, jail) = jailed().await;
        fs.symlink("b", &p("/jail/a")).await.unwrap();
        fs.symlink("a", &p("/jail/b")).await.unwrap();
        let jail = jail.with_max_link_depth(8);
        assert!(matches!(
            jail.stat(&p("/jail/a")).await,
            Err(UfsError::TooManyLinks { .. })
        ));
    }
}
