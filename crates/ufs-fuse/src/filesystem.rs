//! FUSE filesystem over a ufs backend stack.
//!
//! Every kernel callback becomes one synchronous call through a
//! [`SyncBridge`], which hands it to the async request core. The callback
//! thread parks until the core answers; it never runs backend I/O itself.
//!
//! | Callback | Core request |
//! |----------|--------------|
//! | lookup, getattr | `Stat` |
//! | readlink | `Readlink` |
//! | open | `Open` |
//! | create | `Create` (open, then stat) |
//! | mkdir | `MkdirStat` |
//! | read / write | `ReadAt` / `WriteAt` |
//! | flush, fsync | `Flush` |
//! | release | `Close` |
//! | readdir | `List` |
//! | unlink, rmdir, rename, symlink | same verb (`unlink` is `Remove`) |
//! | setattr(size) | `Resize` (truncate, then stat) |
//!
//! The FUSE file handle is the backend's [`FileHandle`] value, so no second
//! handle table is kept here.

use crate::config::MountConfig;
use crate::error::ToErrno;
use crate::inode::{InodeTable, ROOT_INODE};
use bytes::Bytes;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};
use ufs_core::{FileHandle, FileKind, FileStat, OpenMode, SyncBridge, UfsPath};

/// Block size reported in attributes.
const BLOCK_SIZE: u32 = 4096;

/// Default file permissions (rw-r--r--).
const DEFAULT_FILE_PERM: u16 = 0o644;

/// Default directory permissions (rwxr-xr-x).
const DEFAULT_DIR_PERM: u16 = 0o755;

/// Symlink permissions (rwxrwxrwx), as on Linux.
const SYMLINK_PERM: u16 = 0o777;

/// Translates kernel open flags into a backend [`OpenMode`].
///
/// `create` is set only by the `create` callback; `open` never creates.
pub fn open_mode(flags: i32, create: bool) -> OpenMode {
    let (read, write) = match flags & libc::O_ACCMODE {
        libc::O_WRONLY => (false, true),
        libc::O_RDWR => (true, true),
        _ => (true, false),
    };
    OpenMode {
        read,
        write,
        append: write && flags & libc::O_APPEND != 0,
        create,
        truncate: write && flags & libc::O_TRUNC != 0,
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

/// Rejects names the kernel should never hand to a lookup-style callback.
fn entry_name(name: &OsStr) -> Result<&str, c_int> {
    let name = name.to_str().ok_or(libc::EINVAL)?;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(libc::EINVAL);
    }
    Ok(name)
}

/// FUSE filesystem exposing the subtree at `root` of a backend stack.
pub struct UfsFuse {
    bridge: SyncBridge,
    inodes: InodeTable,
    attr_ttl: Duration,
    read_only: bool,
    uid: u32,
    gid: u32,
}

impl UfsFuse {
    /// Creates a filesystem whose root directory is `root` in the backend's
    /// namespace. With a jailed stack this is normally the jail root.
    pub fn new(bridge: SyncBridge, root: UfsPath, config: &MountConfig) -> Self {
        Self {
            bridge,
            inodes: InodeTable::new(root),
            attr_ttl: config.attr_ttl,
            read_only: config.read_only,
            uid: config.effective_uid(),
            gid: config.effective_gid(),
        }
    }

    pub fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// Builds the attributes the kernel sees for a backend stat.
    pub fn make_attr(&self, inode: u64, stat: &FileStat) -> FileAttr {
        let mtime = stat.mtime.unwrap_or(SystemTime::UNIX_EPOCH);
        let (perm, nlink, size) = match stat.kind {
            FileKind::Directory => (DEFAULT_DIR_PERM, 2, 0),
            FileKind::File => (DEFAULT_FILE_PERM, 1, stat.size),
            FileKind::Symlink => (SYMLINK_PERM, 1, stat.size),
        };
        FileAttr {
            ino: inode,
            size,
            blocks: size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: stat.atime.unwrap_or(mtime),
            mtime,
            ctime: stat.ctime.unwrap_or(mtime),
            crtime: mtime,
            kind: file_type(stat.kind),
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, inode: u64) -> Result<UfsPath, c_int> {
        self.inodes.path(inode).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<UfsPath, c_int> {
        let name = entry_name(name)?;
        let parent = self.path_of(parent)?;
        parent.join(name).map_err(|e| e.to_errno())
    }

    fn deny_if_read_only(&self) -> Result<(), c_int> {
        if self.read_only {
            Err(libc::EROFS)
        } else {
            Ok(())
        }
    }

    /// Stats `path` and registers it in the inode table with a lookup
    /// reference.
    fn lookup_path(&self, path: &UfsPath) -> Result<FileAttr, c_int> {
        let stat = self.bridge.stat(path).map_err(|e| e.to_errno())?;
        let inode = self.inodes.get_or_insert(path, stat.kind);
        Ok(self.make_attr(inode, &stat))
    }

    fn stat_inode(&self, inode: u64) -> Result<FileAttr, c_int> {
        let path = self.path_of(inode)?;
        let stat = self.bridge.stat(&path).map_err(|e| e.to_errno())?;
        Ok(self.make_attr(inode, &stat))
    }

    /// Truncates the file at `inode`, through `fh` when the kernel supplied
    /// one, and returns the new attributes.
    fn truncate(&self, inode: u64, fh: Option<u64>, size: u64) -> Result<FileAttr, c_int> {
        self.deny_if_read_only()?;
        let path = self.path_of(inode)?;
        let stat = self
            .bridge
            .resize(&path, fh.map(FileHandle), size)
            .map_err(|e| e.to_errno())?;
        Ok(self.make_attr(inode, &stat))
    }

    fn make_dir(&self, parent: u64, name: &OsStr) -> Result<FileAttr, c_int> {
        self.deny_if_read_only()?;
        let path = self.child_path(parent, name)?;
        let stat = self.bridge.mkdir_stat(&path).map_err(|e| e.to_errno())?;
        let inode = self.inodes.get_or_insert(&path, stat.kind);
        Ok(self.make_attr(inode, &stat))
    }

    fn create_file(
        &self,
        parent: u64,
        name: &OsStr,
        flags: i32,
    ) -> Result<(FileAttr, FileHandle), c_int> {
        self.deny_if_read_only()?;
        let path = self.child_path(parent, name)?;
        let exclusive = flags & libc::O_EXCL != 0;
        let (fh, stat) = self
            .bridge
            .create(&path, open_mode(flags, true), exclusive)
            .map_err(|e| e.to_errno())?;
        let inode = self.inodes.get_or_insert(&path, stat.kind);
        Ok((self.make_attr(inode, &stat), fh))
    }

    fn parent_inode(&self, inode: u64) -> u64 {
        if inode == ROOT_INODE {
            return ROOT_INODE;
        }
        self.inodes
            .path(inode)
            .and_then(|path| path.parent())
            .and_then(|parent| self.inodes.get_inode(&parent))
            .unwrap_or(ROOT_INODE)
    }
}

impl Filesystem for UfsFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!("FUSE filesystem initialized");
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        let stats = self.bridge.stats();
        info!(
            completed = stats.operations_completed.load(Ordering::Relaxed),
            failed = stats.operations_failed.load(Ordering::Relaxed),
            timed_out = stats.operations_timed_out.load(Ordering::Relaxed),
            "FUSE filesystem destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent = parent, name = ?name, "lookup");
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.lookup_path(&path) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup = nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.inodes.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        match self.stat_inode(ino) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.bridge.readlink(&path) {
            Ok(Some(target)) => reply.data(target.as_bytes()),
            Ok(None) => reply.error(libc::EINVAL),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags = flags, "open");
        let mode = open_mode(flags, false);
        if mode.is_mutating() && self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.bridge.open(&path, mode) {
            Ok(fh) => reply.opened(fh.raw(), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, size = size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.bridge.read_at(FileHandle(fh), offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, len = data.len(), "write");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self
            .bridge
            .write_at(FileHandle(fh), offset, Bytes::copy_from_slice(data))
        {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh = fh, "flush");
        match self.bridge.flush(FileHandle(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh = fh, datasync = datasync, "fsync");
        match self.bridge.flush(FileHandle(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh = fh, "release");
        match self.bridge.close(FileHandle(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(inode = ino, fh = fh, error = %e, "Close failed on release");
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset = offset, "readdir");
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let entries = match self.bridge.list(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        // Offsets are positions in this listing: 1 and 2 are "." and "..",
        // entry i of the backend listing is i + 3.
        let parent = self.parent_inode(ino);
        let dots = [(ino, "."), (parent, "..")];
        let mut position: i64 = 0;
        for (inode, name) in dots {
            position += 1;
            if position > offset && reply.add(inode, position, FileType::Directory, name) {
                reply.ok();
                return;
            }
        }

        for entry in entries {
            position += 1;
            if position <= offset {
                continue;
            }
            let Ok(child) = path.join(&entry.name) else {
                warn!(dir = %path, name = %entry.name, "Skipping unrepresentable entry");
                continue;
            };
            // readdir does not add a lookup reference.
            let inode = self.inodes.get_or_insert_no_lookup_inc(&child, entry.kind);
            if reply.add(inode, position, file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent = parent, name = ?name, "mkdir");
        match self.make_dir(parent, name) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent = parent, name = ?name, flags = flags, "create");
        match self.create_file(parent, name, flags) {
            Ok((attr, fh)) => reply.created(&self.attr_ttl, &attr, 0, fh.raw(), 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent = parent, name = ?name, "unlink");
        let result = self.deny_if_read_only().and_then(|()| {
            let path = self.child_path(parent, name)?;
            self.bridge.remove(&path).map_err(|e| e.to_errno())?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent = parent, name = ?name, "rmdir");
        let result = self.deny_if_read_only().and_then(|()| {
            let path = self.child_path(parent, name)?;
            self.bridge.rmdir(&path).map_err(|e| e.to_errno())?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        trace!(parent = parent, name = ?link_name, target = %target.display(), "symlink");
        let result = self.deny_if_read_only().and_then(|()| {
            let path = self.child_path(parent, link_name)?;
            let target = target.to_str().ok_or(libc::EINVAL)?;
            self.bridge
                .symlink(target, &path)
                .map_err(|e| e.to_errno())?;
            // The jail stats through links, so report the link itself.
            let inode = self.inodes.get_or_insert(&path, FileKind::Symlink);
            let stat = FileStat::new(FileKind::Symlink, target.len() as u64);
            Ok(self.make_attr(inode, &stat))
        });
        match result {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent = parent, name = ?name, newparent = newparent, newname = ?newname, "rename");
        if flags != 0 {
            debug!(flags = flags, "rename flags unsupported");
            reply.error(libc::EINVAL);
            return;
        }
        let result = self.deny_if_read_only().and_then(|()| {
            let from = self.child_path(parent, name)?;
            let to = self.child_path(newparent, newname)?;
            self.bridge.rename(&from, &to).map_err(|e| e.to_errno())?;
            self.inodes.rename_path(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, size = ?size, fh = ?fh, "setattr");
        // Mode, ownership and times are not stored by the contract; only
        // size changes reach the backend.
        let result = match size {
            Some(size) => self.truncate(ino, fh, size),
            None => self.stat_inode(ino),
        };
        match result {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }
}
