//! In-memory backend.
//!
//! Every entry lives in one map keyed by its full path, guarded by a single
//! `parking_lot::RwLock` that is never held across an await. File contents
//! are shared with open handles, so removing a file does not invalidate a
//! handle that is still open on it.
//!
//! File sizes are capped at [`DEFAULT_MAX_FILE_SIZE`] (adjustable with
//! [`MemoryFs::with_max_file_size`]); a write or truncate past the cap fails
//! with `FileTooLarge` instead of trying to allocate.
//!
//! Symlinks are stored and reported by `readlink` but never followed: a
//! symlink used as an intermediate directory yields `NotADirectory`, and
//! opening one is unsupported. Wrap the backend in a
//! [`Jail`](crate::jail::Jail) to get link resolution.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{UfsError, UfsResult};
use crate::handle_table::HandleTable;
use crate::ops::{Capabilities, DirEntry, FileHandle, FileKind, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

/// Largest file a [`MemoryFs`] holds unless configured otherwise (4 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 << 30;

fn too_large() -> UfsError {
    UfsError::Backend(io::Error::new(
        io::ErrorKind::FileTooLarge,
        "file would exceed the in-memory size limit",
    ))
}

/// Converts a requested size to a buffer length, refusing sizes over `limit`.
fn checked_len(len: u64, limit: u64) -> UfsResult<usize> {
    if len > limit {
        return Err(too_large());
    }
    usize::try_from(len).map_err(|_| too_large())
}

#[derive(Debug)]
struct FileData {
    bytes: Vec<u8>,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
}

impl FileData {
    fn new(bytes: Vec<u8>) -> Self {
        let now = SystemTime::now();
        Self {
            bytes,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    fn read_range(&mut self, offset: u64, len: usize) -> Bytes {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.bytes.len());
        let end = start.saturating_add(len).min(self.bytes.len());
        self.atime = SystemTime::now();
        Bytes::copy_from_slice(&self.bytes[start..end])
    }

    /// Resizes the contents to `len` bytes, zero-filling when growing.
    fn set_len(&mut self, len: u64, limit: u64) -> UfsResult<()> {
        let len = checked_len(len, limit)?;
        if let Some(extra) = len.checked_sub(self.bytes.len()) {
            self.bytes.try_reserve(extra).map_err(|_| too_large())?;
        }
        self.bytes.resize(len, 0);
        self.mtime = SystemTime::now();
        Ok(())
    }

    /// Writes `data` at `offset`, zero-filling any gap. Returns the end offset.
    fn write_range(&mut self, offset: u64, data: &[u8], limit: u64) -> UfsResult<u64> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(too_large)?;
        let end_index = checked_len(end, limit)?;
        if self.bytes.len() < end_index {
            self.set_len(end, limit)?;
        }
        self.bytes[end_index - data.len()..end_index].copy_from_slice(data);
        self.mtime = SystemTime::now();
        Ok(end)
    }

    fn stat(&self) -> FileStat {
        FileStat {
            kind: FileKind::File,
            size: self.bytes.len() as u64,
            atime: Some(self.atime),
            mtime: Some(self.mtime),
            ctime: Some(self.ctime),
        }
    }
}

type SharedFile = Arc<Mutex<FileData>>;

#[derive(Debug, Clone)]
enum Node {
    Directory { mtime: SystemTime },
    File(SharedFile),
    Symlink { target: String, ctime: SystemTime },
}

impl Node {
    fn directory() -> Self {
        Node::Directory {
            mtime: SystemTime::now(),
        }
    }

    fn kind(&self) -> FileKind {
        match self {
            Node::Directory { .. } => FileKind::Directory,
            Node::File(_) => FileKind::File,
            Node::Symlink { .. } => FileKind::Symlink,
        }
    }

    fn stat(&self) -> FileStat {
        match self {
            Node::Directory { mtime } => FileStat {
                kind: FileKind::Directory,
                size: 0,
                atime: Some(*mtime),
                mtime: Some(*mtime),
                ctime: Some(*mtime),
            },
            Node::File(data) => data.lock().stat(),
            Node::Symlink { target, ctime } => FileStat {
                kind: FileKind::Symlink,
                size: target.len() as u64,
                atime: Some(*ctime),
                mtime: Some(*ctime),
                ctime: Some(*ctime),
            },
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    data: SharedFile,
    pos: u64,
    mode: OpenMode,
}

impl OpenFile {
    fn check_readable(&self) -> UfsResult<()> {
        if self.mode.read {
            Ok(())
        } else {
            Err(not_permitted("handle is not open for reading"))
        }
    }

    fn check_writable(&self) -> UfsResult<()> {
        if self.mode.write || self.mode.append {
            Ok(())
        } else {
            Err(not_permitted("handle is not open for writing"))
        }
    }
}

fn not_permitted(msg: &'static str) -> UfsError {
    UfsError::Backend(io::Error::new(io::ErrorKind::PermissionDenied, msg))
}

fn invalid_input(msg: &'static str) -> UfsError {
    UfsError::Backend(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

/// Volatile filesystem held entirely in memory.
#[derive(Debug)]
pub struct MemoryFs {
    nodes: RwLock<BTreeMap<UfsPath, Node>>,
    handles: HandleTable<OpenFile>,
    max_file_size: u64,
}

impl MemoryFs {
    /// Creates an empty filesystem containing only the root directory.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(UfsPath::root(), Node::directory());
        Self {
            nodes: RwLock::new(nodes),
            handles: HandleTable::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    /// Sets the largest size a file may reach.
    #[must_use]
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn check_parent(nodes: &BTreeMap<UfsPath, Node>, path: &UfsPath) -> UfsResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        match nodes.get(&parent) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(_) => Err(UfsError::NotADirectory {
                path: parent.to_string(),
            }),
            None => Err(UfsError::NotFound {
                path: parent.to_string(),
            }),
        }
    }

    fn has_children(nodes: &BTreeMap<UfsPath, Node>, dir: &UfsPath) -> bool {
        let depth = dir.depth() + 1;
        nodes
            .keys()
            .any(|k| k.depth() == depth && dir.is_prefix_of(k))
    }

    fn touch_parent(nodes: &mut BTreeMap<UfsPath, Node>, path: &UfsPath) {
        if let Some(parent) = path.parent()
            && let Some(Node::Directory { mtime }) = nodes.get_mut(&parent)
        {
            *mtime = SystemTime::now();
        }
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(path: &UfsPath) -> UfsError {
    UfsError::NotFound {
        path: path.to_string(),
    }
}

#[async_trait]
impl Ufs for MemoryFs {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            symlinks: true,
            follows_links: false,
        }
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        let nodes = self.nodes.read();
        Self::check_parent(&nodes, path)?;
        nodes.get(path).map(Node::stat).ok_or_else(|| not_found(path))
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        let nodes = self.nodes.read();
        match nodes.get(path) {
            Some(Node::Directory { .. }) => {}
            Some(_) => {
                return Err(UfsError::NotADirectory {
                    path: path.to_string(),
                });
            }
            None => return Err(not_found(path)),
        }

        let depth = path.depth() + 1;
        Ok(nodes
            .iter()
            .filter(|(k, _)| k.depth() == depth && path.is_prefix_of(k))
            .filter_map(|(k, node)| {
                k.file_name().map(|name| DirEntry {
                    name: name.to_string(),
                    kind: node.kind(),
                })
            })
            .collect())
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        let data = {
            let mut nodes = self.nodes.write();
            Self::check_parent(&nodes, path)?;
            match nodes.get(path) {
                Some(Node::File(data)) => {
                    let data = Arc::clone(data);
                    if mode.truncate {
                        let mut file = data.lock();
                        file.bytes.clear();
                        file.mtime = SystemTime::now();
                    }
                    data
                }
                Some(Node::Directory { .. }) => {
                    return Err(UfsError::IsADirectory {
                        path: path.to_string(),
                    });
                }
                Some(Node::Symlink { .. }) => {
                    return Err(UfsError::Unsupported("opening a symlink"));
                }
                None if mode.create => {
                    let data = Arc::new(Mutex::new(FileData::new(Vec::new())));
                    nodes.insert(path.clone(), Node::File(Arc::clone(&data)));
                    Self::touch_parent(&mut nodes, path);
                    data
                }
                None => return Err(not_found(path)),
            }
        };

        let pos = if mode.append {
            data.lock().bytes.len() as u64
        } else {
            0
        };
        Ok(self.handles.insert(OpenFile { data, pos, mode }))
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        let mut handle = self.handles.get_mut(fh)?;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => handle.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let len = handle.data.lock().bytes.len() as u64;
                len.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| invalid_input("seek before the start of the file"))?;
        handle.pos = target;
        Ok(target)
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        let mut handle = self.handles.get_mut(fh)?;
        handle.check_readable()?;
        let OpenFile { data, pos, .. } = &mut *handle;
        let bytes = data.lock().read_range(*pos, len);
        *pos += bytes.len() as u64;
        Ok(bytes)
    }

    async fn write(&self, fh: FileHandle, buf: Bytes) -> UfsResult<usize> {
        let mut handle = self.handles.get_mut(fh)?;
        handle.check_writable()?;
        let OpenFile { data, pos, mode } = &mut *handle;
        let mut file = data.lock();
        let offset = if mode.append {
            file.bytes.len() as u64
        } else {
            *pos
        };
        *pos = file.write_range(offset, &buf, self.max_file_size)?;
        Ok(buf.len())
    }

    async fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()> {
        let handle = self.handles.get(fh)?;
        handle.check_writable()?;
        handle.data.lock().set_len(len, self.max_file_size)
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        self.handles.remove(fh).map(drop)
    }

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(UfsError::AlreadyExists {
                path: path.to_string(),
            });
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(path.clone(), Node::directory());
        Self::touch_parent(&mut nodes, path);
        Ok(())
    }

    async fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        let mut nodes = self.nodes.write();
        match nodes.get(path) {
            None => return Err(not_found(path)),
            Some(Node::Directory { .. }) => {
                return Err(UfsError::IsADirectory {
                    path: path.to_string(),
                });
            }
            Some(_) => {}
        }
        nodes.remove(path);
        Self::touch_parent(&mut nodes, path);
        Ok(())
    }

    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        if path.is_root() {
            return Err(not_permitted("cannot remove the root directory"));
        }
        let mut nodes = self.nodes.write();
        match nodes.get(path) {
            None => return Err(not_found(path)),
            Some(Node::Directory { .. }) => {}
            Some(_) => {
                return Err(UfsError::NotADirectory {
                    path: path.to_string(),
                });
            }
        }
        if Self::has_children(&nodes, path) {
            return Err(UfsError::DirectoryNotEmpty {
                path: path.to_string(),
            });
        }
        nodes.remove(path);
        Self::touch_parent(&mut nodes, path);
        Ok(())
    }

    async fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        if from.is_root() || to.is_root() {
            return Err(invalid_input("cannot rename the root directory"));
        }
        let mut nodes = self.nodes.write();
        let source_is_dir = match nodes.get(from) {
            None => return Err(not_found(from)),
            Some(node) => node.kind() == FileKind::Directory,
        };
        Self::check_parent(&nodes, to)?;
        if from == to {
            return Ok(());
        }
        if from.is_prefix_of(to) {
            return Err(invalid_input("cannot move a directory into itself"));
        }

        match nodes.get(to) {
            None => {}
            Some(Node::Directory { .. }) if source_is_dir => {
                if Self::has_children(&nodes, to) {
                    return Err(UfsError::DirectoryNotEmpty {
                        path: to.to_string(),
                    });
                }
            }
            Some(Node::Directory { .. }) => {
                return Err(UfsError::IsADirectory {
                    path: to.to_string(),
                });
            }
            Some(_) if source_is_dir => {
                return Err(UfsError::NotADirectory {
                    path: to.to_string(),
                });
            }
            Some(_) => {}
        }
        nodes.remove(to);

        let moved: Vec<UfsPath> = nodes
            .keys()
            .filter(|k| from.is_prefix_of(k))
            .cloned()
            .collect();
        for old in moved {
            let mut new = to.clone();
            if let Some(rest) = old.strip_prefix(from) {
                for segment in rest {
                    new = new.join(segment)?;
                }
            }
            if let Some(node) = nodes.remove(&old) {
                nodes.insert(new, node);
            }
        }
        Self::touch_parent(&mut nodes, from);
        Self::touch_parent(&mut nodes, to);
        Ok(())
    }

    async fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        let nodes = self.nodes.read();
        Ok(match nodes.get(path) {
            Some(Node::Symlink { target, .. }) => Some(target.clone()),
            _ => None,
        })
    }

    async fn symlink(&self, target: &str, link: &UfsPath) -> UfsResult<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(link) {
            return Err(UfsError::AlreadyExists {
                path: link.to_string(),
            });
        }
        Self::check_parent(&nodes, link)?;
        nodes.insert(
            link.clone(),
            Node::Symlink {
                target: target.to_string(),
                ctime: SystemTime::now(),
            },
        );
        Self::touch_parent(&mut nodes, link);
        Ok(())
    }

    async fn copy(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        let mut nodes = self.nodes.write();
        let bytes = match nodes.get(from) {
            Some(Node::File(data)) => data.lock().bytes.clone(),
            Some(Node::Directory { .. }) => {
                return Err(UfsError::IsADirectory {
                    path: from.to_string(),
                });
            }
            Some(Node::Symlink { .. }) => return Err(UfsError::Unsupported("copying a symlink")),
            None => return Err(not_found(from)),
        };
        if let Some(Node::Directory { .. }) = nodes.get(to) {
            return Err(UfsError::IsADirectory {
                path: to.to_string(),
            });
        }
        Self::check_parent(&nodes, to)?;
        nodes.insert(
            to.clone(),
            Node::File(Arc::new(Mutex::new(FileData::new(bytes)))),
        );
        Self::touch_parent(&mut nodes, to);
        Ok(())
    }

    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        let handle = self.handles.get(fh)?;
        handle.check_readable()?;
        Ok(handle.data.lock().read_range(offset, len))
    }

    async fn write_at(&self, fh: FileHandle, offset: u64, buf: Bytes) -> UfsResult<usize> {
        let handle = self.handles.get(fh)?;
        handle.check_writable()?;
        handle
            .data
            .lock()
            .write_range(offset, &buf, self.max_file_size)?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> UfsPath {
        UfsPath::normalize(raw).unwrap()
    }

    async fn put(fs: &MemoryFs, path: &str, content: &[u8]) {
        let fh = fs.open(&p(path), OpenMode::write()).await.unwrap();
        fs.write(fh, Bytes::copy_from_slice(content)).await.unwrap();
        fs.close(fh).await.unwrap();
    }

    async fn cat(fs: &MemoryFs, path: &str) -> Vec<u8> {
        let fh = fs.open(&p(path), OpenMode::read()).await.unwrap();
        let data = fs.read(fh, usize::MAX).await.unwrap();
        fs.close(fh).await.unwrap();
        data.to_vec()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let fs = MemoryFs::new();
        put(&fs, "/hello.txt", b"hello world").await;

        assert_eq!(cat(&fs, "/hello.txt").await, b"hello world");
        let stat = fs.stat(&p("/hello.txt")).await.unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 11);
        assert_eq!(fs.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_append_and_seek() {
        let fs = MemoryFs::new();
        put(&fs, "/log", b"one").await;

        let fh = fs.open(&p("/log"), OpenMode::append()).await.unwrap();
        fs.write(fh, Bytes::from_static(b"two")).await.unwrap();
        fs.close(fh).await.unwrap();
        assert_eq!(cat(&fs, "/log").await, b"onetwo");

        let fh = fs.open(&p("/log"), OpenMode::read()).await.unwrap();
        assert_eq!(fs.seek(fh, SeekFrom::Start(3)).await.unwrap(), 3);
        assert_eq!(&fs.read(fh, 10).await.unwrap()[..], b"two");
        assert!(fs.read(fh, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seek_relative() {
        let fs = MemoryFs::new();
        put(&fs, "/f", b"abcdef").await;
        let fh = fs.open(&p("/f"), OpenMode::read()).await.unwrap();

        assert_eq!(fs.seek(fh, SeekFrom::End(-2)).await.unwrap(), 4);
        assert_eq!(&fs.read(fh, 10).await.unwrap()[..], b"ef");
        assert_eq!(fs.seek(fh, SeekFrom::Current(-5)).await.unwrap(), 1);
        assert_eq!(&fs.read(fh, 2).await.unwrap()[..], b"bc");
        assert_eq!(fs.seek(fh, SeekFrom::End(2)).await.unwrap(), 8);
        assert!(fs.read(fh, 10).await.unwrap().is_empty());

        assert!(matches!(
            fs.seek(fh, SeekFrom::Current(-100)).await,
            Err(UfsError::Backend(e)) if e.kind() == io::ErrorKind::InvalidInput
        ));
        // A failed seek leaves the position alone.
        assert_eq!(fs.seek(fh, SeekFrom::Current(0)).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_size_limit() {
        let fs = MemoryFs::new().with_max_file_size(16);
        let fh = fs.open(&p("/f"), OpenMode::read_write().with_create(true)).await.unwrap();
        fs.write_at(fh, 0, Bytes::from_static(b"abcd")).await.unwrap();

        let is_too_large = |r: UfsResult<()>| {
            matches!(r, Err(UfsError::Backend(e)) if e.kind() == io::ErrorKind::FileTooLarge)
        };
        assert!(is_too_large(fs.truncate(fh, u64::MAX).await));
        assert!(is_too_large(fs.truncate(fh, 17).await.map(drop)));
        assert!(is_too_large(
            fs.write_at(fh, 14, Bytes::from_static(b"xyz")).await.map(drop)
        ));
        assert!(is_too_large(
            fs.write_at(fh, u64::MAX - 1, Bytes::from_static(b"xyz")).await.map(drop)
        ));
        fs.seek(fh, SeekFrom::Start(15)).await.unwrap();
        assert!(is_too_large(fs.write(fh, Bytes::from_static(b"xy")).await.map(drop)));

        // Nothing was resized by the refused calls.
        assert_eq!(fs.stat(&p("/f")).await.unwrap().size, 4);
        fs.truncate(fh, 16).await.unwrap();
        assert_eq!(fs.stat(&p("/f")).await.unwrap().size, 16);
    }

    #[tokio::test]
    async fn test_default_limit_refuses_huge_sizes() {
        let fs = MemoryFs::new();
        let fh = fs.open(&p("/f"), OpenMode::write()).await.unwrap();
        assert!(fs.truncate(fh, u64::MAX).await.is_err());
        assert!(
            fs.write_at(fh, 1 << 50, Bytes::from_static(b"x"))
                .await
                .is_err()
        );
        assert_eq!(fs.stat(&p("/f")).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_positional_io_leaves_position() {
        let fs = MemoryFs::new();
        let fh = fs.open(&p("/f"), OpenMode::read_write().with_create(true)).await.unwrap();
        fs.write_at(fh, 4, Bytes::from_static(b"xy")).await.unwrap();
        assert_eq!(&fs.read_at(fh, 0, 6).await.unwrap()[..], b"\0\0\0\0xy");
        assert_eq!(&fs.read(fh, 2).await.unwrap()[..], b"\0\0");
    }

    #[tokio::test]
    async fn test_truncate() {
        let fs = MemoryFs::new();
        put(&fs, "/f", b"abcdef").await;
        let fh = fs.open(&p("/f"), OpenMode::read_write()).await.unwrap();
        fs.truncate(fh, 2).await.unwrap();
        fs.close(fh).await.unwrap();
        assert_eq!(cat(&fs, "/f").await, b"ab");
    }

    #[tokio::test]
    async fn test_handle_modes_enforced() {
        let fs = MemoryFs::new();
        put(&fs, "/f", b"abc").await;
        let fh = fs.open(&p("/f"), OpenMode::read()).await.unwrap();
        assert!(matches!(
            fs.write(fh, Bytes::from_static(b"x")).await,
            Err(UfsError::Backend(_))
        ));
        fs.close(fh).await.unwrap();
        assert!(matches!(
            fs.close(fh).await,
            Err(UfsError::InvalidHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_open_errors() {
        let fs = MemoryFs::new();
        fs.mkdir(&p("/dir")).await.unwrap();
        assert!(matches!(
            fs.open(&p("/missing"), OpenMode::read()).await,
            Err(UfsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.open(&p("/dir"), OpenMode::read()).await,
            Err(UfsError::IsADirectory { .. })
        ));
        assert!(matches!(
            fs.open(&p("/nope/file"), OpenMode::write()).await,
            Err(UfsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_directories() {
        let fs = MemoryFs::new();
        fs.mkdir(&p("/a")).await.unwrap();
        fs.mkdir(&p("/a/b")).await.unwrap();
        put(&fs, "/a/file", b"x").await;

        let mut names: Vec<_> = fs
            .list(&p("/a"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("b".to_string(), FileKind::Directory),
                ("file".to_string(), FileKind::File)
            ]
        );

        assert!(matches!(
            fs.mkdir(&p("/a")).await,
            Err(UfsError::AlreadyExists { .. })
        ));
        assert!(matches!(
            fs.rmdir(&p("/a")).await,
            Err(UfsError::DirectoryNotEmpty { .. })
        ));
        assert!(matches!(
            fs.remove(&p("/a/b")).await,
            Err(UfsError::IsADirectory { .. })
        ));
        assert!(matches!(
            fs.rmdir(&p("/a/file")).await,
            Err(UfsError::NotADirectory { .. })
        ));
        assert!(matches!(
            fs.list(&p("/a/file")).await,
            Err(UfsError::NotADirectory { .. })
        ));

        fs.remove(&p("/a/file")).await.unwrap();
        fs.rmdir(&p("/a/b")).await.unwrap();
        fs.rmdir(&p("/a")).await.unwrap();
        assert!(fs.list(&p("/")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let fs = MemoryFs::new();
        fs.mkdir(&p("/src")).await.unwrap();
        fs.mkdir(&p("/src/inner")).await.unwrap();
        put(&fs, "/src/inner/f", b"data").await;

        fs.rename(&p("/src"), &p("/dst")).await.unwrap();
        assert!(matches!(
            fs.stat(&p("/src")).await,
            Err(UfsError::NotFound { .. })
        ));
        assert_eq!(cat(&fs, "/dst/inner/f").await, b"data");

        assert!(fs.rename(&p("/dst"), &p("/dst/inner/x")).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_replaces_file() {
        let fs = MemoryFs::new();
        put(&fs, "/a", b"new").await;
        put(&fs, "/b", b"old").await;
        fs.rename(&p("/a"), &p("/b")).await.unwrap();
        assert_eq!(cat(&fs, "/b").await, b"new");
    }

    #[tokio::test]
    async fn test_open_handle_survives_remove() {
        let fs = MemoryFs::new();
        put(&fs, "/f", b"still here").await;
        let fh = fs.open(&p("/f"), OpenMode::read()).await.unwrap();
        fs.remove(&p("/f")).await.unwrap();
        assert_eq!(&fs.read(fh, 64).await.unwrap()[..], b"still here");
    }

    #[tokio::test]
    async fn test_symlinks_are_not_followed() {
        let fs = MemoryFs::new();
        fs.mkdir(&p("/dir")).await.unwrap();
        fs.symlink("/dir", &p("/link")).await.unwrap();

        assert_eq!(
            fs.readlink(&p("/link")).await.unwrap(),
            Some("/dir".to_string())
        );
        assert_eq!(fs.readlink(&p("/dir")).await.unwrap(), None);
        assert_eq!(fs.readlink(&p("/missing")).await.unwrap(), None);
        assert_eq!(
            fs.stat(&p("/link")).await.unwrap().kind,
            FileKind::Symlink
        );
        assert!(matches!(
            fs.stat(&p("/link/x")).await,
            Err(UfsError::NotADirectory { .. })
        ));
    }

    #[tokio::test]
    async fn test_copy() {
        let fs = MemoryFs::new();
        put(&fs, "/a", b"payload").await;
        fs.copy(&p("/a"), &p("/b")).await.unwrap();
        assert_eq!(cat(&fs, "/b").await, b"payload");

        fs.mkdir(&p("/d")).await.unwrap();
        assert!(matches!(
            fs.copy(&p("/d"), &p("/e")).await,
            Err(UfsError::IsADirectory { .. })
        ));
    }
}
