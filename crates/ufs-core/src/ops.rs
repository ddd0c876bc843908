//! The operation contract every backend and decorator implements.
//!
//! [`Ufs`] is object safe and async; stacks are built as `Arc<dyn Ufs>` and
//! decorators hold the layer below them the same way. Path arguments are
//! already-normalized [`UfsPath`]s; handles are opaque [`FileHandle`]s issued
//! by the backend's `open`.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io::SeekFrom;
use std::time::SystemTime;

use crate::error::{UfsError, UfsResult};
use crate::path::UfsPath;

/// Chunk size used by the default streaming [`Ufs::copy`].
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// What a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Metadata for a single entry.
///
/// Timestamps are optional since not every backend records them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
}

impl FileStat {
    /// A stat with only kind and size set.
    pub fn new(kind: FileKind, size: u64) -> Self {
        Self {
            kind,
            size,
            atime: None,
            mtime: None,
            ctime: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Opaque handle to an open file. Backends never issue `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(pub u64);

impl FileHandle {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fh-{}", self.0)
    }
}

/// How a file is opened.
///
/// The named constructors correspond to the classic mode strings:
///
/// | constructor          | mode  |
/// |----------------------|-------|
/// | [`read`](Self::read)             | `rb`  |
/// | [`write`](Self::write)           | `wb`  |
/// | [`append`](Self::append)         | `ab`  |
/// | [`read_write`](Self::read_write) | `rb+` |
/// | [`read_append`](Self::read_append) | `ab+` |
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenMode {
    /// Read an existing file.
    pub fn read() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Create or truncate, then write.
    pub fn write() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    /// Create if missing, then write at the end.
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            create: true,
            ..Self::default()
        }
    }

    /// Read and write an existing file.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Create if missing, read anywhere, write at the end.
    pub fn read_append() -> Self {
        Self {
            read: true,
            write: true,
            append: true,
            create: true,
            ..Self::default()
        }
    }

    /// Parses a mode string (`rb`, `wb`, `ab`, `rb+`, `ab+`; the `b` is optional).
    pub fn parse(mode: &str) -> UfsResult<Self> {
        match mode.replace('b', "").as_str() {
            "r" => Ok(Self::read()),
            "w" => Ok(Self::write()),
            "a" => Ok(Self::append()),
            "r+" => Ok(Self::read_write()),
            "a+" => Ok(Self::read_append()),
            "w+" => Ok(Self {
                read: true,
                ..Self::write()
            }),
            _ => Err(UfsError::Unsupported("open mode")),
        }
    }

    #[must_use]
    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    #[must_use]
    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Returns true if opening with this mode can change the namespace or
    /// file contents.
    pub fn is_mutating(&self) -> bool {
        self.write || self.append || self.create || self.truncate
    }
}

/// What a backend can do beyond the required verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// The backend stores symlinks and answers `readlink`.
    pub symlinks: bool,
    /// The backend follows symlinks on its own when given a path, as a host
    /// filesystem does.
    pub follows_links: bool,
}

/// The operation contract.
///
/// Required verbs cover the namespace and handle I/O. The remaining verbs
/// have defaults expressed in terms of the required ones, or report
/// [`UfsError::Unsupported`].
#[async_trait]
pub trait Ufs: Send + Sync + fmt::Debug {
    /// Capabilities of this layer.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called once before the first operation.
    async fn start(&self) -> UfsResult<()> {
        Ok(())
    }

    /// Called once after the last operation.
    async fn stop(&self) -> UfsResult<()> {
        Ok(())
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat>;

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>>;

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle>;

    /// Moves the handle's position; returns the new position.
    ///
    /// Seeking past the end is allowed. Seeking before the start fails.
    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64>;

    /// Reads up to `len` bytes at the handle's position. Empty means EOF.
    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes>;

    /// Writes `data` at the handle's position; returns the bytes written.
    async fn write(&self, fh: FileHandle, data: Bytes) -> UfsResult<usize>;

    async fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()>;

    async fn flush(&self, _fh: FileHandle) -> UfsResult<()> {
        Ok(())
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()>;

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()>;

    /// Removes a file or symlink.
    async fn remove(&self, path: &UfsPath) -> UfsResult<()>;

    /// Removes an empty directory.
    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()>;

    /// Moves a file. Without a native implementation this copies the file
    /// and then removes the source, so it only works for files.
    async fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        self.copy(from, to).await?;
        self.remove(from).await
    }

    /// The target of the symlink at `path`, without following it.
    ///
    /// `Ok(None)` means "not a symlink", including when nothing exists at
    /// `path`.
    async fn readlink(&self, _path: &UfsPath) -> UfsResult<Option<String>> {
        Ok(None)
    }

    /// Creates a symlink at `link` pointing to `target`.
    ///
    /// An absolute `target` is a path in this backend's namespace; a
    /// relative one is resolved from the link's parent directory.
    async fn symlink(&self, _target: &str, _link: &UfsPath) -> UfsResult<()> {
        Err(UfsError::Unsupported("symlink"))
    }

    /// Copies a file by streaming it through `open`/`read`/`write`,
    /// replacing `to` if it exists.
    async fn copy(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        if !self.stat(from).await?.is_file() {
            return Err(UfsError::IsADirectory {
                path: from.to_string(),
            });
        }
        let src = self.open(from, OpenMode::read()).await?;
        let dst = match self.open(to, OpenMode::write()).await {
            Ok(dst) => dst,
            Err(e) => {
                let _ = self.close(src).await;
                return Err(e);
            }
        };

        let result = async {
            loop {
                let chunk = self.read(src, COPY_CHUNK_SIZE).await?;
                if chunk.is_empty() {
                    break;
                }
                self.write(dst, chunk).await?;
            }
            Ok::<(), UfsError>(())
        }
        .await;

        let closed_src = self.close(src).await;
        let closed_dst = self.close(dst).await;
        result.and(closed_src).and(closed_dst)
    }

    /// Reads up to `len` bytes at `offset`.
    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        self.seek(fh, SeekFrom::Start(offset)).await?;
        self.read(fh, len).await
    }

    /// Writes `data` at `offset`.
    async fn write_at(&self, fh: FileHandle, offset: u64, data: Bytes) -> UfsResult<usize> {
        self.seek(fh, SeekFrom::Start(offset)).await?;
        self.write(fh, data).await
    }
}
