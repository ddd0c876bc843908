//! Local-disk backend rooted at a host directory.
//!
//! Namespace paths map onto the host below `root`. The host kernel follows
//! symlinks on its own, so this backend reports
//! [`Capabilities::follows_links`] and should be wrapped in a
//! [`Jail`](crate::jail::Jail) whenever link targets are untrusted.
//!
//! `readlink` reports absolute host targets under `root` as namespace paths.
//! An absolute host target outside `root` has no namespace spelling and is
//! reported as [`UfsError::PathEscape`].

use async_trait::async_trait;
use bytes::Bytes;
use relative_path::RelativePathBuf;
use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{UfsError, UfsResult};
use crate::handle_table::HandleTable;
use crate::ops::{Capabilities, DirEntry, FileHandle, FileKind, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

/// Largest buffer allocated up front for one read.
const READ_CHUNK: usize = 1024 * 1024;

type SharedFile = Arc<Mutex<File>>;

#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
    handles: HandleTable<SharedFile>,
}

fn io_err(path: &UfsPath) -> impl FnOnce(io::Error) -> UfsError + '_ {
    move |e| UfsError::from_io(e, path.to_string())
}

fn kind_of(file_type: std::fs::FileType) -> FileKind {
    if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    }
}

#[cfg(unix)]
fn change_time(meta: &Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(std::time::Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn change_time(meta: &Metadata) -> Option<SystemTime> {
    meta.created().ok()
}

fn stat_from(meta: &Metadata) -> FileStat {
    FileStat {
        kind: kind_of(meta.file_type()),
        size: if meta.is_dir() { 0 } else { meta.len() },
        atime: meta.accessed().ok(),
        mtime: meta.modified().ok(),
        ctime: change_time(meta),
    }
}

impl LocalFs {
    /// Opens the host directory `root` as a backend.
    pub fn new(root: impl AsRef<Path>) -> UfsResult<Self> {
        let display = root.as_ref().display().to_string();
        let root = std::fs::canonicalize(root.as_ref()).map_err(|e| UfsError::from_io(e, &display))?;
        if !root.is_dir() {
            return Err(UfsError::NotADirectory { path: display });
        }
        debug!(root = %root.display(), "Opened local backend");
        Ok(Self {
            root,
            handles: HandleTable::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host(&self, path: &UfsPath) -> PathBuf {
        path.to_host_path(&self.root)
    }

    fn file(&self, fh: FileHandle) -> UfsResult<SharedFile> {
        self.handles.get_cloned(fh)
    }

    fn link_to_namespace(&self, link: &UfsPath, target: &Path) -> UfsResult<String> {
        if target.is_absolute() {
            let Ok(inside) = target.strip_prefix(&self.root) else {
                warn!(link = %link, host_target = %target.display(), "Host symlink points outside backend root");
                return Err(UfsError::escape(link));
            };
            let relative = RelativePathBuf::from_path(inside).map_err(|_| non_utf8(link))?;
            Ok(format!("/{relative}"))
        } else {
            target.to_str().map(str::to_string).ok_or_else(|| non_utf8(link))
        }
    }
}

fn non_utf8(path: &UfsPath) -> UfsError {
    UfsError::Backend(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("symlink target of {path} is not valid UTF-8"),
    ))
}

async fn read_from(file: &mut File, len: usize) -> io::Result<Bytes> {
    let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
    file.take(len as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[async_trait]
impl Ufs for LocalFs {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            symlinks: cfg!(unix),
            follows_links: true,
        }
    }

    async fn stat(&self, path: &UfsPath) -> UfsResult<FileStat> {
        let meta = fs::metadata(self.host(path)).await.map_err(io_err(path))?;
        Ok(stat_from(&meta))
    }

    async fn list(&self, path: &UfsPath) -> UfsResult<Vec<DirEntry>> {
        let mut dir = fs::read_dir(self.host(path)).await.map_err(io_err(path))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err(path))? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(dir = %path, "Skipping entry with non UTF-8 name");
                continue;
            };
            let kind = kind_of(entry.file_type().await.map_err(io_err(path))?);
            entries.push(DirEntry { name, kind });
        }
        Ok(entries)
    }

    async fn open(&self, path: &UfsPath, mode: OpenMode) -> UfsResult<FileHandle> {
        let file = OpenOptions::new()
            .read(mode.read)
            .write(mode.write && !mode.append)
            .append(mode.append)
            .create(mode.create)
            .truncate(mode.truncate)
            .open(self.host(path))
            .await
            .map_err(io_err(path))?;
        if file.metadata().await.map_err(io_err(path))?.is_dir() {
            return Err(UfsError::IsADirectory {
                path: path.to_string(),
            });
        }
        Ok(self.handles.insert(Arc::new(Mutex::new(file))))
    }

    async fn seek(&self, fh: FileHandle, pos: SeekFrom) -> UfsResult<u64> {
        let file = self.file(fh)?;
        let mut file = file.lock().await;
        Ok(file.seek(pos).await?)
    }

    async fn read(&self, fh: FileHandle, len: usize) -> UfsResult<Bytes> {
        let file = self.file(fh)?;
        let mut file = file.lock().await;
        Ok(read_from(&mut file, len).await?)
    }

    async fn write(&self, fh: FileHandle, data: Bytes) -> UfsResult<usize> {
        let file = self.file(fh)?;
        let mut file = file.lock().await;
        file.write_all(&data).await?;
        Ok(data.len())
    }

    async fn truncate(&self, fh: FileHandle, len: u64) -> UfsResult<()> {
        let file = self.file(fh)?;
        let file = file.lock().await;
        Ok(file.set_len(len).await?)
    }

    async fn flush(&self, fh: FileHandle) -> UfsResult<()> {
        let file = self.file(fh)?;
        let mut file = file.lock().await;
        file.flush().await?;
        Ok(file.sync_data().await?)
    }

    async fn close(&self, fh: FileHandle) -> UfsResult<()> {
        let file = self.handles.remove(fh)?;
        let mut file = file.lock().await;
        Ok(file.flush().await?)
    }

    async fn read_at(&self, fh: FileHandle, offset: u64, len: usize) -> UfsResult<Bytes> {
        let file = self.file(fh)?;
        let mut file = file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(read_from(&mut file, len).await?)
    }

    async fn write_at(&self, fh: FileHandle, offset: u64, data: Bytes) -> UfsResult<usize> {
        let file = self.file(fh)?;
        let mut file = file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        Ok(data.len())
    }

    async fn mkdir(&self, path: &UfsPath) -> UfsResult<()> {
        fs::create_dir(self.host(path)).await.map_err(io_err(path))
    }

    async fn remove(&self, path: &UfsPath) -> UfsResult<()> {
        let host = self.host(path);
        let meta = fs::symlink_metadata(&host).await.map_err(io_err(path))?;
        if meta.is_dir() {
            return Err(UfsError::IsADirectory {
                path: path.to_string(),
            });
        }
        fs::remove_file(host).await.map_err(io_err(path))
    }

    async fn rmdir(&self, path: &UfsPath) -> UfsResult<()> {
        if path.is_root() {
            return Err(UfsError::Backend(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cannot remove the backend root",
            )));
        }
        fs::remove_dir(self.host(path)).await.map_err(io_err(path))
    }

    async fn rename(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        if from.is_root() || to.is_root() {
            return Err(UfsError::Backend(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot rename the backend root",
            )));
        }
        fs::rename(self.host(from), self.host(to))
            .await
            .map_err(io_err(from))
    }

    async fn readlink(&self, path: &UfsPath) -> UfsResult<Option<String>> {
        let host = self.host(path);
        let meta = match fs::symlink_metadata(&host).await {
            Ok(meta) => meta,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(UfsError::from_io(e, path.to_string())),
        };
        if !meta.file_type().is_symlink() {
            return Ok(None);
        }
        let target = fs::read_link(&host).await.map_err(io_err(path))?;
        self.link_to_namespace(path, &target).map(Some)
    }

    #[cfg(unix)]
    async fn symlink(&self, target: &str, link: &UfsPath) -> UfsResult<()> {
        let host_target = if target.starts_with('/') {
            UfsPath::normalize(target)?.to_host_path(&self.root)
        } else {
            PathBuf::from(target)
        };
        fs::symlink(host_target, self.host(link))
            .await
            .map_err(io_err(link))
    }

    async fn copy(&self, from: &UfsPath, to: &UfsPath) -> UfsResult<()> {
        if !self.stat(from).await?.is_file() {
            return Err(UfsError::IsADirectory {
                path: from.to_string(),
            });
        }
        fs::copy(self.host(from), self.host(to))
            .await
            .map(drop)
            .map_err(io_err(from))
    }
}
