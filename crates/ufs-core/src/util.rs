//! Tree and transfer helpers over any pair of backends.
//!
//! Everything here is written against `&dyn Ufs`, so a source and a
//! destination may be different backends (memory to disk, one jail to
//! another). When both sides are the same object the backend's own `copy`
//! and `rename` are used instead of streaming.
//!
//! ```
//! use bytes::Bytes;
//! use futures::stream;
//! use ufs_core::util::{self, WalkOrder};
//! use ufs_core::{MemoryFs, Ufs, UfsPath};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ufs_core::UfsResult<()> {
//! let src = MemoryFs::new();
//! let dst = MemoryFs::new();
//! let dir = UfsPath::normalize("/docs")?;
//! src.mkdir(&dir).await?;
//! util::put(&src, &dir.join("a.txt")?, stream::iter([Ok(Bytes::from_static(b"hi"))])).await?;
//!
//! util::copytree(&src, &dir, &dst, &UfsPath::normalize("/backup")?, false).await?;
//! let copied = util::walk(&dst, &UfsPath::normalize("/backup")?, WalkOrder::DirsFirst).await?;
//! assert_eq!(copied.len(), 2);
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use std::io;
use tracing::{debug, trace};

use crate::error::{UfsError, UfsResult};
use crate::ops::{COPY_CHUNK_SIZE, FileHandle, FileKind, FileStat, OpenMode, Ufs};
use crate::path::UfsPath;

/// Where directories appear relative to their contents in a [`walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    /// A directory comes before everything under it.
    DirsFirst,
    /// A directory comes after everything under it, the order `rmtree`
    /// needs.
    DirsLast,
}

fn same_backend(a: &dyn Ufs, b: &dyn Ufs) -> bool {
    std::ptr::addr_eq(a as *const dyn Ufs, b as *const dyn Ufs)
}

fn into_itself(src: &UfsPath, dst: &UfsPath) -> UfsError {
    UfsError::Backend(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot move {src} into itself at {dst}"),
    ))
}

/// Maps `path`, which lies under `from`, to the same place under `to`.
fn rebase(path: &UfsPath, from: &UfsPath, to: &UfsPath) -> UfsResult<UfsPath> {
    let mut rebased = to.clone();
    if let Some(rest) = path.strip_prefix(from) {
        for segment in rest {
            rebased = rebased.join(segment)?;
        }
    }
    Ok(rebased)
}

enum Pending {
    Visit(UfsPath),
    Leave(UfsPath, FileStat),
}

/// Lists `path` and everything under it, depth first, with entries of a
/// directory in name order.
///
/// Symlinks found inside the tree are reported with kind
/// [`FileKind::Symlink`] and never descended into. The whole tree is listed
/// before anything is returned.
pub async fn walk(
    fs: &dyn Ufs,
    path: &UfsPath,
    order: WalkOrder,
) -> UfsResult<Vec<(UfsPath, FileStat)>> {
    let mut found = Vec::new();
    let mut stack = vec![Pending::Visit(path.clone())];

    while let Some(pending) = stack.pop() {
        let path = match pending {
            Pending::Leave(path, stat) => {
                found.push((path, stat));
                continue;
            }
            Pending::Visit(path) => path,
        };

        let stat = fs.stat(&path).await?;
        if !stat.is_dir() {
            found.push((path, stat));
            continue;
        }

        let mut entries = fs.list(&path).await?;
        // Reversed, so popping visits names in ascending order.
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        match order {
            WalkOrder::DirsFirst => found.push((path.clone(), stat)),
            WalkOrder::DirsLast => stack.push(Pending::Leave(path.clone(), stat)),
        }

        for entry in entries {
            let child = path.join(&entry.name)?;
            if entry.kind == FileKind::Symlink {
                let size = fs.readlink(&child).await?.map_or(0, |t| t.len() as u64);
                stack.push(Pending::Leave(child, FileStat::new(FileKind::Symlink, size)));
            } else {
                stack.push(Pending::Visit(child));
            }
        }
    }
    Ok(found)
}

/// Streams the contents of the file at `path` in chunks.
///
/// The handle is closed when the stream reaches the end or its first error;
/// a stream dropped before that leaves the handle open.
pub fn cat<'a>(
    fs: &'a dyn Ufs,
    path: &'a UfsPath,
) -> impl Stream<Item = UfsResult<Bytes>> + Send + 'a {
    stream::try_unfold(None, move |fh: Option<FileHandle>| async move {
        let fh = match fh {
            Some(fh) => fh,
            None => fs.open(path, OpenMode::read()).await?,
        };
        match fs.read(fh, COPY_CHUNK_SIZE).await {
            Ok(chunk) if chunk.is_empty() => {
                fs.close(fh).await?;
                Ok::<_, UfsError>(None)
            }
            Ok(chunk) => Ok(Some((chunk, Some(fh)))),
            Err(e) => {
                let _ = fs.close(fh).await;
                Err(e)
            }
        }
    })
}

/// Writes every chunk of `data` to the file at `path`, creating or
/// truncating it. Returns the number of bytes written.
pub async fn put<S>(fs: &dyn Ufs, path: &UfsPath, data: S) -> UfsResult<u64>
where
    S: Stream<Item = UfsResult<Bytes>> + Send,
{
    let fh = fs.open(path, OpenMode::write()).await?;
    let result = async {
        let mut data = std::pin::pin!(data);
        let mut written = 0u64;
        while let Some(chunk) = data.next().await {
            written += fs.write(fh, chunk?).await? as u64;
        }
        Ok::<u64, UfsError>(written)
    }
    .await;
    let closed = fs.close(fh).await;
    let written = result?;
    closed?;
    Ok(written)
}

/// Copies one file, possibly between backends.
pub async fn copyfile(
    src_fs: &dyn Ufs,
    src: &UfsPath,
    dst_fs: &dyn Ufs,
    dst: &UfsPath,
) -> UfsResult<()> {
    if same_backend(src_fs, dst_fs) {
        return src_fs.copy(src, dst).await;
    }
    trace!(src = %src, dst = %dst, "Streaming file between backends");
    put(dst_fs, dst, cat(src_fs, src)).await.map(drop)
}

/// Copies the tree at `src` to `dst`, creating `dst` itself.
///
/// With `exists_ok`, directories that already exist on the destination are
/// reused; files are always overwritten. Symlinks are recreated with the
/// same target.
pub async fn copytree(
    src_fs: &dyn Ufs,
    src: &UfsPath,
    dst_fs: &dyn Ufs,
    dst: &UfsPath,
    exists_ok: bool,
) -> UfsResult<()> {
    let entries = walk(src_fs, src, WalkOrder::DirsFirst).await?;
    debug!(src = %src, dst = %dst, entries = entries.len(), "Copying tree");
    for (path, stat) in entries {
        let target = rebase(&path, src, dst)?;
        match stat.kind {
            FileKind::Directory => match dst_fs.mkdir(&target).await {
                Err(UfsError::AlreadyExists { .. }) if exists_ok => {}
                other => other?,
            },
            FileKind::File => copyfile(src_fs, &path, dst_fs, &target).await?,
            FileKind::Symlink => {
                if let Some(link_target) = src_fs.readlink(&path).await? {
                    dst_fs.symlink(&link_target, &target).await?;
                }
            }
        }
    }
    Ok(())
}

/// Copies a file or a tree. When `dst` is an existing directory the source
/// is copied into it under its own name.
pub async fn copy(
    src_fs: &dyn Ufs,
    src: &UfsPath,
    dst_fs: &dyn Ufs,
    dst: &UfsPath,
) -> UfsResult<UfsPath> {
    let src_stat = src_fs.stat(src).await?;
    let dst = match dst_fs.stat(dst).await {
        Ok(stat) if stat.is_dir() => match src.file_name() {
            Some(name) => dst.join(name)?,
            None => dst.clone(),
        },
        Ok(_) | Err(UfsError::NotFound { .. }) => dst.clone(),
        Err(e) => return Err(e),
    };
    if src_stat.is_dir() {
        copytree(src_fs, src, dst_fs, &dst, false).await?;
    } else {
        copyfile(src_fs, src, dst_fs, &dst).await?;
    }
    Ok(dst)
}

/// Removes `path` and everything under it.
pub async fn rmtree(fs: &dyn Ufs, path: &UfsPath) -> UfsResult<()> {
    for (entry, stat) in walk(fs, path, WalkOrder::DirsLast).await? {
        if stat.is_dir() {
            fs.rmdir(&entry).await?;
        } else {
            fs.remove(&entry).await?;
        }
    }
    Ok(())
}

/// Moves one file. Within a backend this is a rename; across backends the
/// file is copied and the source removed.
pub async fn move_file(
    src_fs: &dyn Ufs,
    src: &UfsPath,
    dst_fs: &dyn Ufs,
    dst: &UfsPath,
) -> UfsResult<()> {
    if same_backend(src_fs, dst_fs) {
        if src.is_prefix_of(dst) {
            return Err(into_itself(src, dst));
        }
        return src_fs.rename(src, dst).await;
    }
    copyfile(src_fs, src, dst_fs, dst).await?;
    src_fs.remove(src).await
}

/// Moves a file or a tree by copying it, then removing the source.
/// Returns where the source ended up.
pub async fn move_path(
    src_fs: &dyn Ufs,
    src: &UfsPath,
    dst_fs: &dyn Ufs,
    dst: &UfsPath,
) -> UfsResult<UfsPath> {
    if same_backend(src_fs, dst_fs) && src.is_prefix_of(dst) {
        return Err(into_itself(src, dst));
    }
    let moved = copy(src_fs, src, dst_fs, dst).await?;
    rmtree(src_fs, src).await?;
    Ok(moved)
}
