//! Shared fixtures for ufs-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ufs_core::testing::{LatencyFs, RecordingFs};
use ufs_core::{Jail, MemoryFs, OpenMode, Ufs, UfsPath};

pub const JAIL_ROOT: &str = "/jail";
pub const SECRET: &[u8] = b"root:x:0:0";

pub fn p(raw: &str) -> UfsPath {
    UfsPath::normalize(raw).unwrap()
}

pub async fn write_file(fs: &dyn Ufs, path: &str, content: &[u8]) {
    let fh = fs.open(&p(path), OpenMode::write()).await.unwrap();
    fs.write(fh, bytes::Bytes::copy_from_slice(content))
        .await
        .unwrap();
    fs.close(fh).await.unwrap();
}

pub async fn read_file(fs: &dyn Ufs, path: &str) -> Vec<u8> {
    let fh = fs.open(&p(path), OpenMode::read()).await.unwrap();
    let data = fs.read(fh, usize::MAX).await.unwrap();
    fs.close(fh).await.unwrap();
    data.to_vec()
}

/// A memory backend laid out as:
///
/// ```text
/// /etc/passwd
/// /jail/sub/file
/// /jail/readme
/// ```
pub async fn populated_memory() -> Arc<MemoryFs> {
    let fs = Arc::new(MemoryFs::new());
    for dir in ["/etc", "/jail", "/jail/sub"] {
        fs.mkdir(&p(dir)).await.unwrap();
    }
    write_file(fs.as_ref(), "/etc/passwd", SECRET).await;
    write_file(fs.as_ref(), "/jail/sub/file", b"inside").await;
    write_file(fs.as_ref(), "/jail/readme", b"hello").await;
    fs
}

/// A jail at [`JAIL_ROOT`] over a recording backend, so tests can count
/// what reached the backend.
pub async fn recording_jail() -> (Arc<RecordingFs>, Jail) {
    let recording = Arc::new(RecordingFs::new(populated_memory().await));
    let jail = Jail::new(Arc::clone(&recording) as Arc<dyn Ufs>, p(JAIL_ROOT));
    (recording, jail)
}

pub fn latency_memory() -> Arc<LatencyFs> {
    Arc::new(LatencyFs::new(Arc::new(MemoryFs::new())))
}
