//! Absolute, normalized paths in a backend's namespace.
//!
//! A [`UfsPath`] is a sequence of non-empty segments, none of which is `.` or
//! `..`. It is always absolute: `Display` renders it with a leading `/`, and
//! the empty sequence is the root. Normalization is idempotent, and nothing
//! can climb above the root: a `..` with nothing left to pop is rejected
//! rather than clamped.
//!
//! # Examples
//!
//! ```
//! use ufs_core::UfsPath;
//!
//! let path = UfsPath::normalize("/data//reports/./2024/../q1.csv").unwrap();
//! assert_eq!(path.to_string(), "/data/reports/q1.csv");
//! assert_eq!(path.file_name(), Some("q1.csv"));
//!
//! // `..` above the root is an error, not a no-op
//! assert!(UfsPath::normalize("/../etc").is_err());
//!
//! // Fragments are joined relative to the base and may not be absolute
//! let base = UfsPath::normalize("/data").unwrap();
//! assert_eq!(base.join("a/b").unwrap().to_string(), "/data/a/b");
//! assert!(base.join("/etc/passwd").is_err());
//! ```

use relative_path::{Component, RelativePath, RelativePathBuf};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PathError, UfsError, UfsResult};

/// Longest accepted segment, in bytes.
pub const MAX_SEGMENT_LEN: usize = 255;

/// An absolute, normalized path.
///
/// Stored as the relative form (`a/b`) of the absolute path (`/a/b`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UfsPath(RelativePathBuf);

impl UfsPath {
    /// The root path (`/`).
    #[inline]
    pub fn root() -> Self {
        UfsPath(RelativePathBuf::new())
    }

    /// Normalizes a raw path string.
    ///
    /// Leading and repeated `/` are ignored, `.` segments are dropped and
    /// `..` pops the previous segment. A relative raw path is taken relative
    /// to the root.
    pub fn normalize(raw: &str) -> UfsResult<Self> {
        if raw.is_empty() {
            return Err(UfsError::invalid_path(raw, PathError::Empty));
        }
        Self::root().apply(raw, raw)
    }

    /// Joins a relative fragment onto this path.
    ///
    /// `..` in the fragment may pop segments of `self`, but never past the
    /// root. An absolute fragment is rejected instead of replacing the base.
    pub fn join(&self, fragment: &str) -> UfsResult<Self> {
        if fragment.starts_with('/') {
            return Err(UfsError::invalid_path(fragment, PathError::AbsoluteFragment));
        }
        self.apply(fragment, fragment)
    }

    fn apply(&self, fragment: &str, raw: &str) -> UfsResult<Self> {
        if fragment.contains('\0') {
            return Err(UfsError::invalid_path(raw, PathError::NulByte));
        }

        let mut segments: Vec<&str> = self.segments().collect();
        for component in RelativePath::new(fragment.trim_start_matches('/')).components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if segments.pop().is_none() {
                        return Err(UfsError::invalid_path(raw, PathError::AboveRoot));
                    }
                }
                Component::Normal(name) => {
                    if name.len() > MAX_SEGMENT_LEN {
                        return Err(UfsError::invalid_path(raw, PathError::SegmentTooLong));
                    }
                    segments.push(name);
                }
            }
        }
        Ok(Self::from_segments(segments))
    }

    fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Self {
        let mut buf = RelativePathBuf::new();
        for segment in segments {
            buf.push(segment);
        }
        UfsPath(buf)
    }

    /// Returns true if this is the root path.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    /// The relative form of this path, without the leading `/`.
    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The segments of this path, root first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Number of segments; zero for the root.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<UfsPath> {
        if self.is_root() {
            return None;
        }
        self.0.parent().map(|p| UfsPath(p.to_relative_path_buf()))
    }

    /// The last segment, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    /// Returns true if `self`'s segments are a prefix of `other`'s.
    ///
    /// Comparison is segment-wise, so `/jail` is not a prefix of `/jailbreak`.
    pub fn is_prefix_of(&self, other: &UfsPath) -> bool {
        let mut theirs = other.segments();
        self.segments().all(|mine| theirs.next() == Some(mine))
    }

    /// The segments of `self` that follow `base`, if `base` is a prefix.
    pub fn strip_prefix(&self, base: &UfsPath) -> Option<impl Iterator<Item = &str>> {
        if !base.is_prefix_of(self) {
            return None;
        }
        Some(self.segments().skip(base.depth()))
    }

    /// Maps this path onto a host directory.
    pub fn to_host_path(&self, base: &Path) -> PathBuf {
        self.0.to_logical_path(base)
    }
}

impl Default for UfsPath {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for UfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl FromStr for UfsPath {
    type Err = UfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

impl TryFrom<&str> for UfsPath {
    type Error = UfsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::normalize(s)
    }
}
