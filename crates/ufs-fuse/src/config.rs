//! Mount configuration for the FUSE filesystem.
//!
//! Tunes how long the kernel may cache attributes, how long one callback
//! may wait on the backend, and how many requests the core admits at once.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use ufs_core::scheduler::{DEFAULT_MAX_IN_FLIGHT, SchedulerConfig};

/// Default attribute TTL for remote backends.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(10);

/// Attribute TTL for local backends.
pub const LOCAL_ATTR_TTL: Duration = Duration::from_secs(1);

/// Default I/O timeout for network backends (30 seconds).
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// I/O timeout for local backends (10 seconds).
pub const LOCAL_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration options for a mount.
///
/// Default configuration suits slow or remote backends. Use
/// [`MountConfig::local()`] for a backend on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// How long the kernel may cache attributes and entries.
    #[serde(with = "humantime_serde")]
    pub attr_ttl: Duration,

    /// Timeout for one kernel callback.
    ///
    /// A callback that exceeds it fails with ETIMEDOUT, so a stalled backend
    /// cannot hang processes using the mount forever.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Requests admitted into the core at once. Callbacks beyond this wait.
    pub max_in_flight: usize,

    /// Owner reported for every entry. Defaults to the mounting user.
    pub uid: Option<u32>,

    /// Group reported for every entry. Defaults to the mounting user's group.
    pub gid: Option<u32>,

    /// Mount read-only.
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            uid: None,
            gid: None,
            read_only: false,
        }
    }
}

impl MountConfig {
    /// Creates a configuration for a backend on local disk, with a short
    /// attribute TTL and I/O timeout.
    pub fn local() -> Self {
        Self {
            attr_ttl: LOCAL_ATTR_TTL,
            io_timeout: LOCAL_IO_TIMEOUT,
            ..Self::default()
        }
    }

    /// Sets the kernel cache TTL for attributes.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the I/O timeout for individual operations.
    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    /// Sets the owner reported for every entry.
    #[must_use]
    pub fn ownership(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The scheduler settings this mount implies.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default().with_max_in_flight(self.max_in_flight)
    }

    /// Owner to report, falling back to the current process.
    pub fn effective_uid(&self) -> u32 {
        // SAFETY: getuid cannot fail and has no preconditions.
        self.uid.unwrap_or_else(|| unsafe { libc::getuid() })
    }

    /// Group to report, falling back to the current process.
    pub fn effective_gid(&self) -> u32 {
        // SAFETY: getgid cannot fail and has no preconditions.
        self.gid.unwrap_or_else(|| unsafe { libc::getgid() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_suits_remote_backends() {
        let config = MountConfig::default();
        assert_eq!(config.attr_ttl, Duration::from_secs(10));
        assert_eq!(config.io_timeout, Duration::from_secs(30));
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert!(!config.read_only);
    }

    #[test]
    fn test_local_mode() {
        let config = MountConfig::local();
        assert_eq!(config.attr_ttl, Duration::from_secs(1));
        assert_eq!(config.io_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_pattern() {
        let config = MountConfig::default()
            .attr_ttl(Duration::from_secs(120))
            .max_in_flight(16)
            .io_timeout(Duration::from_secs(60))
            .ownership(1000, 100)
            .read_only(true);
        assert_eq!(config.attr_ttl, Duration::from_secs(120));
        assert_eq!(config.max_in_flight, 16);
        assert_eq!(config.io_timeout, Duration::from_secs(60));
        assert_eq!(config.effective_uid(), 1000);
        assert_eq!(config.effective_gid(), 100);
        assert!(config.read_only);
        assert_eq!(config.scheduler_config().max_in_flight, 16);
    }

    #[test]
    fn test_serde_durations() {
        let config: MountConfig =
            serde_json::from_str(r#"{"attr_ttl": "500ms", "io_timeout": "2m", "read_only": true}"#)
                .unwrap();
        assert_eq!(config.attr_ttl, Duration::from_millis(500));
        assert_eq!(config.io_timeout, Duration::from_secs(120));
        assert!(config.read_only);
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
    }
}
