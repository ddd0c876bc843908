//! Test mount harness for FUSE integration tests.
//!
//! [`TestMount`] mounts a jailed backend stack on a temporary directory and
//! unmounts it on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use ufs_core::{BackendConfig, BackendRegistry, Jail, MemoryFs, Ufs, UfsPath};
use ufs_fuse::{MountConfig, MountHandle};

/// How long to wait for mount to become ready.
const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait between mount readiness checks.
const MOUNT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Path the test stacks are jailed to.
pub const JAIL_ROOT: &str = "/share";

/// A mounted stack for testing.
pub struct TestMount {
    handle: Option<MountHandle>,
    /// Path where the stack is mounted.
    pub mount_path: PathBuf,
    /// Host directory behind a local stack.
    pub backing: Option<PathBuf>,
    _temp: TempDir,
}

impl TestMount {
    /// Mounts a local directory jailed to [`JAIL_ROOT`].
    pub fn with_local_jail() -> Result<Self, String> {
        Self::with_local_jail_config(MountConfig::local())
    }

    pub fn with_local_jail_config(config: MountConfig) -> Result<Self, String> {
        let temp = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let backing = temp.path().join("backing");
        fs::create_dir_all(backing.join(JAIL_ROOT.trim_start_matches('/')))
            .map_err(|e| format!("Failed to create backing dir: {e}"))?;

        let stack = BackendConfig::Local {
            root: backing.clone(),
        }
        .jailed(JAIL_ROOT);
        let fs = BackendRegistry::new()
            .build(&stack)
            .map_err(|e| format!("Failed to build stack: {e}"))?;
        Self::mount(fs, temp, Some(backing), &config)
    }

    /// Mounts an in-memory stack jailed to [`JAIL_ROOT`].
    pub fn with_memory_jail() -> Result<Self, String> {
        let temp = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let root = UfsPath::normalize(JAIL_ROOT).map_err(|e| e.to_string())?;

        let memory = Arc::new(MemoryFs::new());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| e.to_string())?;
        rt.block_on(memory.mkdir(&root))
            .map_err(|e| format!("Failed to create jail root: {e}"))?;

        let stack: Arc<dyn Ufs> = Arc::new(Jail::new(memory, root));
        Self::mount(stack, temp, None, &MountConfig::default())
    }

    fn mount(
        stack: Arc<dyn Ufs>,
        temp: TempDir,
        backing: Option<PathBuf>,
        config: &MountConfig,
    ) -> Result<Self, String> {
        let mount_path = temp.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let root = UfsPath::normalize(JAIL_ROOT).map_err(|e| e.to_string())?;
        let handle = ufs_fuse::mount(stack, root, &mount_path, "ufs-test", config)
            .map_err(|e| format!("Failed to mount: {e}"))?;

        wait_for_mount(&mount_path)?;

        Ok(Self {
            handle: Some(handle),
            mount_path,
            backing,
            _temp: temp,
        })
    }

    /// Path of `rel` inside the mount.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.mount_path.join(rel)
    }

    /// Path of `rel` inside the jail on the host, for local stacks.
    pub fn backing_path(&self, rel: &str) -> PathBuf {
        self.backing
            .as_ref()
            .expect("not a local mount")
            .join(JAIL_ROOT.trim_start_matches('/'))
            .join(rel)
    }

    pub fn write(&self, rel: &str, content: &[u8]) -> io::Result<()> {
        fs::write(self.path(rel), content)
    }

    pub fn read(&self, rel: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(rel))
    }

    pub fn handle(&self) -> &MountHandle {
        self.handle.as_ref().expect("mounted")
    }

    /// Unmounts explicitly and reports the outcome.
    pub fn unmount(mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.unmount(),
            None => Ok(()),
        }
    }
}

fn wait_for_mount(mount_path: &Path) -> Result<(), String> {
    let start = Instant::now();
    while start.elapsed() < MOUNT_READY_TIMEOUT {
        if fs::read_dir(mount_path).is_ok() {
            return Ok(());
        }
        thread::sleep(MOUNT_CHECK_INTERVAL);
    }
    Err(format!("Mount not ready after {MOUNT_READY_TIMEOUT:?}"))
}

/// Check if FUSE is available on this system.
pub fn fuse_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
