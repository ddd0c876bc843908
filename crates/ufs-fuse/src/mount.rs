//! Mounting a backend stack.
//!
//! [`mount`] owns the whole lifecycle: it builds the tokio runtime that runs
//! the request core, starts the core in front of the stack, and hands a
//! [`UfsFuse`] to a background FUSE session. [`MountHandle::unmount`] (or
//! dropping the handle) takes everything down in reverse order.

use crate::config::MountConfig;
use crate::filesystem::UfsFuse;
use fuser::{BackgroundSession, MountOption};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use ufs_core::{BridgeStats, Scheduler, SyncBridge, Ufs, UfsPath};

/// How long unmount waits for runtime threads after the core drained.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the mount options for a mount named `fsname`.
pub fn mount_options(fsname: &str, read_only: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(format!("ufs:{fsname}")),
        MountOption::Subtype("ufs".to_string()),
        MountOption::AutoUnmount,
    ];

    // On macOS, set the volume name shown in Finder
    #[cfg(target_os = "macos")]
    options.push(MountOption::CUSTOM(format!("volname={fsname}")));

    if read_only {
        options.push(MountOption::RO);
    } else {
        options.push(MountOption::RW);
    }
    options
}

/// A mounted stack. Dropping the handle unmounts it.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    scheduler: Scheduler,
    stats: Arc<BridgeStats>,
    mountpoint: PathBuf,
    runtime: Option<Runtime>,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Counters of the callbacks served so far.
    pub fn bridge_stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Unmounts, then drains the request core and stops the backend.
    pub fn unmount(mut self) -> io::Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> io::Result<()> {
        let Some(runtime) = self.runtime.take() else {
            return Ok(());
        };
        if let Some(session) = self.session.take() {
            info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
            session.join();
        }

        // The kernel sends no more callbacks; drain what is still running.
        let result = runtime.block_on(self.scheduler.shutdown());
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        match result {
            Ok(()) => {
                info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Backend failed to stop cleanly");
                Err(io::Error::other(e))
            }
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            debug!(mountpoint = %self.mountpoint.display(), "Unmounting on drop");
            let _ = self.teardown();
        }
    }
}

/// Mounts the subtree at `root` of `stack` on `mountpoint`.
///
/// `stack` is usually a jail, so `root` is the jail root. The call returns
/// once the FUSE session is running in the background.
pub fn mount(
    stack: Arc<dyn Ufs>,
    root: UfsPath,
    mountpoint: &Path,
    fsname: &str,
    config: &MountConfig,
) -> io::Result<MountHandle> {
    info!(
        mountpoint = %mountpoint.display(),
        root = %root,
        read_only = config.read_only,
        "Starting FUSE mount"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("ufs-core")
        .enable_all()
        .build()?;

    let scheduler = Scheduler::new(stack, config.scheduler_config());
    runtime
        .block_on(scheduler.start())
        .map_err(io::Error::other)?;

    let bridge =
        SyncBridge::new(runtime.handle().clone(), scheduler.caller()).with_timeout(config.io_timeout);
    let stats = Arc::clone(bridge.stats());
    let fs = UfsFuse::new(bridge, root, config);

    let options = mount_options(fsname, config.read_only);
    let session = match fuser::spawn_mount2(fs, mountpoint, &options) {
        Ok(session) => session,
        Err(e) => {
            // The core was started; stop it before reporting.
            let _ = runtime.block_on(scheduler.shutdown());
            return Err(e);
        }
    };

    info!(mountpoint = %mountpoint.display(), "FUSE mount successful");
    Ok(MountHandle {
        session: Some(session),
        scheduler,
        stats,
        mountpoint: mountpoint.to_path_buf(),
        runtime: Some(runtime),
    })
}
