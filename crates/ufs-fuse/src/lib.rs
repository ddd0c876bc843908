//! FUSE filesystem for ufs backend stacks.
//!
//! Exposes any [`ufs_core::Ufs`] stack, typically a jail over a local or
//! in-memory backend, as a native mount. Kernel callbacks arrive on FUSE
//! threads and are forwarded one by one to the async request core through
//! a [`ufs_core::SyncBridge`].
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ufs_core::{Jail, LocalFs, UfsPath};
//! use ufs_fuse::{MountConfig, mount};
//!
//! let local = Arc::new(LocalFs::new("/srv/share")?);
//! let jail = Arc::new(Jail::new(local, UfsPath::normalize("/public")?));
//! let handle = mount(jail, UfsPath::normalize("/public")?, mountpoint, "share", &MountConfig::local())?;
//! handle.unmount()?;
//! ```

pub mod config;
pub mod error;
pub mod filesystem;
pub mod inode;
pub mod mount;

pub use config::MountConfig;
pub use error::ToErrno;
pub use filesystem::{UfsFuse, open_mode};
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
pub use mount::{MountHandle, mount, mount_options};
