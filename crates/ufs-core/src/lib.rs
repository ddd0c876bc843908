//! Universal filesystem core.
//!
//! One operation contract ([`Ufs`]) for every storage backend, plus the
//! layers that make it safe to expose:
//!
//! - [`UfsPath`]: absolute, normalized paths that can never climb above
//!   their root
//! - [`Jail`]: confines any backend to a subtree, re-validating every path
//!   and every symlink target before delegating
//! - [`scheduler`]: async request core with per-path ordering, cancellation,
//!   deadlines and bounded concurrency
//! - [`SyncBridge`]: blocking entry point for threads outside the runtime,
//!   such as FUSE callback threads
//! - [`util`]: `walk`, `copytree`, `rmtree`, `copy`, `move_path` and the
//!   `cat`/`put` streams, working across two different backends
//!
//! Backends and decorators stack as `Arc<dyn Ufs>`:
//!
//! ```
//! use std::sync::Arc;
//! use ufs_core::{Jail, MemoryFs, Traced, Ufs, UfsPath};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ufs_core::UfsResult<()> {
//! let memory = Arc::new(MemoryFs::new());
//! memory.mkdir(&UfsPath::normalize("/share")?).await?;
//!
//! let jail = Jail::new(memory, UfsPath::normalize("/share")?);
//! assert!(jail.confine("../etc").is_err());
//!
//! let inside = jail.confine("docs")?;
//! let fs = Traced::new(Arc::new(jail));
//! fs.mkdir(&inside).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Stacks can also be described in JSON and built through a
//! [`BackendRegistry`].

pub mod bridge;
pub mod error;
pub mod handle_table;
pub mod jail;
pub mod local;
pub mod memory;
pub mod ops;
pub mod path;
pub mod read_only;
pub mod registry;
pub mod scheduler;
pub mod testing;
pub mod traced;
pub mod util;

pub use bridge::{BridgeStats, SyncBridge};
pub use error::{PathError, UfsError, UfsResult};
pub use handle_table::HandleTable;
pub use jail::{Follow, Jail, MAX_LINK_DEPTH, Resolved};
pub use local::LocalFs;
pub use memory::{DEFAULT_MAX_FILE_SIZE, MemoryFs};
pub use ops::{Capabilities, DirEntry, FileHandle, FileKind, FileStat, OpenMode, Ufs};
pub use path::UfsPath;
pub use read_only::ReadOnly;
pub use registry::{BackendConfig, BackendFactory, BackendRegistry, ConfigError};
pub use scheduler::{Caller, RequestHandle, Scheduler, SchedulerConfig, SubmitOptions, UfsRequest, UfsResponse};
pub use traced::Traced;
pub use util::WalkOrder;
