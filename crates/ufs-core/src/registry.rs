//! Backend stacks described as data.
//!
//! A [`BackendConfig`] is a tree: leaves are storage backends, inner nodes
//! are decorators wrapping the node below them. It round-trips through JSON
//! tagged by `kind`:
//!
//! ```json
//! {
//!   "kind": "jail",
//!   "root": "/srv/share",
//!   "inner": { "kind": "local", "root": "/" }
//! }
//! ```
//!
//! [`BackendRegistry::build`] turns a config into an `Arc<dyn Ufs>`. The
//! built-in kinds need no registration; anything else is a `custom` node
//! whose factory is registered by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::error::UfsError;
use crate::jail::{Jail, MAX_LINK_DEPTH};
use crate::local::LocalFs;
use crate::memory::MemoryFs;
use crate::ops::Ufs;
use crate::path::UfsPath;
use crate::read_only::ReadOnly;
use crate::traced::Traced;

/// Errors from loading or building a backend config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid backend config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no backend registered under the name {0:?}")]
    UnknownBackend(String),

    #[error("backend could not be built: {0}")]
    Invalid(#[from] UfsError),

    #[error("backend {name:?} rejected its options: {reason}")]
    Factory { name: String, reason: String },
}

fn default_link_depth() -> usize {
    MAX_LINK_DEPTH
}

/// One node of a backend stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// A fresh [`MemoryFs`].
    Memory,

    /// A [`LocalFs`] rooted at a host directory.
    Local { root: PathBuf },

    /// A [`Jail`] confining `inner` to `root`.
    Jail {
        root: String,
        #[serde(default = "default_link_depth")]
        max_link_depth: usize,
        inner: Box<BackendConfig>,
    },

    /// A [`ReadOnly`] view of `inner`.
    ReadOnly { inner: Box<BackendConfig> },

    /// A [`Traced`] view of `inner`.
    Traced {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        inner: Box<BackendConfig>,
    },

    /// A backend registered with [`BackendRegistry::register`].
    Custom {
        name: String,
        #[serde(default)]
        options: serde_json::Value,
    },
}

impl BackendConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Wraps `self` in a jail.
    #[must_use]
    pub fn jailed(self, root: impl Into<String>) -> Self {
        Self::Jail {
            root: root.into(),
            max_link_depth: MAX_LINK_DEPTH,
            inner: Box::new(self),
        }
    }

    #[must_use]
    pub fn read_only(self) -> Self {
        Self::ReadOnly {
            inner: Box::new(self),
        }
    }

    #[must_use]
    pub fn traced(self) -> Self {
        Self::Traced {
            label: None,
            inner: Box::new(self),
        }
    }

    /// The path a client of this stack should treat as its root: the root
    /// of the outermost jail, looking through decorators, or `/` if the
    /// stack is not jailed.
    pub fn exposed_root(&self) -> Result<UfsPath, UfsError> {
        match self {
            Self::Jail { root, .. } => UfsPath::normalize(root),
            Self::ReadOnly { inner } | Self::Traced { inner, .. } => inner.exposed_root(),
            Self::Memory | Self::Local { .. } | Self::Custom { .. } => Ok(UfsPath::root()),
        }
    }

    /// Returns true if a jail sits on top of the stack, looking through
    /// decorators.
    pub fn is_jailed(&self) -> bool {
        match self {
            Self::Jail { .. } => true,
            Self::ReadOnly { inner } | Self::Traced { inner, .. } => inner.is_jailed(),
            Self::Memory | Self::Local { .. } | Self::Custom { .. } => false,
        }
    }

    /// Wraps `self` in a jail at `/` unless it is jailed already, so every
    /// path and symlink is checked before it reaches the backend.
    #[must_use]
    pub fn confined(self) -> Self {
        if self.is_jailed() {
            self
        } else {
            self.jailed("/")
        }
    }

    fn kind(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::Local { .. } => "local",
            Self::Jail { .. } => "jail",
            Self::ReadOnly { .. } => "read_only",
            Self::Traced { .. } => "traced",
            Self::Custom { name, .. } => name,
        }
    }
}

/// Builds a backend from the `options` of a `custom` node.
pub type BackendFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Ufs>, ConfigError> + Send + Sync>;

/// Named factories for `custom` backend nodes.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("BackendRegistry")
            .field("factories", &names)
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Ufs>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the stack described by `config`, innermost node first.
    pub fn build(&self, config: &BackendConfig) -> Result<Arc<dyn Ufs>, ConfigError> {
        debug!(kind = config.kind(), "Building backend");
        let fs: Arc<dyn Ufs> = match config {
            BackendConfig::Memory => Arc::new(MemoryFs::new()),
            BackendConfig::Local { root } => Arc::new(LocalFs::new(root)?),
            BackendConfig::Jail {
                root,
                max_link_depth,
                inner,
            } => {
                let root = UfsPath::normalize(root)?;
                Arc::new(Jail::new(self.build(inner)?, root).with_max_link_depth(*max_link_depth))
            }
            BackendConfig::ReadOnly { inner } => Arc::new(ReadOnly::new(self.build(inner)?)),
            BackendConfig::Traced { label, inner } => {
                let traced = Traced::new(self.build(inner)?);
                Arc::new(match label {
                    Some(label) => traced.with_label(label.clone()),
                    None => traced,
                })
            }
            BackendConfig::Custom { name, options } => {
                let factory = self
                    .factories
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownBackend(name.clone()))?;
                factory(options)?
            }
        };
        Ok(fs)
    }
}
