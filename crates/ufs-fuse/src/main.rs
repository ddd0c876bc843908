//! ufsmount - Mount a ufs backend stack as a FUSE filesystem.
//!
//! Usage: ufsmount <MOUNTPOINT> (--local <DIR> | --config <FILE>) [--jail <PATH>]
//!
//! ## Debugging with tokio-console
//!
//! Build with the `tokio-console` feature for async task introspection:
//! ```bash
//! cargo build -p ufs-fuse --features tokio-console
//! ```
//!
//! Then run `tokio-console` in another terminal to connect (default: 127.0.0.1:6669).

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ufs_core::{BackendConfig, BackendRegistry};
use ufs_fuse::MountConfig;

#[derive(Parser)]
#[command(name = "ufsmount")]
#[command(about = "Mount a ufs backend stack as a FUSE filesystem")]
#[command(version)]
#[command(group(ArgGroup::new("backend").required(true).args(["config", "local"])))]
struct Cli {
    /// Mountpoint for the filesystem
    mountpoint: PathBuf,

    /// JSON file describing the backend stack
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serve a host directory
    #[arg(short, long, value_name = "DIR")]
    local: Option<PathBuf>,

    /// Confine the mount to this path of the backend
    #[arg(short, long, value_name = "PATH")]
    jail: Option<String>,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,

    /// Seconds one filesystem call may take before failing with ETIMEDOUT
    #[arg(long, value_name = "SECS", env = "UFS_TIMEOUT")]
    timeout: Option<u64>,

    /// Maximum backend calls in flight at once
    #[arg(long, value_name = "N")]
    max_in_flight: Option<usize>,

    /// Enable debug logging and trace every backend call
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// The backend stack described by the command line.
    fn backend_config(&self) -> Result<BackendConfig> {
        let mut config = match (&self.config, &self.local) {
            (Some(file), _) => BackendConfig::load(file)
                .with_context(|| format!("Failed to load backend config {}", file.display()))?,
            (None, Some(dir)) => BackendConfig::Local { root: dir.clone() },
            (None, None) => anyhow::bail!("Either --config or --local is required"),
        };
        // Without an explicit jail the whole backend is exposed, but paths
        // and link targets are still checked against its root.
        config = match &self.jail {
            Some(root) => config.jailed(root.clone()),
            None => config.confined(),
        };
        if self.read_only {
            config = config.read_only();
        }
        if self.debug {
            config = config.traced();
        }
        Ok(config)
    }

    fn mount_config(&self) -> MountConfig {
        let mut config = if self.local.is_some() {
            MountConfig::local()
        } else {
            MountConfig::default()
        };
        config = config.read_only(self.read_only);
        if let Some(secs) = self.timeout {
            config = config.io_timeout(Duration::from_secs(secs));
        }
        if let Some(n) = self.max_in_flight {
            config = config.max_in_flight(n);
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug { "debug" } else { "info" };
    let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    #[cfg(feature = "tokio-console")]
    {
        use std::net::SocketAddr;
        use tracing_subscriber::Layer;

        let console_port: u16 = std::env::var("TOKIO_CONSOLE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(6669);

        let console_addr: SocketAddr = ([127, 0, 0, 1], console_port).into();
        if std::net::TcpListener::bind(console_addr).is_ok() {
            let console_layer = console_subscriber::ConsoleLayer::builder()
                .server_addr(console_addr)
                .spawn();
            tracing_subscriber::registry()
                .with(console_layer)
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            info!(
                "tokio-console enabled, connect with: tokio-console http://127.0.0.1:{}",
                console_port
            );
        } else {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
                .init();
            warn!(
                "tokio-console port {} already in use, running without console instrumentation. \
                 Set TOKIO_CONSOLE_PORT to use a different port.",
                console_port
            );
        }
    }

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(fmt_filter)
        .init();

    run(&cli)
}

fn run(cli: &Cli) -> Result<()> {
    if !cli.mountpoint.is_dir() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mountpoint.display());
    }

    let backend = cli.backend_config()?;
    let root = backend.exposed_root().context("Invalid jail root")?;
    let stack = BackendRegistry::new()
        .build(&backend)
        .context("Failed to build backend stack")?;

    let name = cli
        .mountpoint
        .file_name()
        .map_or_else(|| "ufs".to_string(), |n| n.to_string_lossy().to_string());

    // Set up channel for signal handling
    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!(mountpoint = %cli.mountpoint.display(), root = %root, "Mounting filesystem (press Ctrl+C to unmount)");
    let handle = ufs_fuse::mount(
        stack,
        root,
        &cli.mountpoint,
        &name,
        &cli.mount_config(),
    )
    .context("Failed to mount filesystem")?;

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    handle.unmount().context("Failed to unmount cleanly")?;
    info!("Filesystem unmounted");
    Ok(())
}
