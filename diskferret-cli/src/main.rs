use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod error;

use commands::CommonArgs;

#[derive(Parser)]
#[command(name = "diskferret")]
#[command(about = "Container inventory, drift, and export for disk images")]
#[command(version = "0.1.0")]
struct Cli {
    /// Custom container-root path relative to each mountpoint
    #[arg(long, global = true)]
    container_root: Option<PathBuf>,

    /// Fall back to the default root paths when the override does not match
    #[arg(long, global = true)]
    root_fallback: bool,

    /// Mount budget in bytes for the summed size of an image's volumes
    #[arg(long, global = true)]
    max_mount_size: Option<u64>,

    /// Scratch directory for disk mounts
    #[arg(long, global = true, default_value = "/mnt")]
    scratch_dir: PathBuf,

    /// Output directory for reports, logs, and archives
    #[arg(short, long, global = true, default_value = ".")]
    output: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List containers found on disk images
    List {
        /// Disk image files (raw, qcow2, VHD)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Report filesystem drift for every container found
    Drift {
        /// Disk image files (raw, qcow2, VHD)
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Compare by size and mtime instead of content hash
        #[arg(long)]
        no_hash: bool,
    },
    /// Export container filesystems as .tar.gz archives
    Export {
        /// Disk image files (raw, qcow2, VHD)
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Comma separated container IDs to export (default: all)
        #[arg(long)]
        containers: Option<String>,
        /// Paths to export instead of the entire filesystem
        #[arg(long)]
        path: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let common = CommonArgs {
        container_root: cli.container_root,
        root_fallback: cli.root_fallback,
        max_mount_size: cli.max_mount_size,
        scratch_dir: cli.scratch_dir,
        output: cli.output,
    };

    match cli.command {
        Commands::List { images } => {
            commands::list::execute(&common, &images)?;
        }
        Commands::Drift { images, no_hash } => {
            commands::drift::execute(&common, &images, no_hash)?;
        }
        Commands::Export {
            images,
            containers,
            path,
        } => {
            commands::export::execute(&common, &images, containers.as_deref(), &path)?;
        }
    }

    Ok(())
}
