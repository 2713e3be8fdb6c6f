//! PackFS Administration CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use packfs_core::{Filesystem, FsConfig};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "packfs-admin")]
#[command(version = "0.1.0")]
#[command(about = "PackFS repository administration tool")]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init {
        path: String,
        /// Disable representation sharing
        #[arg(long)]
        no_rep_sharing: bool,
        /// Revisions per shard
        #[arg(long)]
        shard_size: Option<u64>,
    },

    /// Show repository information
    Info { path: String },

    /// Pack all complete shards of loose revisions
    Pack { path: String },

    /// Verify revision data against its indices and digests
    Verify {
        path: String,
        #[arg(short, long)]
        start: Option<u64>,
        #[arg(short, long)]
        end: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Init {
            path,
            no_rep_sharing,
            shard_size,
        } => {
            let mut config = FsConfig::default();
            if no_rep_sharing {
                config.enable_rep_sharing = false;
            }
            if let Some(size) = shard_size {
                config.shard_size = size;
            }
            let fs = Filesystem::create(Path::new(&path), config)
                .with_context(|| format!("creating repository at {path}"))?;
            println!("Repository created at {} (UUID: {})", path, fs.uuid());
        }

        Commands::Info { path } => {
            let fs = Filesystem::open(Path::new(&path))
                .with_context(|| format!("opening repository at {path}"))?;
            println!("UUID:            {}", fs.uuid());
            println!("Format:          {}", fs.format());
            println!("Youngest:        {}", fs.youngest()?);
            println!("Min unpacked:    {}", fs.read_min_unpacked_rev()?);
            println!("Shard size:      {}", fs.config().shard_size);
            println!("Rep sharing:     {}", fs.config().enable_rep_sharing);
        }

        Commands::Pack { path } => {
            let fs = Filesystem::open(Path::new(&path))
                .with_context(|| format!("opening repository at {path}"))?;
            let packed = packfs_core::pack::pack_all(&fs)?;
            info!(shards = packed, "packing finished");
            println!("Packed {} shard(s)", packed);
        }

        Commands::Verify { path, start, end } => {
            let fs = Filesystem::open(Path::new(&path))
                .with_context(|| format!("opening repository at {path}"))?;
            let start = start.unwrap_or(0);
            let end = end.unwrap_or(fs.youngest()?);
            let checked = fs
                .verify(start, end)
                .context("verification failed")?;
            println!("Verified {} revision(s)", checked);
        }
    }

    Ok(())
}
