//! TierDB CLI
//!
//! Command-line tools for TierDB engine directories.
//!
//! # Commands
//!
//! - `inspect` - Display segment topology and store sizes
//! - `verify` - Verify segment logs and disk segments
//! - `compact` - Rewrite segment logs without superseded writes
//! - `dump-log` - Dump segment log records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TierDB command-line engine tools.
#[derive(Parser)]
#[command(name = "tierdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the engine directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display segment topology and store sizes
    Inspect {
        /// Show per-segment details
        #[arg(short, long)]
        segments: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify engine integrity
    Verify {
        /// Check segment logs
        #[arg(short, long)]
        logs: bool,

        /// Check disk and bottom segments
        #[arg(short, long)]
        disk: bool,

        /// Also require disk segment keys to ascend bytewise
        #[arg(short, long)]
        key_order: bool,
    },

    /// Rewrite segment logs without superseded writes
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump segment log records for debugging
    DumpLog {
        /// Segment whose log to dump (defaults to the mutable segment)
        #[arg(short, long)]
        segment: Option<u64>,

        /// Print the metadata snapshot instead
        #[arg(short, long)]
        meta: bool,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { segments, format } => {
            let path = cli.path.ok_or("Engine path required for inspect")?;
            commands::inspect::run(&path, segments, &format)?;
        }
        Commands::Verify {
            logs,
            disk,
            key_order,
        } => {
            let path = cli.path.ok_or("Engine path required for verify")?;
            let check_all = !logs && !disk;
            commands::verify::run(&path, logs || check_all, disk || check_all, key_order)?;
        }
        Commands::Compact { dry_run, format } => {
            let path = cli.path.ok_or("Engine path required for compact")?;
            commands::compact::run(&path, dry_run, &format)?;
        }
        Commands::DumpLog {
            segment,
            meta,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Engine path required for dump-log")?;
            commands::dump_log::run(&path, segment, meta, limit, &format)?;
        }
        Commands::Version => {
            println!("TierDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("TierDB Core v{}", tierdb_core::VERSION);
        }
    }

    Ok(())
}
