//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// fsql - Run annotated SQL migrations in dependency order
#[derive(Parser, Debug)]
#[command(name = "fsql")]
#[command(version)]
#[command(
    about = "fsql - Run annotated SQL migrations in dependency order",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the config file (defaults to ./fsql.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every migration file found under a directory
    FromDir(FromDirArgs),

    /// Run the migrations of a single SQL file
    FromFile(FromFileArgs),
}

/// Options shared by both run commands
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Print the rows returned by each migration
    #[arg(short, long)]
    pub show_results: bool,

    /// Maximum number of concurrent migrations running at once
    #[arg(short = 'j', long, value_name = "N")]
    pub max_concurrent: Option<usize>,
}

/// Arguments for the `from-dir` command
#[derive(Args, Debug)]
pub struct FromDirArgs {
    /// Migrations directory (defaults to [migrations] directory in the config)
    pub directory: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Arguments for the `from-file` command
#[derive(Args, Debug)]
pub struct FromFileArgs {
    /// SQL file to run
    pub path: PathBuf,

    #[command(flatten)]
    pub run: RunArgs,
}
