//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tierank",
    version,
    author = "neur0map",
    about = "Progressive tiered document ranking",
    long_about = "Tierank ranks a document list by embedding similarity to a query. In progressive \
                  mode it streams one JSON line per tier as coverage grows, reusing cached vectors \
                  and computing the rest on a pool of embedding workers."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/tierank/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Profile to apply on top of the configuration (e.g., "offline")
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rank documents from a JSON-lines file against a query
    Rank {
        /// Document file, one JSON document per line
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Query text, embedded with the configured model
        #[arg(short, long)]
        query: String,

        /// Stream one JSON line per tier instead of a single final ranking
        #[arg(long)]
        progressive: bool,

        /// Stop after the first tier (implies --progressive)
        #[arg(long)]
        immediate_only: bool,

        /// Keep only the top N documents of the final ranking
        #[arg(short = 'n', long)]
        top: Option<usize>,
    },

    /// Inspect or maintain the vector cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show backend and entry count
    Stats,

    /// Remove expired entries
    Purge,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
