//! Command-line interface definitions.
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "audio-embed", version, about = "Extract audio embeddings with a pooled native engine")]
pub struct Cli {
    /// Path to the JSON config file (default: config.json)
    #[arg(short, long, global = true, default_value = "")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Embed every audio file below a directory
    Embed(EmbedArgs),
}

#[derive(Args, Debug)]
pub struct EmbedArgs {
    /// Directory to scan for audio files
    pub dir: PathBuf,

    /// Number of engine contexts to keep loaded
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum concurrent requests admitted to the pool
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Model file to load into every context
    #[arg(short, long)]
    pub model: Option<String>,

    /// Write JSON lines here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Skip files already present in the output file
    #[arg(short, long)]
    pub skip_existing: bool,

    /// Use the built-in mock engine instead of the native library
    #[arg(long)]
    pub mock: bool,
}

impl EmbedArgs {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(workers) = self.workers {
            config.pool.max_instances = workers;
        }
        if let Some(concurrency) = self.concurrency {
            config.pool.admission_limit = concurrency;
            config.pool.max_backlog = config.pool.max_backlog.max(concurrency);
        }
        if let Some(model) = &self.model {
            config.model_path.clone_from(model);
        }
    }
}
