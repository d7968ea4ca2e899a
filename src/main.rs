use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use audio_embed::cli::{Cli, Command, EmbedArgs};
use audio_embed::config::Config;
use audio_embed::engine::ComputeEngine;
use audio_embed::engine::mock::MockEngine;
use audio_embed::pipeline::{embed_files, existing_paths};
use audio_embed::pool::WorkerPool;
use audio_embed::scan::find_audio_files;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // 1. Load config
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Command::Embed(args) => {
            args.apply(&mut config);
            config.validate().context("invalid configuration")?;

            // 2. Pick the engine
            let failed = if args.mock {
                run_embed(Arc::new(MockEngine::default()), &config, &args).await?
            } else {
                run_native(&config, &args).await?
            };

            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[cfg(feature = "native")]
async fn run_native(config: &Config, args: &EmbedArgs) -> Result<usize> {
    use audio_embed::engine::native::NativeEngine;
    run_embed(Arc::new(NativeEngine::new()), config, args).await
}

#[cfg(not(feature = "native"))]
async fn run_native(_config: &Config, _args: &EmbedArgs) -> Result<usize> {
    anyhow::bail!("built without the `native` feature; rebuild with it or pass --mock")
}

/// Embed the directory in `args`, returning the number of failed files.
async fn run_embed<E: ComputeEngine>(engine: Arc<E>, config: &Config, args: &EmbedArgs) -> Result<usize> {
    // 3. Discover files
    let mut files = find_audio_files(&args.dir);
    info!("Found {} audio files in {}", files.len(), args.dir.display());

    if args.skip_existing {
        if let Some(output) = &args.output {
            let done = existing_paths(output)?;
            files.retain(|f| !done.contains(f.to_string_lossy().as_ref()));
            info!("{} files need embeddings", files.len());
        } else {
            warn!("--skip-existing has no effect without --output");
        }
    }

    if files.is_empty() {
        eprintln!("No files to process!");
        return Ok(0);
    }

    // 4. Start the pool
    let pool = WorkerPool::new(engine, config.pool_settings())?;
    let starter = pool.clone();
    tokio::task::spawn_blocking(move || starter.create_workers())
        .await
        .context("worker startup panicked")?
        .context("failed to start workers")?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open output: {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({percent}%) eta {eta}")
            .context("invalid progress template")?
            .progress_chars("=> "),
    );
    progress.set_message("Generating embeddings");

    // 5. Run and drain
    let result = embed_files(&pool, &files, &mut out, &progress).await;
    pool.teardown_workers().await;
    progress.finish_and_clear();
    let summary = result?;

    eprintln!("Embedding generation complete");
    eprintln!("  Total time:           {:.2}s", summary.elapsed.as_secs_f64());
    eprintln!("  Embeddings processed: {}", summary.processed);
    eprintln!("  Embeddings failed:    {}", summary.failed);
    if summary.processed > 0 {
        eprintln!(
            "  Average per file:     {:.2}s",
            summary.elapsed.as_secs_f64() / summary.processed as f64
        );
        eprintln!("  Embeddings per sec:   {:.2}", summary.rate());
    }

    Ok(summary.failed)
}
