//! Batch embedding of a file list through the worker pool.
//!
//! Results are streamed as JSON lines, one [`EmbedRecord`] per file the
//! engine embedded successfully.
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::ComputeEngine;
use crate::pool::{PoolError, WorkerPool};

/// One line of the JSONL output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRecord {
    pub path: String,
    pub dimensions: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmbedSummary {
    pub processed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl EmbedSummary {
    /// Successful embeddings per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

type Completed = (PathBuf, Vec<f32>);

/// Paths already present in an existing JSONL output file.
pub fn existing_paths(output: &Path) -> Result<HashSet<String>> {
    let mut paths = HashSet::new();
    if !output.exists() {
        return Ok(paths);
    }

    let file = std::fs::File::open(output)
        .with_context(|| format!("failed to open {}", output.display()))?;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", output.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EmbedRecord>(&line) {
            Ok(record) => {
                paths.insert(record.path);
            }
            Err(e) => warn!("Skipping malformed line {} in {}: {e}", idx + 1, output.display()),
        }
    }
    Ok(paths)
}

/// Embed every file in `files`, writing records to `out`.
///
/// Submission is throttled by the pool's admission limit; when the backlog
/// is full, the next completed result is handled before retrying.
pub async fn embed_files<E, W>(
    pool: &WorkerPool<E>,
    files: &[PathBuf],
    out: &mut W,
    progress: &ProgressBar,
) -> Result<EmbedSummary>
where
    E: ComputeEngine,
    W: Write,
{
    let start = Instant::now();
    let mut summary = EmbedSummary::default();
    let (tx, mut rx) = mpsc::unbounded_channel::<Completed>();

    for file in files {
        loop {
            let sender = tx.clone();
            let path = file.clone();
            let submitted = pool
                .get_embeddings(file.clone(), move |embedding| async move {
                    if let Err(e) = sender.send((path, embedding)) {
                        debug!(file = %e.0.0.display(), "Result receiver gone, dropping embedding");
                    }
                })
                .await;

            match submitted {
                Ok(()) => break,
                Err(PoolError::Backlogged) => {
                    let completed = rx.recv().await.context("result channel closed")?;
                    record(completed, out, progress, &mut summary)?;
                }
                Err(e) => return Err(e).context("failed to submit embedding request"),
            }
        }

        while let Ok(completed) = rx.try_recv() {
            record(completed, out, progress, &mut summary)?;
        }
    }
    drop(tx);

    // Every accepted request fires its callback, so the channel closes once
    // the last one has been delivered.
    while let Some(completed) = rx.recv().await {
        record(completed, out, progress, &mut summary)?;
    }
    out.flush().context("failed to flush output")?;

    summary.elapsed = start.elapsed();
    info!(
        processed = summary.processed,
        failed = summary.failed,
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "Embedding run finished"
    );
    Ok(summary)
}

fn record<W: Write>(
    (path, embedding): Completed,
    out: &mut W,
    progress: &ProgressBar,
    summary: &mut EmbedSummary,
) -> Result<()> {
    if embedding.is_empty() {
        summary.failed += 1;
        progress.println(format!("ERROR: {}", path.display()));
    } else {
        summary.processed += 1;
        let record = EmbedRecord {
            path: path.to_string_lossy().into_owned(),
            dimensions: embedding.len(),
            embedding,
        };
        let line = serde_json::to_string(&record).context("failed to serialize record")?;
        writeln!(out, "{line}").context("failed to write record")?;
    }
    progress.inc(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::pool::PoolSettings;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn pool(engine: Arc<MockEngine>, capacity: usize, backlog: usize) -> WorkerPool<MockEngine> {
        let pool = WorkerPool::new(
            engine,
            PoolSettings {
                capacity,
                admission_limit: capacity,
                recycle_threshold: 1_000,
                max_backlog: backlog,
                ..Default::default()
            },
        )
        .unwrap();
        pool.create_workers().unwrap();
        pool
    }

    fn files(count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| PathBuf::from(format!("album/{i:02}.flac")))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_embed_files_writes_records() {
        let engine = Arc::new(MockEngine::new(8).failing_on("broken"));
        let pool = pool(Arc::clone(&engine), 2, 2);
        let files: Vec<PathBuf> = ["a.flac", "b.mp3", "broken.wav", "c.ogg"]
            .iter()
            .map(PathBuf::from)
            .collect();

        let mut out = Vec::new();
        let summary = embed_files(&pool, &files, &mut out, &ProgressBar::hidden())
            .await
            .unwrap();
        pool.teardown_workers().await;

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 1);

        let text = String::from_utf8(out).unwrap();
        let records: Vec<EmbedRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        for r in &records {
            assert_eq!(r.dimensions, 8);
            assert_eq!(r.embedding, engine.expected_embedding(Path::new(&r.path)));
        }
        assert!(!records.iter().any(|r| r.path.contains("broken")));
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_error_leaves_pool_drainable() {
        let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(100)));
        let pool = WorkerPool::new(
            Arc::clone(&engine),
            PoolSettings {
                capacity: 2,
                admission_limit: 4,
                max_backlog: 4,
                ..Default::default()
            },
        )
        .unwrap();
        pool.create_workers().unwrap();

        let err = embed_files(&pool, &files(4), &mut FullDisk, &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to write record"));

        // Requests still in flight complete into a closed channel.
        pool.teardown_workers().await;
        let stats = engine.stats();
        assert_eq!(stats.calls, 4);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_existing_paths() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.jsonl");
        assert!(existing_paths(&output).unwrap().is_empty());

        let record = EmbedRecord {
            path: "x/track.flac".into(),
            dimensions: 2,
            embedding: vec![0.5, 0.5],
        };
        let line = serde_json::to_string(&record).unwrap();
        std::fs::write(&output, format!("{line}\n\nnot json\n")).unwrap();

        let paths = existing_paths(&output).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths.contains("x/track.flac"));
    }

    #[test]
    fn test_summary_rate() {
        let summary = EmbedSummary {
            processed: 10,
            failed: 0,
            elapsed: Duration::from_secs(4),
        };
        assert!((summary.rate() - 2.5).abs() < 1e-9);
        assert_eq!(EmbedSummary::default().rate(), 0.0);
    }
}
