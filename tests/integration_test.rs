/// End-to-end tests for the worker pool against the mock engine.
///
/// Covers the full request lifecycle:
///   create_workers → get_embeddings → recycle → teardown_workers
use audio_embed::engine::mock::MockEngine;
use audio_embed::pool::{PoolError, PoolSettings, WorkerPool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn settings(capacity: usize, admission_limit: usize, recycle_threshold: u64) -> PoolSettings {
    PoolSettings {
        capacity,
        admission_limit,
        recycle_threshold,
        max_backlog: 1_024,
        ..Default::default()
    }
}

fn start(engine: &Arc<MockEngine>, settings: PoolSettings) -> WorkerPool<MockEngine> {
    let pool = WorkerPool::new(Arc::clone(engine), settings).unwrap();
    pool.create_workers().unwrap();
    pool
}

/// Submit every file and collect `(path, embedding)` per callback.
async fn submit_all(
    pool: &WorkerPool<MockEngine>,
    files: &[PathBuf],
) -> mpsc::UnboundedReceiver<(PathBuf, Vec<f32>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for file in files {
        let tx = tx.clone();
        let path = file.clone();
        pool.get_embeddings(file.clone(), move |embedding| async move {
            tx.send((path, embedding)).unwrap();
        })
        .await
        .unwrap();
    }
    rx
}

fn files(count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| PathBuf::from(format!("library/track-{i:03}.flac")))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_embed_returns_engine_output() {
    let engine = Arc::new(MockEngine::new(32));
    let pool = start(&engine, settings(2, 2, 100));

    let embedding = pool.embed("music/song.flac").await.unwrap();
    assert_eq!(embedding.len(), 32);
    assert_eq!(embedding, engine.expected_embedding(Path::new("music/song.flac")));

    let stats = pool.stats();
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.total_executions, 1);

    pool.teardown_workers().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inference_failure_delivers_empty_vector() {
    let engine = Arc::new(MockEngine::new(16).failing_on("corrupt"));
    let pool = start(&engine, settings(2, 2, 100));

    let bad = pool.embed("corrupt.mp3").await.unwrap();
    assert!(bad.is_empty());

    // The worker stays healthy and keeps serving.
    let good = pool.embed("fine.mp3").await.unwrap();
    assert_eq!(good.len(), 16);

    let stats = pool.stats();
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.total_executions, 2);

    pool.teardown_workers().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_panic_is_contained() {
    let engine = Arc::new(MockEngine::new(16).panicking_on("crash"));
    let pool = start(&engine, settings(1, 1, 100));

    let crashed = pool.embed("crash.wav").await.unwrap();
    assert!(crashed.is_empty());

    let after = pool.embed("ok.wav").await.unwrap();
    assert_eq!(after.len(), 16);
    assert_eq!(pool.stats().workers, 1);

    pool.teardown_workers().await;
    let stats = engine.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.double_destroys, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_bounded_by_capacity() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(30)));
    let pool = start(&engine, settings(3, 6, 1_000));

    let mut rx = submit_all(&pool, &files(18)).await;
    for _ in 0..18 {
        rx.recv().await.unwrap();
    }

    let stats = engine.stats();
    assert!(stats.peak_in_flight <= 3, "peak {}", stats.peak_in_flight);
    assert_eq!(stats.calls, 18);
    pool.teardown_workers().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_bounded_by_admission() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(30)));
    let pool = start(&engine, settings(4, 2, 1_000));

    let mut rx = submit_all(&pool, &files(12)).await;
    for _ in 0..12 {
        rx.recv().await.unwrap();
    }

    let stats = engine.stats();
    assert!(stats.peak_in_flight <= 2, "peak {}", stats.peak_in_flight);
    pool.teardown_workers().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_request_completes_exactly_once() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(5)));
    let pool = start(&engine, settings(3, 10, 1_000));

    let requested = files(40);
    let mut rx = submit_all(&pool, &requested).await;
    pool.teardown_workers().await;

    // Teardown drained everything, so every callback has already fired.
    let mut seen: HashMap<PathBuf, usize> = HashMap::new();
    while let Ok((path, embedding)) = rx.try_recv() {
        assert_eq!(embedding, engine.expected_embedding(&path));
        *seen.entry(path).or_default() += 1;
    }
    assert_eq!(seen.len(), requested.len());
    assert!(seen.values().all(|n| *n == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_third_request_waits_for_a_worker() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(100)));
    let pool = start(&engine, settings(2, 2, 1_000));

    let names: Vec<PathBuf> = ["A.flac", "B.flac", "C.flac"]
        .iter()
        .map(PathBuf::from)
        .collect();
    let mut rx = submit_all(&pool, &names).await;

    let mut done = Vec::new();
    for _ in 0..3 {
        let (path, embedding) = rx.recv().await.unwrap();
        assert!(!embedding.is_empty());
        done.push(path);
    }
    done.sort();
    assert_eq!(done, names);
    assert_eq!(engine.stats().peak_in_flight, 2);

    pool.teardown_workers().await;
    assert!(rx.try_recv().is_err(), "no callback fires twice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recycle_replaces_every_context() {
    let engine = Arc::new(MockEngine::new(8));
    let pool = start(&engine, settings(2, 2, 4));
    let before = engine.live_handles();
    assert_eq!(before.len(), 2);

    for i in 0..4 {
        pool.embed(format!("pre-{i}.flac")).await.unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.total_executions, 4);
    assert_eq!(stats.recycles, 0);
    assert_eq!(engine.live_handles(), before);

    // The threshold has been reached: the next selection recycles first.
    let embedding = pool.embed("post.flac").await.unwrap();
    assert_eq!(embedding.len(), 8);

    let stats = pool.stats();
    assert_eq!(stats.recycles, 1);
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.total_executions, 1);

    let after = engine.live_handles();
    assert_eq!(after.len(), 2);
    assert!(after.is_disjoint(&before));

    let engine_stats = engine.stats();
    assert_eq!(engine_stats.created, 4);
    assert_eq!(engine_stats.destroyed, 2);

    pool.teardown_workers().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recycle_under_concurrent_load() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(10)));
    let pool = start(&engine, settings(2, 4, 4));

    let requested = files(30);
    let mut rx = submit_all(&pool, &requested).await;
    for _ in 0..requested.len() {
        let (_, embedding) = rx.recv().await.unwrap();
        assert!(!embedding.is_empty());
    }

    let stats = pool.stats();
    assert!(stats.recycles >= 1);
    assert!(stats.total_executions < 4 + 2, "counters reset on recycle");
    assert!(engine.stats().peak_in_flight <= 2);

    pool.teardown_workers().await;
    let engine_stats = engine.stats();
    assert_eq!(engine_stats.live, 0);
    assert_eq!(engine_stats.created, engine_stats.destroyed);
    assert_eq!(engine_stats.double_destroys, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recycle_waits_for_in_flight_calls() {
    const LATENCY: Duration = Duration::from_millis(200);
    let engine = Arc::new(MockEngine::new(8).with_latency(LATENCY));
    let pool = start(&engine, settings(2, 4, 1));
    let started = Instant::now();

    let spawn_embed = |name: &'static str| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let embedding = pool.embed(name).await.unwrap();
            assert!(!embedding.is_empty());
            started.elapsed()
        })
    };

    let a = spawn_embed("A.flac");
    tokio::time::sleep(LATENCY / 2).await;
    let b = spawn_embed("B.flac");

    // A has finished and crossed the threshold while B is still running.
    a.await.unwrap();
    assert_eq!(pool.stats().busy, 1);
    assert_eq!(pool.stats().recycles, 0);

    let c_done = {
        pool.embed("C.flac").await.unwrap();
        started.elapsed()
    };
    let b_done = b.await.unwrap();

    // C could only start once B returned its worker and the pool recycled.
    assert!(
        c_done >= b_done + LATENCY * 3 / 4,
        "C finished at {c_done:?}, B at {b_done:?}"
    );
    assert_eq!(pool.stats().recycles, 1);
    assert_eq!(engine.stats().created, 4);

    pool.teardown_workers().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recycle_failure_drops_worker() {
    let engine = Arc::new(MockEngine::new(8));
    let pool = start(&engine, settings(2, 2, 2));

    pool.embed("one.flac").await.unwrap();
    pool.embed("two.flac").await.unwrap();

    engine.fail_next_model_loads(1);
    let embedding = pool.embed("three.flac").await.unwrap();
    assert_eq!(embedding.len(), 8);
    assert_eq!(pool.stats().workers, 1);

    // The lost slot can be refilled.
    assert_eq!(pool.create_workers().unwrap(), 1);
    assert_eq!(pool.stats().workers, 2);

    pool.teardown_workers().await;
    let stats = engine.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.created, stats.destroyed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_teardown_waits_for_in_flight_calls() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(50)));
    let pool = start(&engine, settings(2, 2, 1_000));

    let completed = Arc::new(AtomicUsize::new(0));
    for file in files(6) {
        let completed = Arc::clone(&completed);
        pool.get_embeddings(file, move |_| async move {
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    }

    pool.teardown_workers().await;
    assert_eq!(completed.load(Ordering::SeqCst), 6);

    let stats = pool.stats();
    assert_eq!(stats.workers, 0);
    assert_eq!(stats.busy, 0);

    let engine_stats = engine.stats();
    assert_eq!(engine_stats.created, 2);
    assert_eq!(engine_stats.destroyed, 2);
    assert_eq!(engine_stats.double_destroys, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_teardown_continues_after_destroy_failure() {
    let engine = Arc::new(MockEngine::new(8));
    let pool = start(&engine, settings(3, 3, 100));
    pool.embed("warmup.flac").await.unwrap();

    engine.fail_next_destroys(1);
    pool.teardown_workers().await;

    assert_eq!(pool.stats().workers, 0);
    let stats = engine.stats();
    assert_eq!(stats.destroyed, 3, "every context gets a destroy call");
    assert_eq!(stats.failed_destroys, 1);
    assert_eq!(stats.double_destroys, 0);
    assert_eq!(stats.live, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_pool_rejects_requests() {
    let engine = Arc::new(MockEngine::new(8));
    let pool = start(&engine, settings(1, 1, 100));
    pool.teardown_workers().await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let result = pool
        .get_embeddings("late.flac", move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    assert!(matches!(result, Err(PoolError::Closed)));
    assert!(matches!(pool.create_workers(), Err(PoolError::Closed)));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_pool_delivers_empty_vector() {
    let engine = Arc::new(MockEngine::new(8));
    let pool = WorkerPool::new(Arc::clone(&engine), settings(2, 2, 100)).unwrap();

    let embedding = pool.embed("nothing.flac").await.unwrap();
    assert!(embedding.is_empty());
    assert_eq!(engine.stats().calls, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_timeout() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(400)));
    let pool = start(
        &engine,
        PoolSettings {
            acquire_timeout: Some(Duration::from_millis(50)),
            ..settings(1, 2, 100)
        },
    );

    let names: Vec<PathBuf> = vec!["slow.flac".into(), "starved.flac".into()];
    let mut rx = submit_all(&pool, &names).await;

    let mut results = HashMap::new();
    for _ in 0..2 {
        let (path, embedding) = rx.recv().await.unwrap();
        results.insert(path, embedding);
    }
    let filled = results.values().filter(|v| !v.is_empty()).count();
    assert_eq!(filled, 1, "one request gets the worker, the other times out");

    pool.teardown_workers().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backlog_limit_rejects_excess() {
    let engine = Arc::new(MockEngine::new(8).with_latency(Duration::from_millis(200)));
    let pool = start(
        &engine,
        PoolSettings {
            max_backlog: 1,
            ..settings(1, 1, 100)
        },
    );

    pool.get_embeddings("first.flac", |_| async {}).await.unwrap();
    let second = pool.get_embeddings("second.flac", |_| async {}).await;
    assert!(matches!(second, Err(PoolError::Backlogged)));

    pool.teardown_workers().await;
    assert_eq!(engine.stats().calls, 1);
}
