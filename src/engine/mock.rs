/// Mock engine for testing purposes.
///
/// Generates deterministic embeddings from a hash of the file path and
/// records every context lifecycle event so tests can check for leaks,
/// double destroys and concurrency bounds without a native library.
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::frames::mean_frames;
use super::{ComputeEngine, EngineError};

/// Handle to a mock context.
#[derive(Debug)]
pub struct MockHandle {
    id: u64,
    model_loaded: bool,
}

impl MockHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Snapshot of the mock's lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub created: usize,
    pub destroyed: usize,
    pub double_destroys: usize,
    /// Destroy calls that released the context but reported an error.
    pub failed_destroys: usize,
    pub live: usize,
    pub calls: usize,
    pub peak_in_flight: usize,
}

/// A mock engine that produces deterministic vectors from path hashes.
pub struct MockEngine {
    pub dimensions: usize,
    frames: usize,
    latency: Duration,
    fail_marker: Option<String>,
    panic_marker: Option<String>,
    failing_loads: AtomicUsize,
    loads_until_failure: AtomicUsize,
    failing_destroys: AtomicUsize,
    next_handle: AtomicU64,
    live: Mutex<HashSet<u64>>,
    errors: Mutex<HashMap<u64, String>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    double_destroys: AtomicUsize,
    failed_destroys: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockEngine {
    /// Create a new `MockEngine` producing vectors of `dimensions` floats.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            frames: 4,
            latency: Duration::ZERO,
            fail_marker: None,
            panic_marker: None,
            failing_loads: AtomicUsize::new(0),
            loads_until_failure: AtomicUsize::new(usize::MAX),
            failing_destroys: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            errors: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            double_destroys: AtomicUsize::new(0),
            failed_destroys: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every inference call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail inference for any file whose path contains `marker`.
    #[must_use]
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    /// Panic inside inference for any file whose path contains `marker`.
    #[must_use]
    pub fn panicking_on(mut self, marker: impl Into<String>) -> Self {
        self.panic_marker = Some(marker.into());
        self
    }

    /// Make the next `count` model loads fail.
    pub fn fail_next_model_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Let `successes` model loads through, then fail the next one.
    pub fn fail_model_load_after(&self, successes: usize) {
        self.loads_until_failure.store(successes, Ordering::SeqCst);
    }

    /// Make the next `count` destroy calls report an error. The context is
    /// still released, as a native engine that fails mid-cleanup would.
    pub fn fail_next_destroys(&self, count: usize) {
        self.failing_destroys.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stats(&self) -> MockStats {
        MockStats {
            created: self.created.load(Ordering::SeqCst),
            destroyed: self.destroyed.load(Ordering::SeqCst),
            double_destroys: self.double_destroys.load(Ordering::SeqCst),
            failed_destroys: self.failed_destroys.load(Ordering::SeqCst),
            live: lock(&self.live).len(),
            calls: self.calls.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Ids of every context created and not yet destroyed.
    #[must_use]
    pub fn live_handles(&self) -> HashSet<u64> {
        lock(&self.live).clone()
    }

    /// The vector a successful call for `file` returns.
    #[must_use]
    pub fn expected_embedding(&self, file: &Path) -> Vec<f32> {
        let flat = self.frame_data(file);
        mean_frames(&flat, self.frames, self.dimensions).unwrap_or_default()
    }

    fn frame_data(&self, file: &Path) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        file.hash(&mut hasher);
        let bytes = hasher.finish().to_le_bytes();

        let mut flat = Vec::with_capacity(self.frames * self.dimensions);
        for frame in 0..self.frames {
            for i in 0..self.dimensions {
                // Offset by one so no vector is all zeros
                flat.push((bytes[(i + frame) % 8] as f32 + 1.0) / 256.0);
            }
        }
        flat
    }

    fn record_error(&self, handle: &MockHandle, message: &str) {
        lock(&self.errors).insert(handle.id, message.to_string());
    }

    fn matches(marker: Option<&String>, file: &Path) -> bool {
        marker.is_some_and(|m| file.to_string_lossy().contains(m.as_str()))
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(1280)
    }
}

impl ComputeEngine for MockEngine {
    type Handle = MockHandle;

    fn create_context(&self) -> Result<MockHandle, EngineError> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        lock(&self.live).insert(id);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            id,
            model_loaded: false,
        })
    }

    fn destroy_context(&self, handle: &MockHandle) -> Result<(), EngineError> {
        if !lock(&self.live).remove(&handle.id) {
            self.double_destroys.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::Destroy(format!(
                "context {} is not live",
                handle.id
            )));
        }
        lock(&self.errors).remove(&handle.id);
        self.destroyed.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_destroys
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.failed_destroys.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::Destroy(format!(
                "context {} did not shut down cleanly",
                handle.id
            )));
        }
        Ok(())
    }

    fn configure_model(
        &self,
        handle: &mut MockHandle,
        model_path: &Path,
    ) -> Result<(), EngineError> {
        let countdown = self
            .loads_until_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                usize::MAX => None,
                0 => Some(usize::MAX),
                n => Some(n - 1),
            });
        let failing = countdown == Ok(0)
            || self
                .failing_loads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            let message = format!("cannot load model {}", model_path.display());
            self.record_error(handle, &message);
            return Err(EngineError::ModelConfiguration(self.last_error(handle)));
        }
        handle.model_loaded = true;
        Ok(())
    }

    fn run_inference(
        &self,
        handle: &mut MockHandle,
        file: &Path,
        _sample_rate: u32,
        _resample_quality: u8,
    ) -> Result<Vec<f32>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if Self::matches(self.panic_marker.as_ref(), file) {
            panic!("mock engine crashed on {}", file.display());
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if !handle.model_loaded {
            self.record_error(handle, "no model configured");
            return Err(EngineError::Inference(self.last_error(handle)));
        }
        if Self::matches(self.fail_marker.as_ref(), file) {
            self.record_error(handle, &format!("cannot decode {}", file.display()));
            return Err(EngineError::Inference(self.last_error(handle)));
        }

        mean_frames(&self.frame_data(file), self.frames, self.dimensions)
    }

    fn last_error(&self, handle: &MockHandle) -> String {
        lock(&self.errors)
            .get(&handle.id)
            .cloned()
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
