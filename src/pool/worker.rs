//! Worker records and the owning wrapper around engine contexts.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::{ComputeEngine, EngineError, InferenceOptions};

/// Stable identifier of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// One configured engine context.
///
/// The handle is destroyed exactly once, when the `Context` is dropped,
/// including when configuration fails half-way through [`Context::open`].
pub struct Context<E: ComputeEngine> {
    engine: Arc<E>,
    handle: E::Handle,
}

impl<E: ComputeEngine> Context<E> {
    /// Create a context and load `model_path` into it.
    pub fn open(engine: Arc<E>, model_path: &Path) -> Result<Self, EngineError> {
        let handle = engine.create_context()?;
        let mut context = Self { engine, handle };
        context
            .engine
            .configure_model(&mut context.handle, model_path)?;
        debug!(context = ?context.handle, model = %model_path.display(), "Context ready");
        Ok(context)
    }

    /// Run inference on `file`. Blocking.
    pub fn infer(&mut self, file: &Path, options: InferenceOptions) -> Result<Vec<f32>, EngineError> {
        let embedding = self.engine.run_inference(
            &mut self.handle,
            file,
            options.sample_rate,
            options.resample_quality,
        )?;
        if embedding.is_empty() {
            return Err(EngineError::EmptyOutput);
        }
        Ok(embedding)
    }

    #[must_use]
    pub fn handle(&self) -> &E::Handle {
        &self.handle
    }
}

impl<E: ComputeEngine> fmt::Debug for Context<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("handle", &self.handle).finish()
    }
}

impl<E: ComputeEngine> Drop for Context<E> {
    fn drop(&mut self) {
        if let Err(e) = self.engine.destroy_context(&self.handle) {
            warn!(context = ?self.handle, error = %e, "Failed to destroy context");
        }
    }
}

/// A pool slot: one context plus its bookkeeping.
///
/// Fields are only touched while the pool's state mutex is held. While a
/// call is in flight the context lives inside that call, not here.
pub(crate) struct Worker<E: ComputeEngine> {
    pub(crate) id: WorkerId,
    pub(crate) available: bool,
    pub(crate) executions: u64,
    context: Option<Context<E>>,
}

impl<E: ComputeEngine> Worker<E> {
    pub(crate) fn new(id: WorkerId, context: Context<E>) -> Self {
        Self {
            id,
            available: true,
            executions: 0,
            context: Some(context),
        }
    }

    /// Take the context for an in-flight call.
    pub(crate) fn claim(&mut self) -> Option<Context<E>> {
        if !self.available {
            return None;
        }
        let context = self.context.take()?;
        self.available = false;
        Some(context)
    }

    /// Return the context after a call and count the execution.
    pub(crate) fn restore(&mut self, context: Context<E>) {
        self.context = Some(context);
        self.available = true;
        self.executions += 1;
    }

    /// Take the context out for recycling. The worker stays unavailable
    /// until [`Worker::install`] runs.
    pub(crate) fn retire(&mut self) -> Option<Context<E>> {
        self.available = false;
        self.context.take()
    }

    /// Install a fresh context and reset the execution count.
    pub(crate) fn install(&mut self, context: Context<E>) {
        self.context = Some(context);
        self.executions = 0;
        self.available = true;
    }

    pub(crate) fn has_context(&self) -> bool {
        self.context.is_some()
    }
}
