/// Compute engine trait and shared types for audio embedding extraction.
///
/// The engine is an opaque, stateful library: every context holds a loaded
/// model and its working buffers, so contexts are expensive to create and
/// must be destroyed explicitly. The pool in [`crate::pool`] owns contexts
/// through [`crate::pool::worker::Context`], never through raw handles.
pub mod frames;
pub mod mock;
#[cfg(feature = "native")]
pub mod native;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a compute engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("context creation failed: {0}")]
    ContextCreation(String),

    #[error("model configuration failed: {0}")]
    ModelConfiguration(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("engine returned an empty embedding")]
    EmptyOutput,

    #[error("context destruction failed: {0}")]
    Destroy(String),

    #[error("engine panicked: {0}")]
    Panicked(String),
}

/// Audio decoding parameters forwarded to every inference call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceOptions {
    pub sample_rate: u32,
    pub resample_quality: u8,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            resample_quality: 4,
        }
    }
}

/// A native embedding engine.
///
/// Implementations must be `Send + Sync` so one engine can back every
/// context in a pool. A handle is only ever used by one thread at a time;
/// the pool guarantees that.
pub trait ComputeEngine: Send + Sync + 'static {
    /// Opaque per-context handle.
    type Handle: fmt::Debug + Send + 'static;

    /// Allocate a fresh engine context.
    fn create_context(&self) -> Result<Self::Handle, EngineError>;

    /// Release a context. Called exactly once per handle.
    fn destroy_context(&self, handle: &Self::Handle) -> Result<(), EngineError>;

    /// Load the model at `model_path` into the context.
    fn configure_model(&self, handle: &mut Self::Handle, model_path: &Path)
    -> Result<(), EngineError>;

    /// Decode `file` and run the model over it. Blocking.
    fn run_inference(
        &self,
        handle: &mut Self::Handle,
        file: &Path,
        sample_rate: u32,
        resample_quality: u8,
    ) -> Result<Vec<f32>, EngineError>;

    /// Most recent error message recorded by the context.
    fn last_error(&self, handle: &Self::Handle) -> String;
}
