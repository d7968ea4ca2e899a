//! FFI bindings to the `essentia_bindings` shared library.
//!
//! The library keeps one TensorFlow graph and one audio loader per context,
//! addressed by an integer id. All functions are blocking and a context must
//! never be used from two threads at once; [`crate::pool::WorkerPool`]
//! enforces that by moving each [`crate::pool::worker::Context`] into exactly
//! one in-flight call.

#![allow(unsafe_code)]

use std::ffi::{CString, c_char, c_int};
use std::path::Path;

use tracing::trace;

use super::frames::mean_frames;
use super::{ComputeEngine, EngineError};

#[link(name = "essentia_bindings")]
unsafe extern "C" {
    fn ew_create_context() -> c_int;
    fn ew_destroy_context(context_id: c_int);
    fn ew_configure_tf_model(context_id: c_int, model_path: *const c_char) -> bool;
    fn ew_run_inference(
        context_id: c_int,
        audio_file: *const c_char,
        sample_rate: c_int,
        resample_quality: c_int,
    ) -> c_int;
    fn ew_get_embedding_count(context_id: c_int) -> c_int;
    fn ew_get_embedding_size(context_id: c_int) -> c_int;
    fn ew_get_total_embedding_elements(context_id: c_int) -> c_int;
    fn ew_get_embeddings_flattened(
        context_id: c_int,
        out_buffer: *mut f32,
        buffer_size: c_int,
    ) -> bool;
    fn ew_get_error(context_id: c_int, buffer: *mut c_char, buffer_size: c_int) -> bool;
    fn ew_get_error_length(context_id: c_int) -> c_int;
}

/// Context id issued by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(c_int);

/// Engine backed by the native essentia wrapper.
#[derive(Debug, Default)]
pub struct NativeEngine;

impl NativeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn path_to_cstring(path: &Path) -> Result<CString, EngineError> {
    CString::new(path.to_string_lossy().as_bytes())
        .map_err(|e| EngineError::Inference(format!("invalid path {}: {e}", path.display())))
}

impl ComputeEngine for NativeEngine {
    type Handle = ContextId;

    fn create_context(&self) -> Result<ContextId, EngineError> {
        let id = unsafe { ew_create_context() };
        if id < 0 {
            return Err(EngineError::ContextCreation(format!(
                "ew_create_context returned {id}"
            )));
        }
        trace!(context = id, "Created native context");
        Ok(ContextId(id))
    }

    fn destroy_context(&self, handle: &ContextId) -> Result<(), EngineError> {
        unsafe { ew_destroy_context(handle.0) };
        trace!(context = handle.0, "Destroyed native context");
        Ok(())
    }

    fn configure_model(
        &self,
        handle: &mut ContextId,
        model_path: &Path,
    ) -> Result<(), EngineError> {
        let path = path_to_cstring(model_path)
            .map_err(|e| EngineError::ModelConfiguration(e.to_string()))?;
        let ok = unsafe { ew_configure_tf_model(handle.0, path.as_ptr()) };
        if !ok {
            return Err(EngineError::ModelConfiguration(self.last_error(handle)));
        }
        Ok(())
    }

    fn run_inference(
        &self,
        handle: &mut ContextId,
        file: &Path,
        sample_rate: u32,
        resample_quality: u8,
    ) -> Result<Vec<f32>, EngineError> {
        let audio = path_to_cstring(file)?;
        let sample_rate = c_int::try_from(sample_rate)
            .map_err(|_| EngineError::Inference(format!("sample rate {sample_rate} out of range")))?;

        let status = unsafe {
            ew_run_inference(
                handle.0,
                audio.as_ptr(),
                sample_rate,
                c_int::from(resample_quality),
            )
        };
        if status != 0 {
            return Err(EngineError::Inference(self.last_error(handle)));
        }

        let (count, size, total) = unsafe {
            (
                ew_get_embedding_count(handle.0),
                ew_get_embedding_size(handle.0),
                ew_get_total_embedding_elements(handle.0),
            )
        };
        if total <= 0 || count <= 0 || size <= 0 {
            return Err(EngineError::EmptyOutput);
        }

        let mut flat = vec![0.0f32; total as usize];
        let copied = unsafe { ew_get_embeddings_flattened(handle.0, flat.as_mut_ptr(), total) };
        if !copied {
            return Err(EngineError::Inference(self.last_error(handle)));
        }

        mean_frames(&flat, count as usize, size as usize)
    }

    fn last_error(&self, handle: &ContextId) -> String {
        let len = unsafe { ew_get_error_length(handle.0) };
        if len <= 0 {
            return String::new();
        }

        // Room for the terminator
        let mut buffer = vec![0u8; len as usize + 1];
        let ok = unsafe { ew_get_error(handle.0, buffer.as_mut_ptr().cast::<c_char>(), len + 1) };
        if !ok {
            return "failed to read native error message".to_string();
        }

        let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
        String::from_utf8_lossy(&buffer[..end]).into_owned()
    }
}
