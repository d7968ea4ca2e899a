/// Frame pooling for engine output.
///
/// The model emits one embedding per analysis frame, flattened row-major as
/// `[frame_count, frame_size]`. A track embedding is the mean over frames.
use super::EngineError;

/// Average `frame_count` rows of `frame_size` floats into one vector.
pub fn mean_frames(
    flat: &[f32],
    frame_count: usize,
    frame_size: usize,
) -> Result<Vec<f32>, EngineError> {
    if frame_count == 0 || frame_size == 0 {
        return Err(EngineError::EmptyOutput);
    }
    if flat.len() != frame_count * frame_size {
        return Err(EngineError::Inference(format!(
            "output shape mismatch: {} elements for {frame_count}x{frame_size}",
            flat.len()
        )));
    }

    let mut result = vec![0.0f32; frame_size];
    for frame in flat.chunks_exact(frame_size) {
        for (acc, v) in result.iter_mut().zip(frame) {
            *acc += v;
        }
    }

    let inv = 1.0 / frame_count as f32;
    for v in &mut result {
        *v *= inv;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_single_frame() {
        let result = mean_frames(&[1.0, 2.0, 3.0], 1, 3).unwrap();
        assert_eq!(result, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_mean_multiple_frames() {
        // 2 frames, size 2
        let flat = vec![1.0, 2.0, 3.0, 6.0];
        let result = mean_frames(&flat, 2, 2).unwrap();
        assert_eq!(result, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_shape_mismatch() {
        let err = mean_frames(&[1.0, 2.0, 3.0], 2, 2).unwrap_err();
        assert!(matches!(err, EngineError::Inference(_)));
    }

    #[test]
    fn test_mean_empty() {
        assert!(matches!(
            mean_frames(&[], 0, 1280),
            Err(EngineError::EmptyOutput)
        ));
    }
}
