//! Embedding extraction behind the [`InferenceBackend`] seam.
//!
//! The engine only sees the trait; [`OnnxRecognizer`] implements it with an
//! ArcFace-style model on ONNX Runtime, doing the affine warp in software.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{AffineMatrix, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0, ArcFace uses symmetric normalization
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    UnexpectedShape { expected: usize, actual: usize },
    #[error("embedding contains NaN or infinite values")]
    NonFiniteOutput,
    #[error("{0} called before preprocess")]
    NotPrepared(&'static str),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face embedding model driven in three stages.
///
/// Loading belongs to the implementor's constructor. Each stage is blocking
/// and failures are returned as-is; retries are the caller's business.
pub trait InferenceBackend: Send {
    /// Side length of the square aligned crop the model consumes.
    fn input_size(&self) -> usize {
        ALIGNED_SIZE
    }

    /// Length of the raw embedding [`postprocess`](Self::postprocess) returns.
    fn feature_len(&self) -> usize;

    /// Warp the face in `frame` through `matrix` and stage the model input.
    fn preprocess(&mut self, frame: &Frame, matrix: &AffineMatrix) -> Result<(), InferenceError>;

    /// Execute the model on the staged input.
    fn run(&mut self) -> Result<(), InferenceError>;

    /// Take the raw (unnormalized) embedding produced by the last run.
    fn postprocess(&mut self) -> Result<Vec<f32>, InferenceError>;

    /// preprocess → run → postprocess.
    fn extract(&mut self, frame: &Frame, matrix: &AffineMatrix) -> Result<Vec<f32>, InferenceError> {
        self.preprocess(frame, matrix)?;
        self.run()?;
        self.postprocess()
    }
}

/// ArcFace-style recognizer on ONNX Runtime.
pub struct OnnxRecognizer {
    session: Session,
    feature_len: usize,
    input: Option<Array4<f32>>,
    output: Option<Vec<f32>>,
}

impl OnnxRecognizer {
    /// Load the ONNX model from the given path.
    pub fn load(model_path: &str, feature_len: usize) -> Result<Self, InferenceError> {
        if !Path::new(model_path).exists() {
            return Err(InferenceError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            feature_len,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self {
            session,
            feature_len,
            input: None,
            output: None,
        })
    }

    /// Convert an aligned RGB crop into a normalized NCHW float tensor.
    fn to_tensor(aligned_face: &[u8], size: usize) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let base = (y * size + x) * Frame::CHANNELS;
                for c in 0..Frame::CHANNELS {
                    let pixel = aligned_face.get(base + c).copied().unwrap_or(0) as f32;
                    tensor[[0, c, y, x]] = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                }
            }
        }

        tensor
    }
}

impl InferenceBackend for OnnxRecognizer {
    fn feature_len(&self) -> usize {
        self.feature_len
    }

    fn preprocess(&mut self, frame: &Frame, matrix: &AffineMatrix) -> Result<(), InferenceError> {
        let size = self.input_size();
        let aligned = alignment::warp_affine(frame, matrix, size);
        self.input = Some(Self::to_tensor(&aligned, size));
        self.output = None;
        Ok(())
    }

    fn run(&mut self) -> Result<(), InferenceError> {
        let input = self.input.take().ok_or(InferenceError::NotPrepared("run"))?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(format!("embedding extraction: {e}")))?;

        self.output = Some(raw_data.to_vec());
        Ok(())
    }

    fn postprocess(&mut self) -> Result<Vec<f32>, InferenceError> {
        let raw = self.output.take().ok_or(InferenceError::NotPrepared("postprocess"))?;
        if raw.len() != self.feature_len {
            return Err(InferenceError::UnexpectedShape {
                expected: self.feature_len,
                actual: raw.len(),
            });
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = ALIGNED_SIZE;

    #[test]
    fn test_tensor_output_shape() {
        let aligned = vec![128u8; SIZE * SIZE * 3];
        let tensor = OnnxRecognizer::to_tensor(&aligned, SIZE);
        assert_eq!(tensor.shape(), &[1, 3, SIZE, SIZE]);
    }

    #[test]
    fn test_tensor_normalization() {
        let aligned = vec![128u8; SIZE * SIZE * 3];
        let tensor = OnnxRecognizer::to_tensor(&aligned, SIZE);
        // 128 - 127.5 = 0.5, / 127.5 ≈ 0.00392
        let val = tensor[[0, 0, 0, 0]];
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_tensor_channels_are_planar() {
        // One pixel with distinct R, G, B lands in three separate planes
        let mut aligned = vec![0u8; SIZE * SIZE * 3];
        let base = (5 * SIZE + 7) * 3;
        aligned[base..base + 3].copy_from_slice(&[255, 0, 128]);
        let tensor = OnnxRecognizer::to_tensor(&aligned, SIZE);
        assert!((tensor[[0, 0, 5, 7]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 7]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 7]] - (0.5 / 127.5)).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxRecognizer::load("/nonexistent/arcface.onnx", ARCFACE_EMBEDDING_DIM)
            .err()
            .unwrap();
        assert!(matches!(err, InferenceError::ModelNotFound(_)));
    }
}
