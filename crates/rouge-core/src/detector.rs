//! Face landmark detection: the detector seam plus a Face Mesh model via ONNX Runtime.
//!
//! The model takes a 192×192 RGB crop and regresses 468 (x, y, z) landmarks in
//! input pixels together with a face-presence logit. Frames are letterboxed
//! into the input square and landmarks are mapped back to frame coordinates.

use crate::frame::Frame;
use crate::topology::FACE_MESH_KEYPOINTS;
use crate::types::{Keypoint, KeypointSet};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const FACE_MESH_INPUT_SIZE: usize = 192;
const FACE_MESH_MEAN: f32 = 127.5;
const FACE_MESH_STD: f32 = 127.5;
const FACE_MESH_PRESENCE_THRESHOLD: f32 = 0.5;
/// Values per landmark in the regression output (x, y, z).
const FACE_MESH_LANDMARK_STRIDE: usize = 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place a Face Mesh ONNX export in models/)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a keypoint set for the face in a frame.
///
/// `Ok(None)` is a miss (no face). Every successful result has exactly
/// [`keypoint_count`](LandmarkDetector::keypoint_count) keypoints in frame
/// pixel coordinates, with a fixed meaning per index.
pub trait LandmarkDetector: Send + 'static {
    fn keypoint_count(&self) -> usize;

    fn detect(&mut self, frame: &Frame) -> Result<Option<KeypointSet>, DetectorError>;
}

impl<T: LandmarkDetector + ?Sized> LandmarkDetector for Box<T> {
    fn keypoint_count(&self) -> usize {
        (**self).keypoint_count()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<KeypointSet>, DetectorError> {
        (**self).detect(frame)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    fn for_frame(width: usize, height: usize, input_size: usize) -> Self {
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (input_size as f32 - new_w) / 2.0,
            pad_y: (input_size as f32 - new_h) / 2.0,
        }
    }

    fn unmap(&self, x: f32, y: f32) -> Keypoint {
        Keypoint::new((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Face Mesh landmark regressor.
pub struct FaceMeshDetector {
    session: Session,
    input_size: usize,
    /// Output slots (landmarks, presence), discovered by name at load time.
    output_indices: (usize, usize),
}

impl FaceMeshDetector {
    /// Load the Face Mesh ONNX model (NCHW float input) from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded face mesh model"
        );

        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "face mesh model requires 2 outputs (landmarks, presence), got {}",
                output_names.len()
            )));
        }

        let output_indices = discover_output_indices(&output_names);
        tracing::debug!(?output_indices, "face mesh output tensor mapping");

        Ok(Self {
            session,
            input_size: FACE_MESH_INPUT_SIZE,
            output_indices,
        })
    }
}

impl LandmarkDetector for FaceMeshDetector {
    fn keypoint_count(&self) -> usize {
        FACE_MESH_KEYPOINTS
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<KeypointSet>, DetectorError> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(None);
        }
        let (input, letterbox) = preprocess(frame, self.input_size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (landmark_idx, presence_idx) = self.output_indices;
        let (_, presence) = outputs[presence_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("presence: {e}")))?;
        let logit = presence
            .first()
            .copied()
            .ok_or_else(|| DetectorError::InferenceFailed("empty presence tensor".into()))?;
        let confidence = sigmoid(logit);
        if confidence < FACE_MESH_PRESENCE_THRESHOLD {
            tracing::trace!(confidence, "no face in frame");
            return Ok(None);
        }

        let (_, raw) = outputs[landmark_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("landmarks: {e}")))?;
        let keypoints = decode_landmarks(raw, FACE_MESH_KEYPOINTS, &letterbox)?;
        tracing::trace!(confidence, "face mesh detected");
        Ok(Some(keypoints))
    }
}

/// Preprocess an RGBA frame into a NCHW float tensor with letterbox padding.
///
/// Resizes with bilinear interpolation, then normalizes each channel to [-1, 1].
fn preprocess(frame: &Frame, input_size: usize) -> (Array4<f32>, LetterboxInfo) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let letterbox = LetterboxInfo::for_frame(width, height, input_size);

    let new_w = ((width as f32 * letterbox.scale).round() as usize).min(input_size);
    let new_h = ((height as f32 * letterbox.scale).round() as usize).min(input_size);
    let pad_x_start = letterbox.pad_x.floor() as usize;
    let pad_y_start = letterbox.pad_y.floor() as usize;
    let inv_scale = 1.0 / letterbox.scale;

    // Pad with the mean so the border normalizes to 0.0
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let at = |px: usize, py: usize, c: usize| frame.data[(py * width + px) * 4 + c] as f32;
            for c in 0..3 {
                let val = at(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + at(x1, y0, c) * fx * (1.0 - fy)
                    + at(x0, y1, c) * (1.0 - fx) * fy
                    + at(x1, y1, c) * fx * fy;
                tensor[[0, c, pad_y_start + y, pad_x_start + x]] = (val - FACE_MESH_MEAN) / FACE_MESH_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Turn the flat (x, y, z) regression into frame-space keypoints. z is dropped.
fn decode_landmarks(raw: &[f32], count: usize, letterbox: &LetterboxInfo) -> Result<KeypointSet, DetectorError> {
    let needed = count * FACE_MESH_LANDMARK_STRIDE;
    if raw.len() < needed {
        return Err(DetectorError::InferenceFailed(format!(
            "landmark tensor has {} values, need {needed}",
            raw.len()
        )));
    }
    let points = raw[..needed]
        .chunks_exact(FACE_MESH_LANDMARK_STRIDE)
        .map(|v| letterbox.unmap(v[0], v[1]))
        .collect();
    Ok(KeypointSet::new(points))
}

/// Discover (landmarks, presence) output ordering by name.
///
/// Known exports name the landmark regression "landmarks"/"conv2d_21" and the
/// presence logit "score"/"face_flag"/"conv2d_31". Unrecognized names fall
/// back to positional ordering [0] = landmarks, [1] = presence.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let find = |candidates: &[&str]| names.iter().position(|n| candidates.iter().any(|c| n.contains(c)));

    match (
        find(&["landmark", "conv2d_21"]),
        find(&["score", "face_flag", "presence", "conv2d_31"]),
    ) {
        (Some(landmarks), Some(presence)) if landmarks != presence => (landmarks, presence),
        _ => {
            tracing::info!(?names, "face mesh: output names not recognized, using positional mapping");
            (0, 1)
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
