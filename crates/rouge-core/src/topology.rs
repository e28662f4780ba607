//! Lip topology: which keypoint indices form the outer and inner lip rings.
//!
//! The index tables are part of the detector's contract, not derived data. The
//! built-in table targets the 468-point MediaPipe Face Mesh; other detectors
//! supply their own table (e.g. loaded from TOML).

use crate::types::KeypointSet;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Face Mesh keypoint count.
pub const FACE_MESH_KEYPOINTS: usize = 468;

/// Dense outer lip ring, starting and ending at the left mouth corner (61).
const FACE_MESH_OUTER_LIP: [usize; 21] = [
    61, 185, 40, 39, 37, 0, 267, 269, 270, 409, 291, 375, 321, 405, 314, 17, 84, 181, 91, 146, 61,
];

/// Dense inner lip ring, starting and ending at the left inner corner (78).
const FACE_MESH_INNER_LIP: [usize; 21] = [
    78, 191, 80, 81, 82, 13, 312, 311, 310, 415, 308, 324, 318, 402, 317, 14, 87, 178, 88, 95, 78,
];

const FACE_MESH_LEFT_MOUTH_CORNER: usize = 61;
const FACE_MESH_RIGHT_MOUTH_CORNER: usize = 291;

/// Horizontal push applied to each mouth corner before curve fitting.
/// Hand-tuned: widens the mask by a pixel so the lip corners are not left bare.
pub const MOUTH_CORNER_NUDGE_PX: f32 = 1.0;

/// Outer-ring segments 61 → 291 trace the upper lip.
const FACE_MESH_UPPER_OUTER_SEGMENTS: usize = 10;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("{ring} ring needs at least 3 indices, got {len}")]
    TooShort { ring: &'static str, len: usize },
    #[error("{ring} ring is not closed: first index {first} != last index {last}")]
    NotClosed {
        ring: &'static str,
        first: usize,
        last: usize,
    },
    #[error("{ring} ring index {index} out of range for {count} keypoints")]
    IndexOutOfRange {
        ring: &'static str,
        index: usize,
        count: usize,
    },
    #[error("topology expects {expected} keypoints but the detector produces {actual}")]
    KeypointCountMismatch { expected: usize, actual: usize },
    #[error("upper segment count {segments} exceeds outer ring length")]
    UpperSegmentsOutOfRange { segments: usize },
    #[error("failed to read topology file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse topology file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Fixed pixel offset applied to one keypoint before curve fitting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerNudge {
    pub index: usize,
    #[serde(default)]
    pub dx: f32,
    #[serde(default)]
    pub dy: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LipTopology {
    /// Number of keypoints the detector emits.
    pub keypoint_count: usize,
    /// Closed loop around the outside of both lips.
    pub outer_ring: Vec<usize>,
    /// Closed loop around the mouth opening.
    pub inner_ring: Vec<usize>,
    /// Leading outer-ring segments that belong to the upper lip.
    pub upper_outer_segments: usize,
    #[serde(default)]
    pub corner_nudges: Vec<CornerNudge>,
}

impl LipTopology {
    /// Built-in table for the MediaPipe Face Mesh.
    pub fn face_mesh() -> Self {
        Self {
            keypoint_count: FACE_MESH_KEYPOINTS,
            outer_ring: FACE_MESH_OUTER_LIP.to_vec(),
            inner_ring: FACE_MESH_INNER_LIP.to_vec(),
            upper_outer_segments: FACE_MESH_UPPER_OUTER_SEGMENTS,
            corner_nudges: vec![
                CornerNudge {
                    index: FACE_MESH_LEFT_MOUTH_CORNER,
                    dx: -MOUTH_CORNER_NUDGE_PX,
                    dy: 0.0,
                },
                CornerNudge {
                    index: FACE_MESH_RIGHT_MOUTH_CORNER,
                    dx: MOUTH_CORNER_NUDGE_PX,
                    dy: 0.0,
                },
            ],
        }
    }

    /// Load a topology table from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: display.clone(),
            source,
        })?;
        let topology: Self = toml::from_str(&text).map_err(|source| TopologyError::Parse {
            path: display,
            source,
        })?;
        topology.validate()?;
        Ok(topology)
    }

    /// Check ring shape and that every index fits `keypoint_count`.
    pub fn validate(&self) -> Result<(), TopologyError> {
        for (ring, indices) in [("outer", &self.outer_ring), ("inner", &self.inner_ring)] {
            if indices.len() < 3 {
                return Err(TopologyError::TooShort {
                    ring,
                    len: indices.len(),
                });
            }
            let (first, last) = (indices[0], indices[indices.len() - 1]);
            if first != last {
                return Err(TopologyError::NotClosed { ring, first, last });
            }
            if let Some(&index) = indices.iter().find(|&&i| i >= self.keypoint_count) {
                return Err(TopologyError::IndexOutOfRange {
                    ring,
                    index,
                    count: self.keypoint_count,
                });
            }
        }
        if self.upper_outer_segments >= self.outer_ring.len() {
            return Err(TopologyError::UpperSegmentsOutOfRange {
                segments: self.upper_outer_segments,
            });
        }
        Ok(())
    }

    /// Validate against the keypoint count a detector actually produces.
    pub fn check_detector(&self, detector_keypoints: usize) -> Result<(), TopologyError> {
        if detector_keypoints != self.keypoint_count {
            return Err(TopologyError::KeypointCountMismatch {
                expected: self.keypoint_count,
                actual: detector_keypoints,
            });
        }
        self.validate()
    }

    /// Copy of `keypoints` with the corner nudges applied. Nudges whose index
    /// is outside the set are skipped.
    pub fn nudged(&self, keypoints: &KeypointSet) -> KeypointSet {
        let mut adjusted = keypoints.clone();
        let points = adjusted.points_mut();
        for nudge in &self.corner_nudges {
            if let Some(p) = points.get_mut(nudge.index) {
                p.x += nudge.dx;
                p.y += nudge.dy;
            }
        }
        adjusted
    }
}

impl Default for LipTopology {
    fn default() -> Self {
        Self::face_mesh()
    }
}
