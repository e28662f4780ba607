use serde::{Deserialize, Serialize};

/// A tracked 2D facial reference point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

impl Keypoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Linear interpolation toward `other` by factor `t`.
    pub fn lerp(self, other: Keypoint, t: f32) -> Keypoint {
        Keypoint {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }

    pub fn distance(&self, other: &Keypoint) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Ordered, fixed-length set of keypoints produced by one detection.
///
/// Index meaning is defined by the detector and constant across frames.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeypointSet {
    points: Vec<Keypoint>,
}

impl KeypointSet {
    pub fn new(points: Vec<Keypoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Keypoint> {
        self.points.get(index).copied()
    }

    pub fn points(&self) -> &[Keypoint] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [Keypoint] {
        &mut self.points
    }

    /// Move every keypoint toward the matching keypoint of `target`.
    ///
    /// Both sets must have the same length; extra points on either side are ignored.
    pub fn approach(&mut self, target: &KeypointSet, factor: f32) {
        for (current, goal) in self.points.iter_mut().zip(target.points.iter()) {
            *current = current.lerp(*goal, factor);
        }
    }

    /// Largest per-keypoint distance to `other`.
    pub fn max_distance(&self, other: &KeypointSet) -> f32 {
        self.points
            .iter()
            .zip(other.points.iter())
            .map(|(a, b)| a.distance(b))
            .fold(0.0, f32::max)
    }
}

impl From<Vec<Keypoint>> for KeypointSet {
    fn from(points: Vec<Keypoint>) -> Self {
        Self::new(points)
    }
}

/// Interpolated closed loop through a subset of keypoints. Rebuilt every frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Curve {
    points: Vec<Keypoint>,
}

impl Curve {
    pub fn new(points: Vec<Keypoint>) -> Self {
        Self { points }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[Keypoint] {
        &self.points
    }

    /// Axis-aligned bounds `(min_x, min_y, max_x, max_y)`, or `None` when empty.
    pub fn bounds(&self) -> Option<(f32, f32, f32, f32)> {
        let first = self.points.first()?;
        Some(self.points.iter().fold(
            (first.x, first.y, first.x, first.y),
            |(x0, y0, x1, y1), p| (x0.min(p.x), y0.min(p.y), x1.max(p.x), y1.max(p.y)),
        ))
    }
}
