//! Closed lip contours via Catmull-Rom interpolation.

use crate::types::{Curve, Keypoint, KeypointSet};

/// Default interpolated points per ring segment.
pub const DEFAULT_SAMPLES_PER_SEGMENT: usize = 60;
/// Upper bound on samples per segment; larger requests are clamped.
pub const MAX_SAMPLES_PER_SEGMENT: usize = 240;

/// Uniform Catmull-Rom cubic through `p1`..`p2` at parameter `t` in [0, 1).
fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

/// Interpolate a smooth curve through `control` points.
///
/// Each segment `control[i] → control[i + 1]` is sampled `samples_per_segment`
/// times; neighbours beyond either end are clamped to the end points, which
/// keeps the mouth corners sharp instead of rounding them off.
/// `samples_per_segment` is clamped to [`MAX_SAMPLES_PER_SEGMENT`].
pub fn spline(control: &[Keypoint], samples_per_segment: usize) -> Curve {
    let samples_per_segment = samples_per_segment.min(MAX_SAMPLES_PER_SEGMENT);
    if control.len() < 2 || samples_per_segment == 0 {
        return Curve::empty();
    }
    let n = control.len();
    let mut out = Vec::with_capacity((n - 1) * samples_per_segment);

    for i in 0..n - 1 {
        let p0 = control[i.saturating_sub(1)];
        let p1 = control[i];
        let p2 = control[i + 1];
        let p3 = control[(i + 2).min(n - 1)];

        for k in 0..samples_per_segment {
            let t = k as f32 / samples_per_segment as f32;
            out.push(Keypoint::new(
                catmull_rom(p0.x, p1.x, p2.x, p3.x, t),
                catmull_rom(p0.y, p1.y, p2.y, p3.y, t),
            ));
        }
    }

    Curve::new(out)
}

/// Build the closed curve for one lip ring.
///
/// `keypoints` should already carry any corner nudges. Returns an empty curve
/// when the ring references a keypoint the set does not have (the detector
/// returned fewer points than the topology requires) or leaves fewer than two
/// control points.
pub fn build_curve(keypoints: &KeypointSet, ring: &[usize], samples_per_segment: usize) -> Curve {
    let control: Option<Vec<Keypoint>> = ring.iter().map(|&i| keypoints.get(i)).collect();
    match control {
        Some(points) => spline(&points, samples_per_segment),
        None => {
            tracing::trace!(
                ring_len = ring.len(),
                keypoints = keypoints.len(),
                "ring index outside keypoint set; no curve"
            );
            Curve::empty()
        }
    }
}
