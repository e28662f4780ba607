//! Ambient lighting estimate under the lip mask.

use crate::color::rgb_to_hsv;
use crate::frame::Frame;
use crate::mask::AlphaMask;

/// Pixels at or below this alpha are not considered part of the lips.
const LIGHTING_ALPHA_THRESHOLD: f32 = 0.1;
/// Average brightness assumed when nothing is under the mask.
const NEUTRAL_VALUE: f32 = 0.5;
/// Lift applied on top of the measured brightness.
const VALUE_LIFT: f32 = 0.15;
const MIN_TARGET_VALUE: f32 = 0.15;
const MAX_TARGET_VALUE: f32 = 1.0;

/// Average HSV value of frame pixels where mask alpha > 0.1.
///
/// Returns 0.5 when no pixel passes the threshold.
pub fn sample_average_value(frame: &Frame, mask: &AlphaMask) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for (px, &alpha) in frame.data.chunks_exact(4).zip(mask.data.iter()) {
        if alpha > LIGHTING_ALPHA_THRESHOLD {
            sum += rgb_to_hsv(px[0], px[1], px[2]).v as f64;
            count += 1;
        }
    }
    if count == 0 {
        NEUTRAL_VALUE
    } else {
        (sum / count as f64) as f32
    }
}

/// Brightness the applied color should reach: slightly above ambient.
pub fn target_value(average_value: f32) -> f32 {
    (average_value + VALUE_LIFT).clamp(MIN_TARGET_VALUE, MAX_TARGET_VALUE)
}
