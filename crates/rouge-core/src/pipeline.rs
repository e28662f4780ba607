//! Per-frame lipstick rendering: contours → mask → lighting → composite.

use crate::color::Rgb;
use crate::compositor::{self, Finish, GlossStyle};
use crate::contour::{self, DEFAULT_SAMPLES_PER_SEGMENT};
use crate::frame::Frame;
use crate::lighting;
use crate::mask::{self, MaskStyle};
use crate::topology::LipTopology;
use crate::types::KeypointSet;

/// Everything about the look of the applied lipstick.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderStyle {
    pub color: Rgb,
    pub finish: Finish,
    pub samples_per_segment: usize,
    pub mask: MaskStyle,
    pub gloss: GlossStyle,
}

impl RenderStyle {
    pub fn new(color: Rgb, finish: Finish) -> Self {
        Self {
            color,
            finish,
            samples_per_segment: DEFAULT_SAMPLES_PER_SEGMENT,
            mask: MaskStyle::default(),
            gloss: GlossStyle::default(),
        }
    }
}

/// What happened to a frame passed through [`LipRenderer::render`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderOutcome {
    /// A lip curve could not be built; the frame is untouched.
    NoLips,
    Applied {
        /// Pixels recolored (alpha at or above the compositing threshold).
        covered_pixels: usize,
        /// Brightness target derived from the lighting under the lips.
        target_value: f32,
    },
}

/// Stateless per-frame renderer. All scratch buffers live for one call.
#[derive(Debug, Clone)]
pub struct LipRenderer {
    topology: LipTopology,
    style: RenderStyle,
}

impl LipRenderer {
    pub fn new(topology: LipTopology, style: RenderStyle) -> Self {
        Self { topology, style }
    }

    pub fn topology(&self) -> &LipTopology {
        &self.topology
    }

    pub fn style(&self) -> &RenderStyle {
        &self.style
    }

    /// Swap the look between frames (e.g. the shopper picked another shade).
    pub fn set_style(&mut self, style: RenderStyle) {
        self.style = style;
    }

    /// Apply lipstick to `frame` using the given (smoothed) keypoints.
    pub fn render(&self, frame: &mut Frame, keypoints: &KeypointSet) -> RenderOutcome {
        let samples = self.style.samples_per_segment;
        let adjusted = self.topology.nudged(keypoints);
        let outer = contour::build_curve(&adjusted, &self.topology.outer_ring, samples);
        let inner = contour::build_curve(&adjusted, &self.topology.inner_ring, samples);
        if outer.is_empty() || inner.is_empty() {
            return RenderOutcome::NoLips;
        }

        let alpha = mask::rasterize(&outer, &inner, frame.width, frame.height, &self.style.mask);
        let average = lighting::sample_average_value(frame, &alpha);
        let target_value = lighting::target_value(average);

        compositor::composite(frame, &alpha, self.style.color, self.style.finish, target_value);

        if self.style.finish == Finish::Gloss {
            let upper_len = self.topology.upper_outer_segments.saturating_mul(samples).min(outer.len());
            let path = compositor::highlight_path(&outer.points()[..upper_len], &self.style.gloss);
            compositor::stroke_gloss_highlight(frame, &path, &self.style.gloss);
        }

        let covered_pixels = alpha.count_above(compositor::COMPOSITE_ALPHA_THRESHOLD);
        tracing::trace!(covered_pixels, average, target_value, "lipstick applied");
        RenderOutcome::Applied {
            covered_pixels,
            target_value,
        }
    }
}
