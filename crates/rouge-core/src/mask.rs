//! Lip-band mask: even-odd scanline fill plus Gaussian feathering.

use crate::types::{Curve, Keypoint};
use serde::{Deserialize, Serialize};

/// Peak mask intensity inside the lip band.
pub const DEFAULT_MASK_COVERAGE: f32 = 0.85;
/// Feather radius in pixels.
pub const DEFAULT_FEATHER_RADIUS: usize = 3;
/// Largest feather radius honoured; larger values are clamped.
pub const MAX_FEATHER_RADIUS: usize = 32;

/// Per-pixel coverage in [0, 1], same dimensions as the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AlphaMask {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl AlphaMask {
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            data: vec![0.0; width as usize * height as usize],
            width,
            height,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&a| a <= 0.0)
    }

    /// Number of pixels with alpha above `threshold`.
    pub fn count_above(&self, threshold: f32) -> usize {
        self.data.iter().filter(|&&a| a > threshold).count()
    }

    /// Fill the closed `polygon` using the even-odd rule, writing `coverage`
    /// into every pixel whose center is inside.
    pub fn fill_even_odd(&mut self, polygon: &[Keypoint], coverage: f32) {
        if polygon.len() < 3 || self.width == 0 || self.height == 0 {
            return;
        }
        let w = self.width as usize;
        let (min_y, max_y) = polygon
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| (lo.min(p.y), hi.max(p.y)));
        let row_start = (min_y - 0.5).ceil().max(0.0) as usize;
        let row_end = ((max_y - 0.5).floor() + 1.0).clamp(0.0, self.height as f32) as usize;

        let mut crossings: Vec<f32> = Vec::new();
        for row in row_start..row_end {
            let yc = row as f32 + 0.5;
            crossings.clear();
            for (i, a) in polygon.iter().enumerate() {
                let b = polygon[(i + 1) % polygon.len()];
                // Half-open rule so shared vertices are counted once
                if (a.y <= yc && b.y > yc) || (b.y <= yc && a.y > yc) {
                    let t = (yc - a.y) / (b.y - a.y);
                    crossings.push(a.x + t * (b.x - a.x));
                }
            }
            crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            for pair in crossings.chunks_exact(2) {
                // Pixel centers x + 0.5 in [pair[0], pair[1])
                let x0 = (pair[0] - 0.5).ceil().max(0.0) as usize;
                let x1 = (pair[1] - 0.5).ceil().clamp(0.0, w as f32) as usize;
                for x in x0..x1 {
                    self.data[row * w + x] = coverage;
                }
            }
        }
    }

    /// Zero every pixel whose center lies outside the closed `polygon`.
    pub fn clip_to(&mut self, polygon: &[Keypoint]) {
        let mut inside = AlphaMask::zeros(self.width, self.height);
        inside.fill_even_odd(polygon, 1.0);
        for (alpha, keep) in self.data.iter_mut().zip(&inside.data) {
            *alpha *= keep;
        }
    }

    /// Separable Gaussian blur truncated at `radius` pixels (sigma = radius / 2).
    ///
    /// Coverage never spreads more than `radius` pixels from where it was.
    /// The radius is clamped to [`MAX_FEATHER_RADIUS`].
    pub fn feather(&mut self, radius: usize) {
        let radius = radius.min(MAX_FEATHER_RADIUS);
        if radius == 0 || self.data.is_empty() {
            return;
        }
        let kernel = gaussian_kernel(radius);
        let w = self.width as usize;
        let h = self.height as usize;
        let mut tmp = vec![0.0f32; self.data.len()];

        // Horizontal pass, edges clamped
        for y in 0..h {
            let row = &self.data[y * w..(y + 1) * w];
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sx = (x + k).saturating_sub(radius).min(w - 1);
                    acc += row[sx] * weight;
                }
                tmp[y * w + x] = acc;
            }
        }

        // Vertical pass
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    let sy = (y + k).saturating_sub(radius).min(h - 1);
                    acc += tmp[sy * w + x] * weight;
                }
                self.data[y * w + x] = acc.clamp(0.0, 1.0);
            }
        }
    }
}

/// Normalized Gaussian taps for `-radius..=radius`.
fn gaussian_kernel(radius: usize) -> Vec<f32> {
    let sigma = radius as f32 / 2.0;
    let denom = 2.0 * sigma * sigma;
    let taps: Vec<f32> = (0..=2 * radius)
        .map(|k| {
            let d = k as f32 - radius as f32;
            (-(d * d) / denom).exp()
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / sum).collect()
}

/// How the lip band is drawn into the mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskStyle {
    /// Alpha written inside the band before feathering.
    pub coverage: f32,
    /// Blur radius in pixels; 0 disables feathering.
    pub feather_radius: usize,
}

impl Default for MaskStyle {
    fn default() -> Self {
        Self {
            coverage: DEFAULT_MASK_COVERAGE,
            feather_radius: DEFAULT_FEATHER_RADIUS,
        }
    }
}

/// Outline of the lip band: `outer` forward, then `inner` backward.
///
/// Both curves start at the same mouth corner, so the path runs around the
/// outer lip, jumps across to the end of the inner ring, walks it back to the
/// start, and closes on the first outer point.
pub fn band_outline(outer: &Curve, inner: &Curve) -> Vec<Keypoint> {
    let mut path = Vec::with_capacity(outer.len() + inner.len());
    path.extend_from_slice(outer.points());
    path.extend(inner.points().iter().rev().copied());
    path
}

/// Rasterize the region between `outer` and `inner` into a feathered mask.
///
/// The feather only softens inward: blur that spills past the outer contour
/// is cut off, so every covered pixel lies inside the outer lip line.
/// Returns an all-zero mask when either curve is empty.
pub fn rasterize(outer: &Curve, inner: &Curve, width: u32, height: u32, style: &MaskStyle) -> AlphaMask {
    let mut mask = AlphaMask::zeros(width, height);
    if outer.is_empty() || inner.is_empty() {
        return mask;
    }
    mask.fill_even_odd(&band_outline(outer, inner), style.coverage.clamp(0.0, 1.0));
    if style.feather_radius > 0 {
        mask.feather(style.feather_radius);
        mask.clip_to(outer.points());
    }
    mask
}
