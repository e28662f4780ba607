//! Texture-preserving lip recoloring in HSV space.
//!
//! Hue and saturation move toward the lipstick shade while brightness stays
//! driven by the source pixel, so pores, creases and shading survive the
//! color change.

use crate::color::{blend_hue, hsv_to_rgb, rgb_to_hsv, Rgb};
use crate::frame::Frame;
use crate::mask::AlphaMask;
use crate::types::Keypoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixels below this alpha are left byte-identical.
pub const COMPOSITE_ALPHA_THRESHOLD: f32 = 0.05;
/// Weight of the lipstick hue against the original hue.
const HUE_WEIGHT: f32 = 0.85;
/// Fraction of the lipstick saturation used as the saturation floor.
const SATURATION_WEIGHT: f32 = 0.85;
/// Matte finish damps brightness to kill specular sheen.
const MATTE_DAMPING: f32 = 0.97;
/// Source catch-lights: bright, nearly unsaturated pixels.
const GLOSS_SOURCE_MIN_VALUE: f32 = 0.85;
const GLOSS_SOURCE_MAX_SATURATION: f32 = 0.3;
const GLOSS_VALUE_BOOST: f32 = 0.1;
/// Mix factor over-feathering to compensate for mask blur.
const FEATHER_GAIN: f32 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Finish {
    #[default]
    Matte,
    Gloss,
}

impl FromStr for Finish {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "matte" => Ok(Finish::Matte),
            "gloss" => Ok(Finish::Gloss),
            other => Err(format!("unknown finish {other:?}: expected \"matte\" or \"gloss\"")),
        }
    }
}

impl fmt::Display for Finish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Finish::Matte => "matte",
            Finish::Gloss => "gloss",
        })
    }
}

/// Recolor every pixel under `mask` toward `target` in place.
///
/// `target_value` is the brightness the lipstick should reach at full alpha
/// (see [`crate::lighting::target_value`]). The alpha channel is never touched.
pub fn composite(frame: &mut Frame, mask: &AlphaMask, target: Rgb, finish: Finish, target_value: f32) {
    let t = target.to_hsv();
    let target_s = t.s * SATURATION_WEIGHT;

    for (px, &alpha) in frame.data.chunks_exact_mut(4).zip(mask.data.iter()) {
        if alpha < COMPOSITE_ALPHA_THRESHOLD {
            continue;
        }
        let orig = rgb_to_hsv(px[0], px[1], px[2]);

        let h = blend_hue(orig.h, t.h, HUE_WEIGHT);
        let s = orig.s.max(target_s);
        let mut v = orig.v * (1.0 - alpha) + target_value * alpha;
        match finish {
            Finish::Matte => v *= MATTE_DAMPING,
            Finish::Gloss => {
                if orig.v > GLOSS_SOURCE_MIN_VALUE && orig.s < GLOSS_SOURCE_MAX_SATURATION {
                    v = (v + GLOSS_VALUE_BOOST).min(1.0);
                }
            }
        }

        let recolored = hsv_to_rgb(h, s, v);
        let mix = (alpha * FEATHER_GAIN).min(1.0);
        for c in 0..3 {
            let blended = recolored[c] as f32 * mix + px[c] as f32 * (1.0 - mix);
            px[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Specular highlight stroked along the upper lip for the gloss finish.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlossStyle {
    /// Start of the stroke as a fraction of the upper-lip curve.
    pub start: f32,
    /// End of the stroke as a fraction of the upper-lip curve.
    pub end: f32,
    /// Vertical offset from the outer contour, positive is down onto the lip.
    pub offset_y: f32,
    pub width: f32,
    pub blur_radius: usize,
    pub opacity: f32,
}

impl Default for GlossStyle {
    fn default() -> Self {
        Self {
            start: 0.3,
            end: 0.7,
            offset_y: 4.0,
            width: 8.0,
            blur_radius: 6,
            opacity: 0.22,
        }
    }
}

/// Slice of the upper-lip contour the highlight follows, already offset.
pub fn highlight_path(upper_lip: &[Keypoint], style: &GlossStyle) -> Vec<Keypoint> {
    let n = upper_lip.len();
    let start = ((style.start.clamp(0.0, 1.0) * n as f32) as usize).min(n);
    let end = ((style.end.clamp(0.0, 1.0) * n as f32) as usize).clamp(start, n);
    upper_lip[start..end]
        .iter()
        .map(|p| Keypoint::new(p.x, p.y + style.offset_y))
        .collect()
}

/// Additively blend a blurred white stroke along `path` into the frame.
pub fn stroke_gloss_highlight(frame: &mut Frame, path: &[Keypoint], style: &GlossStyle) {
    if path.len() < 2 || frame.width == 0 || frame.height == 0 {
        return;
    }
    let mut stroke = AlphaMask::zeros(frame.width, frame.height);
    let half = style.width / 2.0;
    let (x0, y0, x1, y1) = path.iter().fold(
        (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        |(a, b, c, d), p| (a.min(p.x), b.min(p.y), c.max(p.x), d.max(p.y)),
    );
    let px_range = |lo: f32, hi: f32, limit: u32| {
        let lo = (lo - half).floor().max(0.0) as u32;
        let hi = ((hi + half).ceil().max(0.0) as u32).min(limit);
        lo..hi
    };

    let w = frame.width as usize;
    for y in px_range(y0, y1, frame.height) {
        for x in px_range(x0, x1, frame.width) {
            let p = Keypoint::new(x as f32 + 0.5, y as f32 + 0.5);
            let inside = path
                .windows(2)
                .any(|seg| distance_to_segment(p, seg[0], seg[1]) <= half);
            if inside {
                stroke.data[y as usize * w + x as usize] = 1.0;
            }
        }
    }
    stroke.feather(style.blur_radius);

    let gain = 255.0 * style.opacity.clamp(0.0, 1.0);
    for (px, &a) in frame.data.chunks_exact_mut(4).zip(stroke.data.iter()) {
        if a <= 0.0 {
            continue;
        }
        let add = gain * a;
        for c in px.iter_mut().take(3) {
            *c = (*c as f32 + add).round().min(255.0) as u8;
        }
    }
}

fn distance_to_segment(p: Keypoint, a: Keypoint, b: Keypoint) -> f32 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return p.distance(&a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    p.distance(&Keypoint::new(a.x + t * dx, a.y + t * dy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_mask(width: u32, height: u32, rect: (u32, u32, u32, u32), alpha: f32) -> AlphaMask {
        let mut mask = AlphaMask::zeros(width, height);
        let (x0, y0, x1, y1) = rect;
        for y in y0..y1 {
            for x in x0..x1 {
                mask.data[(y * width + x) as usize] = alpha;
            }
        }
        mask
    }

    #[test]
    fn test_matte_red_on_gray() {
        let mut frame = Frame::filled(8, 8, [128, 128, 128]);
        let mask = block_mask(8, 8, (2, 2, 6, 6), 1.0);
        let target = Rgb::from_hex("#DC2626").unwrap();

        composite(&mut frame, &mask, target, Finish::Matte, 128.0 / 255.0);

        let [r, g, b] = frame.rgb_at(3, 3);
        let v = r.max(g).max(b);
        assert!((118..=128).contains(&v), "value should stay near source gray, got {v}");
        assert!(r > g + 60, "pixel should read as red: {r},{g},{b}");
        assert_eq!(g, b);
        assert!(g > 0, "desaturated red, not pure red");
        // Outside the mask nothing changes
        assert_eq!(frame.rgb_at(0, 0), [128, 128, 128]);
    }

    #[test]
    fn test_value_driven_by_source() {
        // Gloss without catch-lights applies no extra brightness term.
        let gray = 102u8;
        let v_src = gray as f32 / 255.0;
        let alpha = 0.95;
        let tv = 0.7;
        let mut frame = Frame::filled(10, 10, [gray; 3]);
        let mask = block_mask(10, 10, (0, 0, 10, 5), alpha);

        composite(&mut frame, &mask, Rgb::new(159, 18, 57), Finish::Gloss, tv);

        let masked: Vec<f32> = frame.data[..10 * 5 * 4]
            .chunks_exact(4)
            .map(|px| rgb_to_hsv(px[0], px[1], px[2]).v)
            .collect();
        let avg = masked.iter().sum::<f32>() / masked.len() as f32;
        let expected = v_src * (1.0 - alpha) + tv * alpha;
        assert!((avg - expected).abs() < 0.01, "avg {avg} expected {expected}");
    }

    #[test]
    fn test_texture_survives_recolor() {
        // Two source brightness levels must stay distinguishable after compositing.
        let mut frame = Frame::filled(2, 1, [90, 70, 70]);
        frame.data[4..7].copy_from_slice(&[150, 120, 120]);
        let mask = block_mask(2, 1, (0, 0, 2, 1), 0.5);

        composite(&mut frame, &mask, Rgb::new(220, 38, 38), Finish::Matte, 0.6);

        let dark = rgb_to_hsv(frame.data[0], frame.data[1], frame.data[2]).v;
        let light = rgb_to_hsv(frame.data[4], frame.data[5], frame.data[6]).v;
        assert!(light > dark + 0.05, "dark {dark} light {light}");
    }

    #[test]
    fn test_low_alpha_pixels_untouched() {
        let mut frame = Frame::filled(4, 4, [30, 140, 200]);
        let before = frame.data.clone();
        let mask = block_mask(4, 4, (0, 0, 4, 4), 0.049);
        composite(&mut frame, &mask, Rgb::new(220, 38, 38), Finish::Gloss, 1.0);
        assert_eq!(frame.data, before);
    }

    #[test]
    fn test_never_desaturates() {
        let mut frame = Frame::filled(1, 1, [200, 20, 20]);
        let orig_s = rgb_to_hsv(200, 20, 20).s;
        let mask = block_mask(1, 1, (0, 0, 1, 1), 1.0);
        // Pale pink target has low saturation
        composite(&mut frame, &mask, Rgb::new(250, 220, 225), Finish::Matte, 0.8);
        let [r, g, b] = frame.rgb_at(0, 0);
        assert!(rgb_to_hsv(r, g, b).s >= orig_s - 0.02);
    }

    #[test]
    fn test_gloss_boosts_catch_lights() {
        let mask = block_mask(1, 1, (0, 0, 1, 1), 0.5);
        let target = Rgb::new(220, 38, 38);

        let mut matte = Frame::filled(1, 1, [240, 235, 235]);
        composite(&mut matte, &mask, target, Finish::Matte, 0.6);
        let mut gloss = Frame::filled(1, 1, [240, 235, 235]);
        composite(&mut gloss, &mask, target, Finish::Gloss, 0.6);

        let v = |f: &Frame| {
            let [r, g, b] = f.rgb_at(0, 0);
            rgb_to_hsv(r, g, b).v
        };
        assert!(v(&gloss) > v(&matte) + 0.05);
    }

    #[test]
    fn test_alpha_channel_preserved() {
        let mut frame = Frame::filled(2, 2, [128, 128, 128]);
        frame.data[3] = 77;
        let mask = block_mask(2, 2, (0, 0, 2, 2), 1.0);
        composite(&mut frame, &mask, Rgb::new(220, 38, 38), Finish::Matte, 0.5);
        assert_eq!(frame.data[3], 77);
        assert_eq!(frame.data[7], 255);
    }

    #[test]
    fn test_finish_parse() {
        assert_eq!("matte".parse::<Finish>().unwrap(), Finish::Matte);
        assert_eq!(" Gloss ".parse::<Finish>().unwrap(), Finish::Gloss);
        assert!("satin".parse::<Finish>().is_err());
        assert_eq!(Finish::Gloss.to_string(), "gloss");
    }

    #[test]
    fn test_highlight_path_range_and_offset() {
        let upper: Vec<Keypoint> = (0..100).map(|i| Keypoint::new(i as f32, 10.0)).collect();
        let path = highlight_path(&upper, &GlossStyle::default());
        assert_eq!(path.len(), 40);
        assert_eq!(path[0], Keypoint::new(30.0, 14.0));
        assert!(highlight_path(&[], &GlossStyle::default()).is_empty());
    }

    #[test]
    fn test_gloss_stroke_brightens_along_path_only() {
        let mut frame = Frame::filled(60, 40, [100, 40, 40]);
        let path: Vec<Keypoint> = (20..50).map(|x| Keypoint::new(x as f32, 20.0)).collect();
        stroke_gloss_highlight(&mut frame, &path, &GlossStyle::default());

        let on = frame.rgb_at(30, 20);
        assert!(on[0] > 100 && on[1] > 40, "stroke should add light: {on:?}");
        assert!(on[0] <= 100 + 57, "opacity caps the addition: {on:?}");
        assert_eq!(frame.rgb_at(30, 2), [100, 40, 40]);
        assert_eq!(frame.rgb_at(2, 20), [100, 40, 40]);
    }

    #[test]
    fn test_distance_to_segment() {
        let a = Keypoint::new(0.0, 0.0);
        let b = Keypoint::new(10.0, 0.0);
        assert!((distance_to_segment(Keypoint::new(5.0, 3.0), a, b) - 3.0).abs() < 1e-6);
        assert!((distance_to_segment(Keypoint::new(-4.0, 3.0), a, b) - 5.0).abs() < 1e-6);
        assert!((distance_to_segment(Keypoint::new(2.0, 2.0), a, a) - 8f32.sqrt()).abs() < 1e-6);
    }
}
