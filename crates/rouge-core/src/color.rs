//! RGB / HSV / HSL conversions and hex parsing.
//!
//! Hue is in degrees [0, 360); saturation, value and lightness are in [0, 1].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ColorError {
    #[error("invalid hex color {0:?}: expected #RGB or #RRGGBB")]
    InvalidHex(String),
}

/// 8-bit sRGB color. Wire format is a hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#RRGGBB`, `RRGGBB`, `#RGB` or `RGB`.
    pub fn from_hex(hex: &str) -> Result<Self, ColorError> {
        let digits = hex.trim().trim_start_matches('#');
        let invalid = || ColorError::InvalidHex(hex.to_string());
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let channel = |s: &str| u8::from_str_radix(s, 16).map_err(|_| invalid());
        match digits.len() {
            6 => Ok(Self::new(
                channel(&digits[0..2])?,
                channel(&digits[2..4])?,
                channel(&digits[4..6])?,
            )),
            3 => {
                // "F0A" -> "FF00AA"
                let expand = |i: usize| channel(&digits[i..i + 1]).map(|v| v * 17);
                Ok(Self::new(expand(0)?, expand(1)?, expand(2)?))
            }
            _ => Err(invalid()),
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn to_hsv(&self) -> Hsv {
        rgb_to_hsv(self.r, self.g, self.b)
    }

    pub fn to_hsl(&self) -> Hsl {
        Hsl::from_rgb(*self)
    }
}

impl FromStr for Rgb {
    type Err = ColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Rgb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Rgb::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Hsv {
    pub h: f32,
    pub s: f32,
    pub v: f32,
}

impl Hsv {
    pub fn to_rgb(&self) -> Rgb {
        let [r, g, b] = hsv_to_rgb(self.h, self.s, self.v);
        Rgb::new(r, g, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Hsl {
    pub h: f32,
    pub s: f32,
    pub l: f32,
}

impl Hsl {
    pub fn from_rgb(rgb: Rgb) -> Self {
        let r = rgb.r as f32 / 255.0;
        let g = rgb.g as f32 / 255.0;
        let b = rgb.b as f32 / 255.0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let l = (max + min) / 2.0;
        if max == min {
            return Self { h: 0.0, s: 0.0, l };
        }
        let d = max - min;
        let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
        Self {
            h: hue_of(r, g, b, max, d),
            s,
            l,
        }
    }

    pub fn to_rgb(&self) -> Rgb {
        let c = (1.0 - (2.0 * self.l - 1.0).abs()) * self.s;
        let [r, g, b] = chroma_to_rgb(self.h, c, self.l - c / 2.0);
        Rgb::new(r, g, b)
    }

    /// Same hue and saturation at a different lightness, clamped to [0, 1].
    pub fn with_lightness(&self, l: f32) -> Self {
        Self {
            l: l.clamp(0.0, 1.0),
            ..*self
        }
    }
}

/// Hue in degrees from normalized channels, given `max` and `d = max - min > 0`.
fn hue_of(r: f32, g: f32, b: f32, max: f32, d: f32) -> f32 {
    let sector = if max == r {
        (g - b) / d + if g < b { 6.0 } else { 0.0 }
    } else if max == g {
        (b - r) / d + 2.0
    } else {
        (r - g) / d + 4.0
    };
    (sector * 60.0) % 360.0
}

/// Convert 8-bit RGB to HSV.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> Hsv {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let d = max - min;
    let s = if max == 0.0 { 0.0 } else { d / max };
    let h = if d == 0.0 { 0.0 } else { hue_of(r, g, b, max, d) };
    Hsv { h, s, v: max }
}

/// Convert HSV back to rounded 8-bit RGB. Out-of-range inputs are clamped.
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let s = s.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);
    let c = v * s;
    chroma_to_rgb(h, c, v - c)
}

fn chroma_to_rgb(h: f32, c: f32, m: f32) -> [u8; 3] {
    let h = h.rem_euclid(360.0) / 60.0;
    let x = c * (1.0 - ((h % 2.0) - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let to_byte = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    [to_byte(r), to_byte(g), to_byte(b)]
}

/// Blend hue `from` toward `to` by `t`, along the shorter arc of the color wheel.
///
/// Matches the linear blend `to * t + from * (1 - t)` whenever the hues are
/// within 180 degrees of each other.
pub fn blend_hue(from: f32, to: f32, t: f32) -> f32 {
    let mut delta = (to - from).rem_euclid(360.0);
    if delta > 180.0 {
        delta -= 360.0;
    }
    (from + delta * t).rem_euclid(360.0)
}
