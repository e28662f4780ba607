//! RGBA frame buffer and the frame-source seam.

use image::RgbaImage;
use thiserror::Error;

/// A captured RGBA camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGBA pixel data (width * height * 4 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Wrap an RGBA buffer, checking its length against the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// A frame filled with one opaque color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// RGB of the pixel at `(x, y)`. Panics when out of bounds.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn into_image(self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.data)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl From<RgbaImage> for Frame {
    fn from(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid RGBA length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// Supplies the current camera frame.
///
/// `Ok(None)` means the source is not ready yet (e.g. stream still warming up);
/// the render tick skips itself in that case. `release` stops the underlying
/// capture and must be idempotent; implementations should also release on drop.
pub trait FrameSource: Send + 'static {
    fn current_frame(&mut self) -> Result<Option<Frame>, FrameSourceError>;

    fn release(&mut self);
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn current_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        (**self).current_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}
