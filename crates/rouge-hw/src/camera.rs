//! V4L2 camera capture via the `v4l` crate, delivered as RGBA frames.

use crate::frame;
use rouge_core::frame::{Frame, FrameSource, FrameSourceError};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Mmap buffers queued with the driver.
const CAPTURE_BUFFER_COUNT: u32 = 4;
/// Highest /dev/videoN probed by [`Camera::list_devices`].
const MAX_PROBED_DEVICES: usize = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl From<CameraError> for FrameSourceError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::CaptureFailed(msg) => FrameSourceError::CaptureFailed(msg),
            other => FrameSourceError::Unavailable(other.to_string()),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB (3 bytes/pixel).
    Rgb3,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGB3" => Some(PixelFormat::Rgb3),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// V4L2 camera device handle with a persistent capture stream.
///
/// The stream is started on open and torn down by [`FrameSource::release`] or drop.
pub struct Camera {
    // Field order matters: the stream must drop before the device.
    stream: Option<MmapStream<'static>>,
    _device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera (e.g. "/dev/video0") and start streaming at about
    /// `width`×`height`. The driver may adjust the size; the negotiated one wins.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
            _ if e.to_string().contains("busy") || e.to_string().contains("EBUSY") => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV (universal on webcams); accept RGB3 or GREY if the driver insists.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, RGB3, or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, CAPTURE_BUFFER_COUNT)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        Ok(Self {
            stream: Some(stream),
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    /// Dequeue the next frame and convert it to RGBA.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureFailed("camera released".into()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let rgba = match pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgba(buf, width, height),
            PixelFormat::Rgb3 => frame::rgb24_to_rgba(buf, width, height),
            PixelFormat::Grey => frame::grey_to_rgba(buf, width, height),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("conversion failed: {e}")))?;

        Frame::new(rgba, width, height, meta.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..MAX_PROBED_DEVICES {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn current_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        if self.stream.is_none() {
            return Err(FrameSourceError::Unavailable(format!("{} released", self.device_path)));
        }
        Ok(Some(self.capture_frame()?))
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}
