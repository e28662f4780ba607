//! rouge-hw: Camera capture for the try-on session.
//!
//! Provides V4L2-based camera access that converts every captured buffer to
//! RGBA and plugs into the session as a [`rouge_core::FrameSource`].

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
