//! rouge-core: Virtual lipstick rendering engine.
//!
//! Reconstructs smooth lip contours from face landmarks, rasterizes a
//! feathered lip-band mask and recolors the lips in HSV space so the natural
//! texture and lighting of the skin survive. Landmarks come from a Face Mesh
//! model running via ONNX Runtime, or from any other [`LandmarkDetector`].

pub mod color;
pub mod compositor;
pub mod contour;
pub mod detector;
pub mod frame;
pub mod lighting;
pub mod mask;
pub mod pipeline;
pub mod topology;
pub mod tracker;
pub mod types;

pub use color::{ColorError, Rgb};
pub use compositor::{Finish, GlossStyle};
pub use detector::{DetectorError, FaceMeshDetector, LandmarkDetector};
pub use frame::{Frame, FrameError, FrameSource, FrameSourceError};
pub use mask::MaskStyle;
pub use pipeline::{LipRenderer, RenderOutcome, RenderStyle};
pub use topology::{LipTopology, TopologyError};
pub use tracker::LandmarkTracker;
pub use types::{Curve, Keypoint, KeypointSet};
