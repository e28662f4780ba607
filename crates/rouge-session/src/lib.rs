//! rouge-session: Live try-on session for the lipstick renderer.
//!
//! Wires a frame source, a landmark detector and a frame sink into two
//! cooperating loops: low-rate detection on tokio and display-rate rendering
//! on a dedicated thread.

pub mod config;
pub mod session;

pub use config::{Config, ConfigError};
pub use session::{
    start_try_on, FrameSink, Session, SessionError, SessionState, SessionStats, SinkError, TrackingStatus,
};
