//! Temporal landmark smoothing between detection and render rates.
//!
//! The detection tick writes the newest keypoints as the *target*; every
//! render tick moves the *smoothed* set a fixed fraction of the way toward it
//! and renders only the smoothed set, so detector jitter never pops on screen.

use crate::types::KeypointSet;

/// Consecutive misses after which the face counts as lost.
pub const DEFAULT_FACE_LOST_THRESHOLD: u32 = 10;
/// Fraction of the remaining distance covered per render tick.
pub const DEFAULT_SMOOTHING_FACTOR: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct LandmarkTracker {
    smoothed: Option<KeypointSet>,
    target: Option<KeypointSet>,
    consecutive_misses: u32,
    face_lost_threshold: u32,
}

impl LandmarkTracker {
    pub fn new(face_lost_threshold: u32) -> Self {
        Self {
            smoothed: None,
            target: None,
            consecutive_misses: 0,
            face_lost_threshold,
        }
    }

    /// Record the result of one detection tick.
    pub fn on_detection(&mut self, result: Option<KeypointSet>) {
        match result {
            Some(keypoints) => {
                let reseed = self
                    .smoothed
                    .as_ref()
                    .map_or(true, |s| s.len() != keypoints.len());
                if reseed {
                    // First sighting (or a detector with a new shape): no smoothing.
                    self.smoothed = Some(keypoints.clone());
                }
                if self.face_lost() {
                    tracing::info!(misses = self.consecutive_misses, "face reacquired");
                }
                self.target = Some(keypoints);
                self.consecutive_misses = 0;
            }
            None => {
                self.consecutive_misses = self.consecutive_misses.saturating_add(1);
                tracing::debug!(misses = self.consecutive_misses, "detection miss");
            }
        }
    }

    /// Move the smoothed keypoints toward the target by `smoothing_factor`.
    ///
    /// No-op until a target exists.
    pub fn advance(&mut self, smoothing_factor: f32) {
        if let (Some(smoothed), Some(target)) = (self.smoothed.as_mut(), self.target.as_ref()) {
            smoothed.approach(target, smoothing_factor);
        }
    }

    /// The keypoints to render: always the smoothed set, never the raw target.
    pub fn current_keypoints(&self) -> Option<&KeypointSet> {
        self.smoothed.as_ref()
    }

    pub fn target(&self) -> Option<&KeypointSet> {
        self.target.as_ref()
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn face_lost_threshold(&self) -> u32 {
        self.face_lost_threshold
    }

    /// True once the miss streak reaches the threshold. Cleared by the next detection.
    pub fn face_lost(&self) -> bool {
        self.consecutive_misses >= self.face_lost_threshold
    }

    /// Whether a render tick should composite lipstick this frame.
    pub fn should_composite(&self) -> bool {
        self.smoothed.is_some() && !self.face_lost()
    }

    /// Forget all tracking state.
    pub fn reset(&mut self) {
        self.smoothed = None;
        self.target = None;
        self.consecutive_misses = 0;
    }
}

impl Default for LandmarkTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FACE_LOST_THRESHOLD)
    }
}
