//! Try-on session: lifecycle plus the detection and render loops.
//!
//! Detection runs at a low rate on a blocking worker and only writes the
//! tracker target. Rendering runs at display rate on its own OS thread, so a
//! stalled camera never holds up the async runtime; it smooths toward the
//! target and composites the lipstick. The two sides meet at one
//! mutex-guarded [`LandmarkTracker`] and a `watch` channel carrying the newest
//! raw frame. Either side ends the whole session on an unrecoverable failure.

use crate::config::Config;
use rouge_core::frame::{Frame, FrameSource, FrameSourceError};
use rouge_core::{
    DetectorError, KeypointSet, LandmarkDetector, LandmarkTracker, LipRenderer, RenderOutcome, RenderStyle,
    TopologyError,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("sink I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Destination for rendered frames (display surface, encoder, file writer).
pub trait FrameSink: Send + 'static {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError> {
        (**self).present(frame)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture error: {0}")]
    Capture(#[from] FrameSourceError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("session is {state:?}, cannot start")]
    InvalidState { state: SessionState },
    #[error("session task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    /// A capture, sink or detector failure ended the session on its own.
    /// Everything is released; [`Session::stop`] returns the error.
    Failed,
    Stopped,
}

/// Face tracking status as seen by the detection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    /// No face detected yet.
    Searching,
    Tracking,
    /// Miss streak reached the threshold; lipstick is suspended.
    FaceLost,
}

/// Snapshot of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_presented: u64,
    pub frames_composited: u64,
    pub detections: u64,
    pub misses: u64,
}

#[derive(Default)]
struct Counters {
    frames_presented: AtomicU64,
    frames_composited: AtomicU64,
    detections: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_composited: self.frames_composited.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Session state shared with both loops: the published state, the halt flag
/// and the first fatal error.
struct Lifecycle {
    state_tx: watch::Sender<SessionState>,
    halt: AtomicBool,
    failure: Mutex<Option<SessionError>>,
}

impl Lifecycle {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            state_tx,
            halt: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    fn halt(&self) {
        self.halt.store(true, Ordering::Release);
    }

    /// Keep the first fatal error, halt both loops and publish `Failed`.
    fn fail(&self, error: SessionError) {
        tracing::error!(error = %error, "session failed");
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.halt();
        self.state_tx.send_if_modified(|state| {
            if matches!(state, SessionState::Starting | SessionState::Running) {
                *state = SessionState::Failed;
                true
            } else {
                false
            }
        });
    }

    fn take_failure(&self) -> Option<SessionError> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

type SharedTracker = Arc<Mutex<LandmarkTracker>>;
type LatestFrame = Option<Arc<Frame>>;

/// Result of one render tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// The source had no frame yet; nothing was presented.
    NotReady,
    Presented { composited: bool },
}

/// Per-tick render work, owned by the render thread.
///
/// Dropping it drops the sink, then releases the frame source.
pub(crate) struct RenderLoop {
    source: Box<dyn FrameSource>,
    sink: Option<Box<dyn FrameSink>>,
    renderer: LipRenderer,
    style_rx: watch::Receiver<RenderStyle>,
    tracker: SharedTracker,
    smoothing_factor: f32,
    frame_tx: watch::Sender<LatestFrame>,
    /// Raised by detection when it is ready for another frame.
    frame_wanted: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl RenderLoop {
    /// Advance smoothing, pull a frame, hand a raw copy to detection if it
    /// asked for one, composite if tracking, present.
    pub(crate) fn tick(&mut self) -> Result<TickOutcome, SessionError> {
        if self.style_rx.has_changed().unwrap_or(false) {
            self.renderer.set_style(self.style_rx.borrow_and_update().clone());
        }

        let keypoints = {
            let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            tracker.advance(self.smoothing_factor);
            if tracker.should_composite() {
                tracker.current_keypoints().cloned()
            } else {
                None
            }
        };

        let Some(mut frame) = self.source.current_frame()? else {
            tracing::trace!("frame not ready, skipping tick");
            return Ok(TickOutcome::NotReady);
        };
        if self.frame_wanted.swap(false, Ordering::AcqRel) {
            self.frame_tx.send_replace(Some(Arc::new(frame.clone())));
        }

        let composited = match &keypoints {
            Some(keypoints) => matches!(self.renderer.render(&mut frame, keypoints), RenderOutcome::Applied { .. }),
            None => false,
        };

        let Some(sink) = self.sink.as_mut() else {
            return Err(SinkError::Closed.into());
        };
        sink.present(&frame)?;
        self.counters.frames_presented.fetch_add(1, Ordering::Relaxed);
        if composited {
            self.counters.frames_composited.fetch_add(1, Ordering::Relaxed);
        }
        Ok(TickOutcome::Presented { composited })
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            drop(sink);
            tracing::debug!("sink released");
        }
        self.source.release();
        tracing::debug!("frame source released");
    }
}

/// Render thread body: tick every `period` (missed ticks are skipped) until
/// halted or a tick fails.
fn run_render_loop(mut render: RenderLoop, period: Duration, lifecycle: Arc<Lifecycle>) {
    tracing::info!("render thread started");
    let mut next = Instant::now();
    while !lifecycle.halted() {
        if let Err(e) = render.tick() {
            lifecycle.fail(e);
            break;
        }
        next += period;
        let now = Instant::now();
        match next.checked_duration_since(now) {
            Some(wait) => std::thread::sleep(wait),
            None => next = now,
        }
    }
    drop(render);
    tracing::info!("render thread exiting");
}

/// Feed one detection result into the tracker and publish the tracking status.
fn record_detection(
    tracker: &Mutex<LandmarkTracker>,
    status_tx: &watch::Sender<TrackingStatus>,
    counters: &Counters,
    detection: Option<KeypointSet>,
) -> TrackingStatus {
    let counter = if detection.is_some() {
        &counters.detections
    } else {
        &counters.misses
    };
    counter.fetch_add(1, Ordering::Relaxed);

    let status = {
        let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.on_detection(detection);
        if tracker.face_lost() {
            TrackingStatus::FaceLost
        } else if tracker.current_keypoints().is_some() {
            TrackingStatus::Tracking
        } else {
            TrackingStatus::Searching
        }
    };

    status_tx.send_if_modified(|current| {
        if *current == status {
            return false;
        }
        if status == TrackingStatus::FaceLost {
            tracing::warn!("face not detected");
        }
        *current = status;
        true
    });
    status
}

/// Everything the detection task owns.
struct DetectionLoop {
    detector: Box<dyn LandmarkDetector>,
    frame_rx: watch::Receiver<LatestFrame>,
    frame_wanted: Arc<AtomicBool>,
    tracker: SharedTracker,
    status_tx: Arc<watch::Sender<TrackingStatus>>,
    counters: Arc<Counters>,
    lifecycle: Arc<Lifecycle>,
}

impl DetectionLoop {
    async fn run(self, period: Duration, mut shutdown: oneshot::Receiver<()>) {
        let DetectionLoop {
            mut detector,
            mut frame_rx,
            frame_wanted,
            tracker,
            status_tx,
            counters,
            lifecycle,
        } = self;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if lifecycle.halted() {
                        break;
                    }
                    if !frame_rx.has_changed().unwrap_or(false) {
                        continue;
                    }
                    let latest = frame_rx.borrow_and_update().clone();
                    let Some(frame) = latest else {
                        continue;
                    };

                    let joined = tokio::task::spawn_blocking(move || {
                        let result = detector.detect(&frame);
                        (detector, result)
                    })
                    .await;
                    let (returned, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            // Detector died with the worker; stop before stale landmarks linger
                            lifecycle.fail(SessionError::TaskFailed(format!("detector worker: {e}")));
                            return;
                        }
                    };
                    detector = returned;
                    frame_wanted.store(true, Ordering::Release);

                    let detection = result.unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "detection failed, counting as miss");
                        None
                    });
                    record_detection(&tracker, &status_tx, &counters, detection);
                }
            }
        }

        drop(detector);
        tracing::debug!("detector released");
    }
}

struct RunningTasks {
    detection: JoinHandle<()>,
    detection_stop: oneshot::Sender<()>,
    render: std::thread::JoinHandle<()>,
}

/// A live try-on session.
pub struct Session {
    config: Config,
    style_tx: watch::Sender<RenderStyle>,
    status_tx: Arc<watch::Sender<TrackingStatus>>,
    counters: Arc<Counters>,
    lifecycle: Arc<Lifecycle>,
    tasks: Option<RunningTasks>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let (style_tx, _) = watch::channel(config.render_style());
        let (status_tx, _) = watch::channel(TrackingStatus::Searching);
        Self {
            config,
            style_tx,
            status_tx: Arc::new(status_tx),
            counters: Arc::new(Counters::default()),
            lifecycle: Arc::new(Lifecycle::new()),
            tasks: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Follow state changes, e.g. to notice a session that failed on its own.
    pub fn state_updates(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.state_tx.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Swap the lipstick look; picked up by the next render tick.
    pub fn set_style(&self, style: RenderStyle) {
        self.style_tx.send_replace(style);
    }

    pub fn tracking(&self) -> watch::Receiver<TrackingStatus> {
        self.status_tx.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Acquire the frame source, load the detector, check the topology and
    /// start both loops.
    ///
    /// Fails fast: any initialization error leaves the session Stopped with
    /// everything acquired so far released, and nothing is ever rendered.
    pub async fn start<S, D, K>(
        &mut self,
        open_source: impl FnOnce() -> Result<S, FrameSourceError> + Send + 'static,
        load_detector: impl FnOnce() -> Result<D, DetectorError> + Send + 'static,
        sink: K,
    ) -> Result<(), SessionError>
    where
        S: FrameSource,
        D: LandmarkDetector,
        K: FrameSink,
    {
        let state = self.state();
        if state != SessionState::Idle {
            return Err(SessionError::InvalidState { state });
        }
        self.lifecycle.set_state(SessionState::Starting);
        tracing::info!("session starting");

        let (source, detector, renderer) = match self.initialize(open_source, load_detector).await {
            Ok(parts) => parts,
            Err(e) => {
                self.lifecycle.set_state(SessionState::Stopped);
                tracing::error!(error = %e, "session failed to start");
                return Err(e);
            }
        };

        let tracker: SharedTracker = Arc::new(Mutex::new(LandmarkTracker::new(self.config.face_lost_threshold)));
        let (frame_tx, frame_rx) = watch::channel(None);
        let frame_wanted = Arc::new(AtomicBool::new(true));
        self.status_tx.send_replace(TrackingStatus::Searching);

        let render = RenderLoop {
            source,
            sink: Some(Box::new(sink)),
            renderer,
            style_rx: self.style_tx.subscribe(),
            tracker: Arc::clone(&tracker),
            smoothing_factor: self.config.smoothing_factor,
            frame_tx,
            frame_wanted: Arc::clone(&frame_wanted),
            counters: Arc::clone(&self.counters),
        };
        let detection = DetectionLoop {
            detector,
            frame_rx,
            frame_wanted,
            tracker,
            status_tx: Arc::clone(&self.status_tx),
            counters: Arc::clone(&self.counters),
            lifecycle: Arc::clone(&self.lifecycle),
        };

        // Running before the loops exist, so a failure in the first tick lands as Failed
        self.lifecycle.set_state(SessionState::Running);
        let period = self.config.render_interval();
        let lifecycle = Arc::clone(&self.lifecycle);
        let spawned = std::thread::Builder::new()
            .name("rouge-render".into())
            .spawn(move || run_render_loop(render, period, lifecycle));
        let render = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.lifecycle.set_state(SessionState::Stopped);
                tracing::error!(error = %e, "failed to spawn render thread");
                return Err(SessionError::TaskFailed(format!("spawning render thread: {e}")));
            }
        };

        let (detection_stop, detection_shutdown) = oneshot::channel();
        let detection = tokio::spawn(detection.run(self.config.detection_interval(), detection_shutdown));

        self.tasks = Some(RunningTasks {
            detection,
            detection_stop,
            render,
        });
        tracing::info!(
            detection_ms = self.config.detection_interval_ms,
            render_ms = self.config.render_interval_ms,
            "session running"
        );
        Ok(())
    }

    async fn initialize<S, D>(
        &self,
        open_source: impl FnOnce() -> Result<S, FrameSourceError> + Send + 'static,
        load_detector: impl FnOnce() -> Result<D, DetectorError> + Send + 'static,
    ) -> Result<(Box<dyn FrameSource>, Box<dyn LandmarkDetector>, LipRenderer), SessionError>
    where
        S: FrameSource,
        D: LandmarkDetector,
    {
        let mut source: Box<dyn FrameSource> = Box::new(run_blocking(open_source).await??);
        tracing::info!("frame source acquired");

        let detector = match run_blocking(load_detector).await {
            Ok(Ok(detector)) => detector,
            Ok(Err(e)) => {
                source.release();
                return Err(e.into());
            }
            Err(e) => {
                source.release();
                return Err(e);
            }
        };
        tracing::info!(keypoints = detector.keypoint_count(), "detector loaded");

        let topology = self
            .config
            .topology()
            .and_then(|t| t.check_detector(detector.keypoint_count()).map(|()| t));
        let topology = match topology {
            Ok(t) => t,
            Err(e) => {
                source.release();
                return Err(e.into());
            }
        };

        let style = self.style_tx.borrow().clone();
        let detector: Box<dyn LandmarkDetector> = Box::new(detector);
        Ok((source, detector, LipRenderer::new(topology, style)))
    }

    /// Stop the session: detection first (detector dropped), then rendering
    /// (sink dropped), then the frame source is released.
    ///
    /// Idempotent. Returns the error that ended the session early, if any.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        let Some(tasks) = self.tasks.take() else {
            if self.state() == SessionState::Idle {
                self.lifecycle.set_state(SessionState::Stopped);
            }
            return Ok(());
        };
        tracing::info!("session stopping");

        let _ = tasks.detection_stop.send(());
        if let Err(e) = tasks.detection.await {
            tracing::warn!(error = %e, "detection task ended abnormally");
        }

        self.lifecycle.halt();
        let render = tasks.render;
        let joined = match run_blocking(move || render.join()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::TaskFailed("render thread panicked".into())),
            Err(e) => Err(e),
        };
        self.lifecycle.set_state(SessionState::Stopped);
        tracing::info!(stats = ?self.counters.snapshot(), "session stopped");

        match self.lifecycle.take_failure() {
            Some(e) => Err(e),
            None => joined,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tracing::warn!("session dropped while running; aborting detection, halting render thread");
            tasks.detection.abort();
            self.lifecycle.halt();
        }
    }
}

async fn run_blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Result<T, SessionError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SessionError::TaskFailed(e.to_string()))
}

/// Open a session and start it in one step; `Session::stop` is the cleanup.
pub async fn start_try_on<S, D, K>(
    config: Config,
    open_source: impl FnOnce() -> Result<S, FrameSourceError> + Send + 'static,
    load_detector: impl FnOnce() -> Result<D, DetectorError> + Send + 'static,
    sink: K,
) -> Result<Session, SessionError>
where
    S: FrameSource,
    D: LandmarkDetector,
    K: FrameSink,
{
    let mut session = Session::new(config);
    session.start(open_source, load_detector, sink).await?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouge_core::topology::FACE_MESH_KEYPOINTS;
    use rouge_core::{Keypoint, LipTopology, Rgb};

    type Events = Arc<Mutex<Vec<&'static str>>>;

    fn events() -> Events {
        Arc::new(Mutex::new(Vec::new()))
    }

    struct FakeSource {
        events: Events,
        released: bool,
        ready: bool,
        fail: bool,
        /// Simulates a camera that blocks in capture.
        delay: Option<Duration>,
    }

    impl FakeSource {
        fn new(events: &Events) -> Self {
            Self {
                events: Arc::clone(events),
                released: false,
                ready: true,
                fail: false,
                delay: None,
            }
        }
    }

    impl FrameSource for FakeSource {
        fn current_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail {
                return Err(FrameSourceError::CaptureFailed("unplugged".into()));
            }
            Ok(self.ready.then(|| Frame::filled(160, 120, [128, 128, 128])))
        }

        fn release(&mut self) {
            if !self.released {
                self.released = true;
                self.events.lock().unwrap().push("source");
            }
        }
    }

    struct FakeDetector {
        events: Events,
        keypoints: usize,
        face: Option<KeypointSet>,
        calls: u32,
        /// Panic once this many detections have succeeded.
        crash_after: Option<u32>,
    }

    impl LandmarkDetector for FakeDetector {
        fn keypoint_count(&self) -> usize {
            self.keypoints
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Option<KeypointSet>, DetectorError> {
            if self.crash_after.is_some_and(|n| self.calls >= n) {
                panic!("inference runtime crashed");
            }
            self.calls += 1;
            Ok(self.face.clone())
        }
    }

    impl Drop for FakeDetector {
        fn drop(&mut self) {
            self.events.lock().unwrap().push("detector");
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<[u8; 3]>>>,
        events: Option<Events>,
    }

    impl FrameSink for RecordingSink {
        fn present(&mut self, frame: &Frame) -> Result<(), SinkError> {
            self.frames.lock().unwrap().push(frame.rgb_at(80, 47));
            Ok(())
        }
    }

    impl Drop for RecordingSink {
        fn drop(&mut self) {
            if let Some(events) = &self.events {
                events.lock().unwrap().push("sink");
            }
        }
    }

    /// Lip rings on two ellipses centered in a 160×120 frame.
    fn synthetic_face() -> KeypointSet {
        let topo = LipTopology::face_mesh();
        let mut points = vec![Keypoint::default(); FACE_MESH_KEYPOINTS];
        for (ring, rx, ry) in [(&topo.outer_ring, 40.0f32, 18.0f32), (&topo.inner_ring, 28.0, 5.0)] {
            let n = ring.len() - 1;
            for (i, &idx) in ring[..n].iter().enumerate() {
                let a = std::f32::consts::PI + i as f32 / n as f32 * std::f32::consts::TAU;
                points[idx] = Keypoint::new(80.0 + rx * a.cos(), 60.0 + ry * a.sin());
            }
        }
        KeypointSet::new(points)
    }

    fn fast_config() -> Config {
        Config {
            detection_interval_ms: 5,
            render_interval_ms: 2,
            ..Config::default()
        }
    }

    fn fake_detector(events: &Events, face: Option<KeypointSet>) -> FakeDetector {
        FakeDetector {
            events: Arc::clone(events),
            keypoints: FACE_MESH_KEYPOINTS,
            face,
            calls: 0,
            crash_after: None,
        }
    }

    fn render_loop(tracker: &SharedTracker, sink: RecordingSink) -> RenderLoop {
        let events = events();
        let (_style_tx, style_rx) = watch::channel(RenderStyle::new(Rgb::new(220, 38, 38), Default::default()));
        let initial = style_rx.borrow().clone();
        let (frame_tx, _) = watch::channel(None);
        RenderLoop {
            source: Box::new(FakeSource::new(&events)),
            sink: Some(Box::new(sink)),
            renderer: LipRenderer::new(LipTopology::face_mesh(), initial),
            style_rx,
            tracker: Arc::clone(tracker),
            smoothing_factor: 0.5,
            frame_tx,
            frame_wanted: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(Counters::default()),
        }
    }

    #[tokio::test]
    async fn test_session_renders_and_stops_in_order() {
        let events = events();
        let sink = RecordingSink {
            frames: Arc::default(),
            events: Some(Arc::clone(&events)),
        };
        let frames = Arc::clone(&sink.frames);
        let (src_events, det_events) = (Arc::clone(&events), Arc::clone(&events));

        let mut session = start_try_on(
            fast_config(),
            move || Ok(FakeSource::new(&src_events)),
            move || Ok(fake_detector(&det_events, Some(synthetic_face()))),
            sink,
        )
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Running);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*session.tracking().borrow(), TrackingStatus::Tracking);
        session.stop().await.unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(*events.lock().unwrap(), vec!["detector", "sink", "source"]);

        let stats = session.stats();
        assert!(stats.frames_presented > 0);
        assert!(stats.detections > 0);
        assert!(stats.frames_composited > 0);
        assert_eq!(stats.misses, 0);
        // Untouched gray until the first detection, red lips afterwards
        let frames = frames.lock().unwrap();
        let last = frames.last().unwrap();
        assert!(last[0] > last[1], "lips should be tinted: {last:?}");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let events = events();
        let (src_events, det_events) = (Arc::clone(&events), Arc::clone(&events));
        let mut session = Session::new(fast_config());
        session
            .start(
                move || Ok(FakeSource::new(&src_events)),
                move || Ok(fake_detector(&det_events, None)),
                RecordingSink::default(),
            )
            .await
            .unwrap();

        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(*events.lock().unwrap(), vec!["detector", "source"]);
    }

    #[tokio::test]
    async fn test_capture_failure_never_runs() {
        let mut session = Session::new(fast_config());
        let err = session
            .start(
                || Err::<FakeSource, _>(FrameSourceError::Unavailable("permission denied".into())),
                || -> Result<FakeDetector, DetectorError> { unreachable!("detector must not load") },
                RecordingSink::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Capture(_)));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stats(), SessionStats::default());
    }

    #[tokio::test]
    async fn test_detector_failure_releases_source() {
        let events = events();
        let src_events = Arc::clone(&events);
        let sink = RecordingSink::default();
        let frames = Arc::clone(&sink.frames);
        let mut session = Session::new(fast_config());
        let err = session
            .start(
                move || Ok(FakeSource::new(&src_events)),
                || Err::<FakeDetector, _>(DetectorError::ModelNotFound("face_mesh.onnx".into())),
                sink,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Detector(DetectorError::ModelNotFound(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(*events.lock().unwrap(), vec!["source"]);
        assert!(frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_topology_mismatch_fails_start() {
        let events = events();
        let (src_events, det_events) = (Arc::clone(&events), Arc::clone(&events));
        let mut session = Session::new(fast_config());
        let err = session
            .start(
                move || Ok(FakeSource::new(&src_events)),
                move || {
                    let mut detector = fake_detector(&det_events, None);
                    detector.keypoints = 68;
                    Ok(detector)
                },
                RecordingSink::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Topology(TopologyError::KeypointCountMismatch { .. })));
        assert_eq!(session.state(), SessionState::Stopped);
        // Detector dropped on the failed start, source released before that
        assert_eq!(*events.lock().unwrap(), vec!["source", "detector"]);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let log = events();
        let (src_events, det_events) = (Arc::clone(&log), Arc::clone(&log));
        let mut session = Session::new(fast_config());
        session
            .start(
                move || Ok(FakeSource::new(&src_events)),
                move || Ok(fake_detector(&det_events, None)),
                RecordingSink::default(),
            )
            .await
            .unwrap();

        let err = session
            .start(
                || Ok(FakeSource::new(&events())),
                || Err::<FakeDetector, _>(DetectorError::InferenceFailed("unused".into())),
                RecordingSink::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { state: SessionState::Running }));
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_failure_while_running_surfaces_on_stop() {
        let events = events();
        let det_events = Arc::clone(&events);
        let mut session = Session::new(fast_config());
        session
            .start(
                move || {
                    let mut source = FakeSource::new(&events);
                    source.fail = true;
                    Ok(source)
                },
                move || Ok(fake_detector(&det_events, None)),
                RecordingSink::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = session.stop().await.unwrap_err();
        assert!(matches!(err, SessionError::Capture(FrameSourceError::CaptureFailed(_))));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_capture_failure_ends_session_and_releases_everything() {
        let events = events();
        let (src_events, det_events) = (Arc::clone(&events), Arc::clone(&events));
        let mut session = Session::new(fast_config());
        let mut updates = session.state_updates();
        session
            .start(
                move || {
                    let mut source = FakeSource::new(&src_events);
                    source.fail = true;
                    Ok(source)
                },
                move || Ok(fake_detector(&det_events, None)),
                RecordingSink::default(),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), updates.wait_for(|s| *s == SessionState::Failed))
            .await
            .expect("session should fail on its own")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Released without anyone calling stop
        assert_eq!(session.state(), SessionState::Failed);
        let mut released = events.lock().unwrap().clone();
        released.sort_unstable();
        assert_eq!(released, vec!["detector", "source"]);

        let err = session.stop().await.unwrap_err();
        assert!(matches!(err, SessionError::Capture(FrameSourceError::CaptureFailed(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_detector_crash_ends_session() {
        let events = events();
        let (src_events, det_events) = (Arc::clone(&events), Arc::clone(&events));
        let mut session = Session::new(fast_config());
        session
            .start(
                move || Ok(FakeSource::new(&src_events)),
                move || {
                    let mut detector = fake_detector(&det_events, Some(synthetic_face()));
                    detector.crash_after = Some(1);
                    Ok(detector)
                },
                RecordingSink::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.state(), SessionState::Failed);
        let composited = session.stats().frames_composited;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // No more frames with lipstick stuck at the last landmarks
        assert_eq!(session.stats().frames_composited, composited);
        assert_eq!(session.stats().detections, 1);
        {
            let events = events.lock().unwrap();
            assert!(events.contains(&"detector"));
            assert!(events.contains(&"source"));
        }

        let err = session.stop().await.unwrap_err();
        assert!(matches!(err, SessionError::TaskFailed(_)));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_blocking_capture_does_not_stall_runtime() {
        let events = events();
        let (src_events, det_events) = (Arc::clone(&events), Arc::clone(&events));
        let mut session = Session::new(fast_config());
        session
            .start(
                move || {
                    let mut source = FakeSource::new(&src_events);
                    source.delay = Some(Duration::from_millis(300));
                    Ok(source)
                },
                move || Ok(fake_detector(&det_events, None)),
                RecordingSink::default(),
            )
            .await
            .unwrap();

        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(150), "runtime stalled for {:?}", started.elapsed());

        let started = Instant::now();
        session.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "stop took {:?}", started.elapsed());
        assert_eq!(*events.lock().unwrap(), vec!["detector", "source"]);
    }

    #[test]
    fn test_face_lost_after_threshold_suspends_compositing() {
        let tracker: SharedTracker = Arc::new(Mutex::new(LandmarkTracker::new(10)));
        let (status_tx, status_rx) = watch::channel(TrackingStatus::Searching);
        let counters = Counters::default();
        let sink = RecordingSink::default();
        let frames = Arc::clone(&sink.frames);
        let mut render = render_loop(&tracker, sink);

        assert_eq!(
            record_detection(&tracker, &status_tx, &counters, Some(synthetic_face())),
            TrackingStatus::Tracking
        );
        assert_eq!(render.tick().unwrap(), TickOutcome::Presented { composited: true });

        for miss in 1..=15u32 {
            let status = record_detection(&tracker, &status_tx, &counters, None);
            let expected = if miss >= 10 {
                TrackingStatus::FaceLost
            } else {
                TrackingStatus::Tracking
            };
            assert_eq!(status, expected, "after miss {miss}");
            assert_eq!(*status_rx.borrow(), expected);
            assert_eq!(
                render.tick().unwrap(),
                TickOutcome::Presented { composited: miss < 10 },
                "after miss {miss}"
            );
        }
        assert_eq!(counters.snapshot().misses, 15);
        // Frames after the loss are the raw gray input
        assert_eq!(*frames.lock().unwrap().last().unwrap(), [128, 128, 128]);

        record_detection(&tracker, &status_tx, &counters, Some(synthetic_face()));
        assert_eq!(*status_rx.borrow(), TrackingStatus::Tracking);
        assert_eq!(render.tick().unwrap(), TickOutcome::Presented { composited: true });
    }

    #[test]
    fn test_tick_without_detection_presents_raw_frame() {
        let tracker: SharedTracker = Arc::new(Mutex::new(LandmarkTracker::default()));
        let sink = RecordingSink::default();
        let frames = Arc::clone(&sink.frames);
        let mut render = render_loop(&tracker, sink);

        assert_eq!(render.tick().unwrap(), TickOutcome::Presented { composited: false });
        assert_eq!(frames.lock().unwrap()[0], [128, 128, 128]);
        assert!(render.frame_tx.borrow().is_some(), "raw frame published for detection");
    }

    #[test]
    fn test_frame_published_only_when_detection_wants_one() {
        let tracker: SharedTracker = Arc::new(Mutex::new(LandmarkTracker::default()));
        let mut render = render_loop(&tracker, RecordingSink::default());

        render.tick().unwrap();
        let first = render.frame_tx.borrow().clone().unwrap();
        render.tick().unwrap();
        render.tick().unwrap();
        let still = render.frame_tx.borrow().clone().unwrap();
        assert!(Arc::ptr_eq(&first, &still), "frame copied while detection was busy");

        render.frame_wanted.store(true, Ordering::Release);
        render.tick().unwrap();
        let fresh = render.frame_tx.borrow().clone().unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(!render.frame_wanted.load(Ordering::Acquire));
    }

    #[test]
    fn test_tick_skips_when_source_not_ready() {
        let tracker: SharedTracker = Arc::new(Mutex::new(LandmarkTracker::default()));
        let sink = RecordingSink::default();
        let frames = Arc::clone(&sink.frames);
        let mut render = render_loop(&tracker, sink);
        let events = events();
        let mut source = FakeSource::new(&events);
        source.ready = false;
        render.source = Box::new(source);

        assert_eq!(render.tick().unwrap(), TickOutcome::NotReady);
        assert!(frames.lock().unwrap().is_empty());
        assert!(render.frame_tx.borrow().is_none());
    }

    #[test]
    fn test_style_change_applies_on_next_tick() {
        let tracker: SharedTracker = Arc::new(Mutex::new(LandmarkTracker::default()));
        tracker.lock().unwrap().on_detection(Some(synthetic_face()));
        let sink = RecordingSink::default();
        let frames = Arc::clone(&sink.frames);
        let mut render = render_loop(&tracker, sink);
        let (style_tx, style_rx) = watch::channel(render.renderer.style().clone());
        render.style_rx = style_rx;

        style_tx.send_replace(RenderStyle::new(Rgb::new(37, 99, 235), Default::default()));
        render.tick().unwrap();
        let [r, _, b] = frames.lock().unwrap()[0];
        assert!(b > r, "blue shade expected");
    }
}
