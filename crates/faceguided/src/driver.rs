//! Kiosk driver: the detection cycle and everything it sets in motion.
//!
//! A single task `select!`s over the tick interval, completed detections and
//! match outcomes, control commands and the dwell timer. All state changes go
//! through [`CaptureMachine`]; the driver only performs the I/O it asks for.

use crate::config::Config;
use crate::engine::{DetectorHandle, EngineError};
use crate::presenter::{Presenter, PresenterView};
use faceguide_core::{
    compute_guide_region, score_fit, CaptureMachine, CapturePolicy, CaptureTicket, DetectionSample,
    Descriptor, FitResult, GuideConfig, GuideRegion, Hint, MatchService, MatchStatus, Mood, Phase,
    Verdict,
};
use faceguide_hw::{CameraError, CameraSession, CameraSource, Frame, VideoSink};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

const STATUS_STARTING: &str = "starting camera";
const STATUS_NO_FACE: &str = "position your face inside the guide";
const STATUS_CAPTURING: &str = "capturing";
const STATUS_STOPPED: &str = "stopped";

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub interval: Duration,
    pub guide: GuideConfig,
    pub policy: CapturePolicy,
    pub min_confidence: f32,
    pub dwell: Duration,
    pub ready_attempts: u32,
    pub ready_poll: Duration,
    pub jpeg_quality: u8,
}

impl DriverConfig {
    pub fn from_config(config: &Config) -> Self {
        let capture = config.active_capture();
        Self {
            interval: config.interval(),
            guide: config.guide.clone(),
            policy: capture.policy(),
            min_confidence: capture.min_confidence,
            dwell: config.dwell(),
            ready_attempts: config.camera.ready_attempts,
            ready_poll: config.ready_poll(),
            jpeg_quality: capture.jpeg_quality,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Manual reset. From an idle failure it retries camera startup.
    Reset,
    Shutdown,
}

/// Compact state published for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub status: String,
    pub qualifying_frames: u32,
    pub need: Option<u32>,
    pub generation: u64,
    pub score: Option<f32>,
    pub hint: Option<Hint>,
    pub error: Option<String>,
    pub result: Option<MatchStatus>,
}

impl StatusSnapshot {
    fn initial() -> Self {
        Self {
            phase: Phase::Idle,
            status: STATUS_STARTING.to_string(),
            qualifying_frames: 0,
            need: None,
            generation: 0,
            score: None,
            hint: None,
            error: None,
            result: None,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("kiosk driver is not running")]
pub struct DriverClosed;

/// Clone-safe control handle for a running [`Driver`].
#[derive(Clone)]
pub struct KioskHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusSnapshot>,
}

impl KioskHandle {
    pub async fn reset(&self) -> Result<(), DriverClosed> {
        self.commands.send(Command::Reset).await.map_err(|_| DriverClosed)
    }

    pub async fn shutdown(&self) -> Result<(), DriverClosed> {
        self.commands.send(Command::Shutdown).await.map_err(|_| DriverClosed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }
}

/// Completions reported back into the loop.
enum Event {
    Detected {
        generation: u64,
        frame: Arc<Frame>,
        result: Result<Option<DetectionSample>, EngineError>,
    },
    Matched {
        ticket: CaptureTicket,
        status: MatchStatus,
    },
}

pub struct Driver<S, M, P> {
    config: DriverConfig,
    camera: CameraSession<S>,
    detector: DetectorHandle,
    matcher: Arc<M>,
    presenter: P,
    machine: CaptureMachine,
    guide: Option<GuideRegion>,
    /// A detection request is outstanding.
    in_flight: bool,
    /// Consecutive ticks that found no usable frame.
    blank_ticks: u32,
    /// Auto-reset deadline and the generation it was armed for.
    dwell: Option<(Instant, u64)>,
    status: String,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    commands_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl<S, M, P> Driver<S, M, P>
where
    S: CameraSource,
    M: MatchService,
    P: Presenter,
{
    pub fn new(
        config: DriverConfig,
        camera: CameraSession<S>,
        detector: DetectorHandle,
        matcher: M,
        presenter: P,
    ) -> (Self, KioskHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::initial());
        let machine = CaptureMachine::new(config.policy);
        let driver = Self {
            config,
            camera,
            detector,
            matcher: Arc::new(matcher),
            presenter,
            machine,
            guide: None,
            in_flight: false,
            blank_ticks: 0,
            dwell: None,
            status: STATUS_STARTING.to_string(),
            events_tx,
            events_rx,
            commands_rx,
            status_tx,
        };
        let handle = KioskHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (driver, handle)
    }

    /// Run until a shutdown command arrives or every handle is dropped.
    pub async fn run(mut self) {
        self.start().await;
        self.publish();

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let dwell = self.dwell.map(|(deadline, _)| deadline);
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                Some(event) = self.events_rx.recv() => self.on_event(event),
                command = self.commands_rx.recv() => match command {
                    Some(Command::Reset) => self.on_reset().await,
                    Some(Command::Shutdown) | None => break,
                },
                _ = sleep_until(dwell) => self.on_dwell_elapsed().await,
            }
            self.publish();
        }

        self.shutdown();
    }

    /// Acquire the camera, wait for real frames and attach the live view.
    async fn start(&mut self) {
        self.status = STATUS_STARTING.to_string();
        self.blank_ticks = 0;
        self.publish();
        match self.acquire().await {
            Ok((width, height)) => {
                self.guide_for(width, height);
                self.machine.mark_ready();
                self.status = STATUS_NO_FACE.to_string();
            }
            Err(e) => {
                self.status = format!("camera unavailable: {e}");
                self.machine.fail(e.to_string());
            }
        }
    }

    async fn acquire(&mut self) -> Result<(u32, u32), CameraError> {
        let dims = self
            .camera
            .wait_ready(self.config.ready_attempts, self.config.ready_poll)
            .await?;
        self.camera.attach(&mut self.presenter).await?;
        Ok(dims)
    }

    fn on_tick(&mut self) {
        if self.machine.phase() != Phase::Tracking || self.in_flight {
            return;
        }
        if !self.camera.is_live() {
            self.status = "camera unavailable: stream ended".to_string();
            self.machine.fail("camera stream ended");
            return;
        }
        let Some((frame, (width, height))) = self
            .camera
            .latest_frame()
            .and_then(|f| f.dimensions().map(|dims| (f, dims)))
        else {
            self.on_blank_tick();
            return;
        };
        self.blank_ticks = 0;
        self.guide_for(width, height);

        let generation = self.machine.generation();
        let detector = self.detector.clone();
        let tx = self.events_tx.clone();
        self.in_flight = true;
        tokio::spawn(async move {
            let result = detector.detect(Arc::clone(&frame)).await;
            let _ = tx.send(Event::Detected {
                generation,
                frame,
                result,
            });
        });
    }

    /// A live stream that keeps delivering zero-sized frames is as unusable
    /// as one that never became ready.
    fn on_blank_tick(&mut self) {
        self.blank_ticks += 1;
        if self.blank_ticks < self.config.ready_attempts {
            return;
        }
        let e = CameraError::NotReady {
            attempts: self.blank_ticks,
        };
        warn!(ticks = self.blank_ticks, "camera delivering no usable frames");
        self.blank_ticks = 0;
        self.status = format!("camera unavailable: {e}");
        self.machine.fail(e.to_string());
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Detected {
                generation,
                frame,
                result,
            } => {
                self.in_flight = false;
                self.on_detection(generation, &frame, result);
            }
            Event::Matched { ticket, status } => {
                let summary = status.summary();
                if self.machine.on_match_outcome(ticket, status) {
                    self.status = summary;
                    self.dwell = Some((Instant::now() + self.config.dwell, self.machine.generation()));
                }
            }
        }
    }

    fn on_detection(
        &mut self,
        generation: u64,
        frame: &Arc<Frame>,
        result: Result<Option<DetectionSample>, EngineError>,
    ) {
        if !self.machine.accepts_frames(generation) {
            debug!(generation, current = self.machine.generation(), "discarding stale detection");
            return;
        }

        let sample = match result {
            Ok(Some(s)) if s.confidence >= self.config.min_confidence => Some(s),
            Ok(Some(s)) => {
                trace!(confidence = s.confidence, "face below confidence floor");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, seq = frame.sequence, "detection failed");
                None
            }
        };
        let (Some(sample), Some((width, height))) = (sample, frame.dimensions()) else {
            self.machine.on_no_face();
            self.status = STATUS_NO_FACE.to_string();
            return;
        };

        let guide = self.guide_for(width, height);
        let fit = score_fit(&sample, &guide, &self.config.guide);
        trace!(score = fit.score, mood = fit.mood.as_str(), "frame scored");

        match self.machine.on_fit(fit) {
            Verdict::Capture(ticket) => self.begin_capture(ticket, frame, sample.descriptor),
            Verdict::Progress { .. } => self.status = guidance(&fit).to_string(),
            Verdict::Ignored => {}
        }
    }

    /// Freeze the frame and send the one match request for this ticket.
    fn begin_capture(&mut self, ticket: CaptureTicket, frame: &Frame, descriptor: Descriptor) {
        match frame.encode_jpeg(self.config.jpeg_quality) {
            Ok(jpeg) => {
                self.machine.hold_preview(ticket, jpeg);
            }
            Err(e) => warn!(error = %e, "failed to encode preview; continuing without it"),
        }
        self.status = STATUS_CAPTURING.to_string();

        let matcher = Arc::clone(&self.matcher);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let status = MatchStatus::from(matcher.find_match(&descriptor).await);
            let _ = tx.send(Event::Matched { ticket, status });
        });
    }

    async fn on_dwell_elapsed(&mut self) {
        let Some((_, generation)) = self.dwell.take() else {
            return;
        };
        if self.machine.on_dwell_elapsed(generation) {
            self.status = STATUS_NO_FACE.to_string();
            self.rearm_view().await;
        }
    }

    async fn on_reset(&mut self) {
        if self.camera.is_torn_down() {
            return;
        }
        if self.machine.phase() == Phase::Idle {
            info!("retrying camera startup");
            self.start().await;
            return;
        }
        self.dwell = None;
        if self.machine.reset() {
            self.status = STATUS_NO_FACE.to_string();
            self.rearm_view().await;
        }
    }

    /// The live view may have been swapped out while a result was shown.
    async fn rearm_view(&mut self) {
        if let Err(e) = self.camera.reattach(&mut self.presenter).await {
            self.status = format!("camera unavailable: {e}");
            self.machine.fail(e.to_string());
        }
    }

    fn shutdown(&mut self) {
        info!("kiosk driver shutting down");
        self.dwell = None;
        self.machine.teardown();
        self.camera
            .teardown(Some(&mut self.presenter as &mut dyn VideoSink));
        self.status = STATUS_STOPPED.to_string();
        self.publish();
    }

    fn guide_for(&mut self, width: u32, height: u32) -> GuideRegion {
        match self.guide {
            Some(guide) if guide.matches_frame(width, height) => guide,
            _ => {
                let guide = compute_guide_region(width, height, &self.config.guide);
                debug!(width, height, rx = guide.rx, ry = guide.ry, "guide region computed");
                self.guide = Some(guide);
                guide
            }
        }
    }

    fn publish(&mut self) {
        let state = self.machine.state();
        let mood = state.last_fit.map(|f| f.mood).unwrap_or(Mood::Bad);
        let need = self.machine.policy().required(mood);
        let remaining = self
            .dwell
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()));

        self.presenter.render(&PresenterView {
            phase: state.phase,
            status: &self.status,
            guide: self.guide.as_ref(),
            fit: state.last_fit.as_ref(),
            progress: (state.qualifying_frames, need),
            preview: state.preview.as_deref(),
            match_status: state.match_status.as_ref(),
            remaining,
        });

        let snapshot = StatusSnapshot {
            phase: state.phase,
            status: self.status.clone(),
            qualifying_frames: state.qualifying_frames,
            need,
            generation: state.generation,
            score: state.last_fit.map(|f| f.score),
            hint: state.last_fit.and_then(|f| f.hint),
            error: state.error.clone(),
            result: state.match_status.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn guidance(fit: &FitResult) -> &'static str {
    match (fit.hint, fit.mood) {
        (Some(hint), _) => hint.message(),
        (None, Mood::Good) => "hold still",
        (None, Mood::Ok) => "almost there",
        (None, Mood::Bad) => "align your face with the guide",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_detector;
    use faceguide_core::{
        BoundingBox, Detector, DetectorError, MatchError, MatchResponse, MatchedIdentity,
    };
    use faceguide_hw::{stream, CameraStream, FrameFeed, FramePublisher};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    const W: u32 = 320;
    const H: u32 = 240;

    #[derive(Clone, Default)]
    struct FakeSource {
        deny: Arc<AtomicBool>,
        opens: Arc<AtomicU32>,
        publishers: Arc<Mutex<Vec<FramePublisher>>>,
        /// Open waits here, like a pending permission prompt.
        gate: Option<Arc<Notify>>,
    }

    impl FakeSource {
        fn all_stopped(&self) -> bool {
            self.publishers.lock().unwrap().iter().all(|p| p.is_stopped())
        }

        fn publish_latest(&self, frame: Frame) {
            let publishers = self.publishers.lock().unwrap();
            publishers.last().expect("no stream opened").publish(frame);
        }
    }

    impl CameraSource for FakeSource {
        async fn open(&mut self) -> Result<CameraStream, CameraError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.deny.load(Ordering::SeqCst) {
                return Err(CameraError::PermissionDenied("denied by user".into()));
            }
            let (publisher, stream) = stream::channel();
            publisher.publish(Frame::new(vec![96; (W * H) as usize], W, H, 1));
            self.publishers.lock().unwrap().push(publisher);
            Ok(stream)
        }
    }

    /// Pops scripted results, then keeps returning `fallback`. Each call
    /// blocks the detector thread for `delay`.
    struct ScriptedDetector {
        script: VecDeque<Option<DetectionSample>>,
        fallback: Option<DetectionSample>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
    }

    impl Detector for ScriptedDetector {
        fn detect(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Option<DetectionSample>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let result = self
                .script
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(result)
        }
    }

    struct FakeMatcher {
        outcome: Result<MatchResponse, MatchError>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl MatchService for FakeMatcher {
        async fn find_match(&self, _descriptor: &Descriptor) -> Result<MatchResponse, MatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    #[derive(Default)]
    struct RecordingPresenter {
        feed: Option<FrameFeed>,
        attaches: Arc<AtomicU32>,
    }

    impl VideoSink for RecordingPresenter {
        fn attached_stream(&self) -> Option<u64> {
            self.feed.as_ref().map(|f| f.stream_id())
        }
        fn attach(&mut self, feed: FrameFeed) {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            self.feed = Some(feed);
        }
        fn detach(&mut self) {
            self.feed = None;
        }
    }

    impl Presenter for RecordingPresenter {
        fn render(&mut self, _view: &PresenterView<'_>) {}
    }

    fn face(confidence: f32, centered: bool) -> DetectionSample {
        let guide = compute_guide_region(W, H, &GuideConfig::default());
        let bbox = if centered {
            let height = guide.target_height();
            let width = height * 0.8;
            BoundingBox {
                x: guide.cx - width / 2.0,
                y: guide.cy - height / 2.0,
                width,
                height,
            }
        } else {
            BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 20.0,
                height: 20.0,
            }
        };
        DetectionSample {
            bbox,
            landmarks: Vec::new(),
            confidence,
            descriptor: Descriptor(vec![0.1; 4]),
        }
    }

    fn good() -> Option<DetectionSample> {
        Some(face(0.9, true))
    }

    fn bad() -> Option<DetectionSample> {
        Some(face(0.9, false))
    }

    fn matched() -> Result<MatchResponse, MatchError> {
        Ok(MatchResponse::Matched {
            identity: MatchedIdentity {
                id: "3".into(),
                name: "Ines".into(),
                avatar: None,
                distance: 0.28,
            },
            threshold: 0.5,
        })
    }

    struct Harness {
        handle: KioskHandle,
        task: tokio::task::JoinHandle<()>,
        source: FakeSource,
        detections: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
        matches: Arc<AtomicUsize>,
        attaches: Arc<AtomicU32>,
    }

    struct Setup {
        script: Vec<Option<DetectionSample>>,
        fallback: Option<DetectionSample>,
        detect_delay: Duration,
        outcome: Result<MatchResponse, MatchError>,
        match_delay: Duration,
        dwell: Duration,
        deny: bool,
        gate: Option<Arc<Notify>>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                script: Vec::new(),
                fallback: good(),
                detect_delay: Duration::ZERO,
                outcome: matched(),
                match_delay: Duration::ZERO,
                dwell: Duration::from_secs(30),
                deny: false,
                gate: None,
            }
        }
    }

    fn launch(setup: Setup) -> Harness {
        let source = FakeSource {
            gate: setup.gate,
            ..FakeSource::default()
        };
        source.deny.store(setup.deny, Ordering::SeqCst);
        let detections = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let matches = Arc::new(AtomicUsize::new(0));
        let attaches = Arc::new(AtomicU32::new(0));

        let detector = spawn_detector(ScriptedDetector {
            script: setup.script.into(),
            fallback: setup.fallback,
            delay: setup.detect_delay,
            calls: Arc::clone(&detections),
            completed: Arc::clone(&completed),
        })
        .unwrap();
        let matcher = FakeMatcher {
            outcome: setup.outcome,
            delay: setup.match_delay,
            calls: Arc::clone(&matches),
        };
        let presenter = RecordingPresenter {
            feed: None,
            attaches: Arc::clone(&attaches),
        };
        let config = DriverConfig {
            interval: Duration::from_millis(5),
            guide: GuideConfig::default(),
            policy: CapturePolicy {
                good_frames: 3,
                sustained_ok_frames: None,
            },
            min_confidence: 0.5,
            dwell: setup.dwell,
            ready_attempts: 3,
            ready_poll: Duration::from_millis(1),
            jpeg_quality: 90,
        };
        let (driver, handle) = Driver::new(
            config,
            CameraSession::new(source.clone()),
            detector,
            matcher,
            presenter,
        );
        Harness {
            handle,
            task: tokio::spawn(driver.run()),
            source,
            detections,
            completed,
            matches,
            attaches,
        }
    }

    async fn wait_for(
        handle: &KioskHandle,
        pred: impl FnMut(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        let mut rx = handle.status.clone();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for kiosk state")
            .expect("driver stopped")
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn test_steady_face_captures_once_and_shows_result() {
        let h = launch(Setup::default());
        let shown = wait_for(&h.handle, |s| s.phase == Phase::ShowingResult).await;

        assert_eq!(h.matches.load(Ordering::SeqCst), 1);
        assert_eq!(h.detections.load(Ordering::SeqCst), 3);
        assert!(matches!(shown.result, Some(MatchStatus::Matched { .. })));
        assert!(shown.status.contains("Ines"));
        assert_eq!(shown.qualifying_frames, 0);
    }

    #[tokio::test]
    async fn test_bad_frame_delays_capture_to_sixth_detection() {
        let h = launch(Setup {
            script: vec![good(), good(), bad(), good(), good(), good()],
            fallback: None,
            ..Setup::default()
        });
        wait_for(&h.handle, |s| s.phase == Phase::ShowingResult).await;
        assert_eq!(h.detections.load(Ordering::SeqCst), 6);
        assert_eq!(h.matches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_counts_as_no_face() {
        let h = launch(Setup {
            fallback: Some(face(0.2, true)),
            ..Setup::default()
        });
        wait_for(&h.handle, |s| s.phase == Phase::Tracking).await;
        while h.detections.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snap = h.handle.snapshot();
        assert_eq!(snap.phase, Phase::Tracking);
        assert_eq!(snap.qualifying_frames, 0);
        assert_eq!(snap.status, STATUS_NO_FACE);
        assert_eq!(h.matches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_match_failure_shows_no_result_then_auto_resets() {
        let h = launch(Setup {
            outcome: Err(MatchError::Timeout(3000)),
            dwell: Duration::from_millis(50),
            ..Setup::default()
        });
        let shown = wait_for(&h.handle, |s| s.phase == Phase::ShowingResult).await;
        assert!(matches!(shown.result, Some(MatchStatus::NoResult { .. })));

        wait_for(&h.handle, |s| s.generation > shown.generation).await;
        // Auto-reset reuses the live stream and the attached view.
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.attaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_reset_discards_in_flight_match() {
        let h = launch(Setup {
            match_delay: Duration::from_millis(150),
            ..Setup::default()
        });
        let capturing = wait_for(&h.handle, |s| s.phase == Phase::Capturing).await;
        h.handle.reset().await.unwrap();

        let shown = wait_for(&h.handle, |s| s.phase == Phase::ShowingResult).await;
        assert_eq!(shown.generation, capturing.generation + 1);
        assert_eq!(h.matches.load(Ordering::SeqCst), 2);
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_camera_is_terminal_until_reset() {
        let h = launch(Setup {
            deny: true,
            ..Setup::default()
        });
        let failed = wait_for(&h.handle, |s| s.error.is_some()).await;
        assert_eq!(failed.phase, Phase::Idle);
        assert!(failed.status.starts_with("camera unavailable"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.detections.load(Ordering::SeqCst), 0);

        h.source.deny.store(false, Ordering::SeqCst);
        h.handle.reset().await.unwrap();
        let recovered = wait_for(&h.handle, |s| s.phase != Phase::Idle).await;
        assert!(recovered.error.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_camera_once() {
        let h = launch(Setup {
            fallback: None,
            ..Setup::default()
        });
        wait_for(&h.handle, |s| s.phase == Phase::Tracking).await;
        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap();

        assert!(h.source.all_stopped());
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.handle.snapshot().status, STATUS_STOPPED);
        assert_eq!(h.handle.reset().await, Err(DriverClosed));
    }

    #[tokio::test]
    async fn test_slow_camera_open_keeps_runtime_responsive() {
        let gate = Arc::new(Notify::new());
        let h = launch(Setup {
            gate: Some(Arc::clone(&gate)),
            ..Setup::default()
        });

        // Open is still pending well past several tick intervals. Other
        // tasks on the same thread keep running.
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        for _ in 0..10 {
            ticker.tick().await;
        }
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 1);
        let pending = h.handle.snapshot();
        assert_eq!(pending.phase, Phase::Idle);
        assert_eq!(pending.status, STATUS_STARTING);
        assert_eq!(h.detections.load(Ordering::SeqCst), 0);

        gate.notify_one();
        wait_for(&h.handle, |s| s.phase != Phase::Idle).await;
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.attaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_detector_never_overlaps_ticks() {
        let latency = Duration::from_millis(25);
        let h = launch(Setup {
            fallback: bad(),
            detect_delay: latency,
            ..Setup::default()
        });
        wait_for(&h.handle, |s| s.phase == Phase::Tracking).await;
        let started = Instant::now();
        while h.detections.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let elapsed = started.elapsed();
        let count = h.detections.load(Ordering::SeqCst) as u128;
        // Five-millisecond ticks: count follows detector latency, not ticks.
        assert!(count <= elapsed.as_millis() / latency.as_millis() + 2);

        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap();
        let at_stop = h.detections.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        // At most the one outstanding request; nothing was queued behind it.
        assert!(h.detections.load(Ordering::SeqCst) <= at_stop + 1);
    }

    #[tokio::test]
    async fn test_reset_mid_detection_drops_late_result() {
        let h = launch(Setup {
            detect_delay: Duration::from_millis(80),
            ..Setup::default()
        });
        let tracking = wait_for(&h.handle, |s| s.phase == Phase::Tracking).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.handle.reset().await.unwrap();

        while h.completed.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after = h.handle.snapshot();
        assert_eq!(after.generation, tracking.generation + 1);
        assert_eq!(after.qualifying_frames, 0);
        assert_eq!(after.phase, Phase::Tracking);

        let shown = wait_for(&h.handle, |s| s.phase == Phase::ShowingResult).await;
        assert_eq!(shown.generation, tracking.generation + 1);
        assert!(h.completed.load(Ordering::SeqCst) >= 4);
        assert_eq!(h.matches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_frames_while_tracking_fail_the_session() {
        let h = launch(Setup {
            fallback: None,
            ..Setup::default()
        });
        wait_for(&h.handle, |s| s.phase == Phase::Tracking).await;
        h.source.publish_latest(Frame::new(Vec::new(), 0, 0, 2));

        let failed = wait_for(&h.handle, |s| s.error.is_some()).await;
        assert_eq!(failed.phase, Phase::Idle);
        assert!(failed.status.starts_with("camera unavailable"));
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guidance_prefers_hint() {
        let mut fit = FitResult::from_components(1.0, 1.0, 1.0);
        assert_eq!(guidance(&fit), "hold still");
        fit.hint = Some(Hint::MoveCloser);
        assert_eq!(guidance(&fit), "move closer");
    }
}
