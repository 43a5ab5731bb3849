//! Capture and inference loops.
//!
//! The two loops never call each other. Frames go through the `FrameBus`,
//! tracks through the `SharedTracker`. Each loop holds its own rate by
//! sleeping `period - processing time`; a loop that is slower than its
//! target simply runs back to back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::clock::MonotonicClock;
use crate::config::PipelineConfig;
use crate::detection::filter_by_confidence;
use crate::detector::{Detect, DetectorAdapter};
use crate::error::Error;
use crate::frame::Frame;
use crate::frame_bus::FrameBus;
use crate::source::{FeedStatus, FrameSource};
use crate::stats::{FpsCounter, PipelineStats};
use crate::tracker::SharedTracker;
use crate::Track;

const CAPTURE: &str = "capture";
const INFERENCE: &str = "inference";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderControl {
    Continue,
    Quit,
}

/// Overlay sink called by the capture loop once per captured frame.
pub trait Renderer {
    fn render(
        &mut self,
        frame: &Frame,
        tracks: &[Track],
        stats: &PipelineStats,
    ) -> Result<RenderControl, Error>;

    /// Called when the feed goes from live to unavailable or back.
    fn feed_changed(&mut self, _status: FeedStatus) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenderer;

impl Renderer for NoopRenderer {
    #[inline]
    fn render(&mut self, _: &Frame, _: &[Track], _: &PipelineStats) -> Result<RenderControl, Error> {
        Ok(RenderControl::Continue)
    }
}

/// State both loops see. Nothing here hands out references to its inside.
struct Shared {
    stop: AtomicBool,
    // dropped on stop, which wakes every sleeping loop
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
    bus: FrameBus,
    tracker: SharedTracker,
    status: Mutex<FeedStatus>,
    stats: Mutex<PipelineStats>,
    clock: MonotonicClock,
}

impl Shared {
    fn new(config: &PipelineConfig) -> Self {
        let (wake_tx, wake_rx) = unbounded();

        Self {
            stop: AtomicBool::new(false),
            wake_tx: Mutex::new(Some(wake_tx)),
            wake_rx,
            bus: FrameBus::new(),
            tracker: SharedTracker::new(config.tracker()),
            status: Mutex::new(FeedStatus::Waiting),
            stats: Mutex::new(PipelineStats::default()),
            clock: MonotonicClock::new(),
        }
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake_tx.lock().take();
    }

    #[inline]
    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleeps for `dur` or until stop is requested.
    fn pause(&self, dur: Duration) {
        if dur.is_zero() {
            return;
        }

        // nothing is ever sent, this returns on timeout or disconnect
        let _ = self.wake_rx.recv_timeout(dur);
    }

    /// Stores the new status, returns it if it changed.
    fn set_status(&self, status: FeedStatus) -> Option<FeedStatus> {
        let mut current = self.status.lock();
        if *current == status {
            return None;
        }

        *current = status;
        Some(status)
    }
}

/// Sends the loop name when the thread ends, panics included.
struct DoneGuard {
    name: &'static str,
    tx: Sender<&'static str>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(self.name);
    }
}

struct CaptureLoop<S, R> {
    source: S,
    renderer: R,
    shared: Arc<Shared>,
    period: Duration,
    backoff: Duration,
    feed_timeout: f64,
    fps: FpsCounter,
    last_frame_at: f64,
}

impl<S: FrameSource, R: Renderer> CaptureLoop<S, R> {
    fn run(mut self) {
        info!("capture loop started, period {:?}", self.period);
        let mut prev_start: Option<Instant> = None;

        while !self.shared.is_stopped() {
            let started = Instant::now();

            match self.source.read_frame() {
                Ok(Some(frame)) => {
                    if let Some(prev) = prev_start {
                        self.fps.record(started - prev);
                    }
                    prev_start = Some(started);

                    self.on_frame(frame);
                    self.shared.pause(self.period.saturating_sub(started.elapsed()));
                }
                Ok(None) => {
                    self.check_feed_timeout();
                    self.shared.pause(self.backoff);
                }
                Err(err) => {
                    debug!("capture: read failed: {}", err);
                    if self.change_status(FeedStatus::Unavailable) {
                        warn!("capture: feed unavailable: {}", err);
                    }
                    self.shared.pause(self.backoff);
                }
            }
        }

        info!("capture loop stopped, releasing source");
    }

    fn on_frame(&mut self, frame: Frame) {
        let now = self.shared.clock.now();
        self.last_frame_at = now;

        if self.change_status(FeedStatus::Live) {
            info!("capture: feed live (frame {})", frame.seq);
        }

        self.shared.bus.publish(frame.clone());
        let tracks = self.shared.tracker.get_active(now);

        let stats = {
            let mut stats = self.shared.stats.lock();
            stats.frames_captured += 1;
            stats.display_fps = self.fps.fps();
            *stats
        };

        match self.renderer.render(&frame, &tracks, &stats) {
            Ok(RenderControl::Continue) => {}
            Ok(RenderControl::Quit) => {
                info!("capture: renderer asked to quit");
                self.shared.request_stop();
            }
            Err(err) => warn!("capture: render failed: {}", err),
        }
    }

    fn check_feed_timeout(&mut self) {
        let silent_for = self.shared.clock.now() - self.last_frame_at;

        if silent_for > self.feed_timeout && self.change_status(FeedStatus::Unavailable) {
            warn!("capture: no frame for {:.2}s, feed unavailable", silent_for);
        }
    }

    fn change_status(&mut self, status: FeedStatus) -> bool {
        match self.shared.set_status(status) {
            Some(status) => {
                self.renderer.feed_changed(status);
                true
            }
            None => false,
        }
    }
}

struct InferenceLoop<D> {
    detector: DetectorAdapter<D>,
    shared: Arc<Shared>,
    period: Duration,
    backoff: Duration,
    confidence_threshold: f32,
    fps: FpsCounter,
}

impl<D: Detect> InferenceLoop<D> {
    fn run(mut self) {
        info!("inference loop started, period {:?}", self.period);
        let mut prev_start: Option<Instant> = None;

        while !self.shared.is_stopped() {
            let frame = match self.shared.bus.take() {
                Some(frame) => frame,
                None => {
                    self.shared.pause(self.backoff);
                    continue;
                }
            };

            let started = Instant::now();
            if let Some(prev) = prev_start {
                self.fps.record(started - prev);
            }
            prev_start = Some(started);

            let raw = self.detector.detect(&frame);
            let detections = filter_by_confidence(&raw, self.confidence_threshold);
            self.shared
                .tracker
                .update(&detections, self.shared.clock.now());

            let elapsed = started.elapsed();
            debug!(
                "inference: frame {} raw {} kept {} in {:.1}ms",
                frame.seq,
                raw.len(),
                detections.len(),
                elapsed.as_secs_f64() * 1000.0
            );

            {
                let mut stats = self.shared.stats.lock();
                stats.inference_cycles += 1;
                stats.inference_fps = self.fps.fps();
                stats.last_inference_ms = elapsed.as_secs_f64() * 1000.0;
                stats.detector_failures = self.detector.failures();
            }

            self.shared.pause(self.period.saturating_sub(elapsed));
        }

        info!("inference loop stopped, releasing detector");
    }
}

pub struct Pipeline {
    shared: Arc<Shared>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    done_rx: Receiver<&'static str>,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Validates `config` and starts both loops. Source and detector must be
    /// fully initialised by the caller.
    pub fn start<S, D, R>(
        config: PipelineConfig,
        source: S,
        detector: D,
        renderer: R,
    ) -> Result<Self, Error>
    where
        S: FrameSource + Send + 'static,
        D: Detect + Send + 'static,
        R: Renderer + Send + 'static,
    {
        config.validate()?;

        let shared = Arc::new(Shared::new(&config));
        let (done_tx, done_rx) = unbounded();
        let mut pipeline = Self {
            shared: Arc::clone(&shared),
            handles: Vec::with_capacity(2),
            done_rx,
            shutdown_timeout: config.shutdown_timeout()?,
        };

        let capture = CaptureLoop {
            source,
            renderer,
            shared: Arc::clone(&shared),
            period: config.capture_period()?,
            backoff: config.retry_backoff()?,
            feed_timeout: config.feed_timeout,
            fps: FpsCounter::new(config.fps_window),
            last_frame_at: 0.0,
        };

        let inference = InferenceLoop {
            detector: DetectorAdapter::new(detector),
            shared,
            period: config.inference_period()?,
            backoff: config.retry_backoff()?,
            confidence_threshold: config.confidence_threshold,
            fps: FpsCounter::new(config.fps_window),
        };

        pipeline.spawn(CAPTURE, done_tx.clone(), move || capture.run())?;
        pipeline.spawn(INFERENCE, done_tx, move || inference.run())?;

        info!(
            "pipeline started: capture {} fps, inference {} fps",
            config.capture_fps, config.inference_fps
        );

        Ok(pipeline)
    }

    /// Same as `start` with nothing drawing the overlay.
    pub fn start_headless<S, D>(config: PipelineConfig, source: S, detector: D) -> Result<Self, Error>
    where
        S: FrameSource + Send + 'static,
        D: Detect + Send + 'static,
    {
        Self::start(config, source, detector, NoopRenderer)
    }

    // On failure `self` is dropped by the caller, which stops loops already running.
    fn spawn<F>(&mut self, name: &'static str, tx: Sender<&'static str>, body: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done = DoneGuard { name, tx };
                body();
            })
            .map_err(|source| Error::Spawn { name, source })?;

        self.handles.push((name, handle));
        Ok(())
    }

    /// Seconds on the pipeline clock.
    #[inline]
    pub fn now(&self) -> f64 {
        self.shared.clock.now()
    }

    /// Copy of the most recently captured frame.
    #[inline]
    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.bus.take()
    }

    /// Copy of the tracks seen within `max_age` of now.
    #[inline]
    pub fn active_tracks(&self) -> Vec<Track> {
        self.shared.tracker.get_active(self.now())
    }

    #[inline]
    pub fn feed_status(&self) -> FeedStatus {
        *self.shared.status.lock()
    }

    #[inline]
    pub fn stats(&self) -> PipelineStats {
        *self.shared.stats.lock()
    }

    /// False once `shutdown` ran or a renderer asked to quit.
    #[inline]
    pub fn is_running(&self) -> bool {
        !self.shared.is_stopped()
    }

    /// Signals both loops and waits up to the configured timeout for them.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        if self.handles.is_empty() {
            return Ok(());
        }

        self.shared.request_stop();

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut running: Vec<&'static str> = self.handles.iter().map(|(name, _)| *name).collect();

        while !running.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(left) {
                Ok(name) => running.retain(|n| *n != name),
                Err(_) => break,
            }
        }

        for (name, handle) in self.handles.drain(..) {
            if running.contains(&name) {
                // left detached, it exits on its next stop check
                continue;
            }

            if handle.join().is_err() {
                error!("{} loop panicked", name);
            }
        }

        if running.is_empty() {
            info!("pipeline stopped");
            Ok(())
        } else {
            error!("pipeline shutdown timed out waiting for {:?}", running);
            Err(Error::ShutdownTimeout(running))
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("{}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::BBox;
    use crate::detector::ScriptedDetector;
    use crate::source::{Read, ReplaySource};
    use crate::Detection;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            capture_fps: 200.0,
            inference_fps: 50.0,
            feed_timeout: 0.05,
            retry_backoff: 0.002,
            shutdown_timeout: 2.0,
            ..Default::default()
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_invalid_config_never_starts() {
        let config = PipelineConfig {
            capture_fps: 0.0,
            ..Default::default()
        };
        let res = Pipeline::start_headless(
            config,
            ReplaySource::blank(8, 8),
            ScriptedDetector::constant(vec![]),
        );

        assert!(matches!(res, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_unrepresentable_periods_never_start() {
        let configs = [
            PipelineConfig {
                capture_fps: 1e-30,
                ..Default::default()
            },
            PipelineConfig {
                shutdown_timeout: 1e30,
                ..Default::default()
            },
        ];

        for config in configs {
            let res = Pipeline::start_headless(
                config,
                ReplaySource::blank(8, 8),
                ScriptedDetector::constant(vec![]),
            );

            assert!(matches!(res, Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_confidence_filter_applied_before_tracker() {
        let dets = vec![
            Detection::new(BBox::ltrb(0.0, 0.0, 10.0, 10.0), "cat", 0.9),
            Detection::new(BBox::ltrb(50.0, 50.0, 60.0, 60.0), "cat", 0.2),
        ];
        let mut pipeline = Pipeline::start_headless(
            fast_config(),
            ReplaySource::blank(64, 64),
            ScriptedDetector::constant(dets),
        )
        .unwrap();

        assert!(wait_for(|| pipeline.stats().inference_cycles >= 3));
        let tracks = pipeline.active_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_id, 1);
        assert!((tracks[0].confidence - 0.9).abs() < f32::EPSILON);

        pipeline.shutdown().unwrap();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_feed_goes_unavailable_and_recovers() {
        let mut script = vec![Read::Frame(Frame::blank(8, 8, 0))];
        script.extend((0..100).map(|_| Read::Miss));
        script.push(Read::Frame(Frame::blank(8, 8, 0)));
        let source = ReplaySource::new(script, true).unwrap();

        let mut pipeline =
            Pipeline::start_headless(fast_config(), source, ScriptedDetector::constant(vec![]))
                .unwrap();

        assert!(wait_for(|| pipeline.feed_status() == FeedStatus::Unavailable));
        assert!(wait_for(|| pipeline.feed_status() == FeedStatus::Live));

        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_device_error_does_not_stop_capture() {
        let source = ReplaySource::new(
            vec![
                Read::Fail("usb reset".into()),
                Read::Frame(Frame::blank(8, 8, 0)),
            ],
            true,
        )
        .unwrap();
        let mut pipeline =
            Pipeline::start_headless(fast_config(), source, ScriptedDetector::constant(vec![]))
                .unwrap();

        assert!(wait_for(|| pipeline.stats().frames_captured >= 5));
        assert!(pipeline.is_running());

        pipeline.shutdown().unwrap();
    }

    struct QuitAfter(u64);

    impl Renderer for QuitAfter {
        fn render(
            &mut self,
            _frame: &Frame,
            _tracks: &[Track],
            stats: &PipelineStats,
        ) -> Result<RenderControl, Error> {
            if stats.frames_captured >= self.0 {
                Ok(RenderControl::Quit)
            } else {
                Ok(RenderControl::Continue)
            }
        }
    }

    #[test]
    fn test_renderer_quit_stops_pipeline() {
        let mut pipeline = Pipeline::start(
            fast_config(),
            ReplaySource::blank(8, 8),
            ScriptedDetector::constant(vec![]),
            QuitAfter(3),
        )
        .unwrap();

        assert!(wait_for(|| !pipeline.is_running()));
        pipeline.shutdown().unwrap();
        assert_eq!(pipeline.stats().frames_captured, 3);
    }
}
