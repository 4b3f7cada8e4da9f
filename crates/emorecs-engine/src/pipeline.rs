//! Frame pipeline: capture, locate, throttled classify, annotate, display.
//!
//! One pipeline owns one camera. `start` moves it from Idle to Running,
//! each `tick` processes a single frame, and the session ends on an explicit
//! stop, a cleared running flag, the wall-clock ceiling, or a lost camera.
//! Every way out finalizes the session aggregate and closes the camera.

use crate::annotate::annotate;
use ab_glyph::FontVec;
use emorecs_core::{Emotion, EmotionClassifier, EmotionResult, FaceLocator, SessionAggregator, UserId};
use emorecs_hw::{CameraError, CameraManager};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("no session is running")]
    NotRunning,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Faces are reclassified every `throttle_interval` ticks.
    pub throttle_interval: u64,
    pub session_ceiling: Duration,
    /// Pause between ticks in [`FramePipeline::run`].
    pub tick_interval: Duration,
    pub mirror: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            throttle_interval: 10,
            session_ceiling: Duration::from_secs(60),
            tick_interval: Duration::from_millis(33),
            mirror: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
}

/// Caller-owned state shared with the pipeline across a session.
#[derive(Debug)]
pub struct SessionContext {
    pub user_id: Option<UserId>,
    running: Arc<AtomicBool>,
    /// Result for the primary face on the most recent tick that saw one.
    pub last_result: Option<EmotionResult>,
    /// Dominant emotion of the last completed session.
    pub detected_emotion: Option<Emotion>,
    pub status: String,
}

impl SessionContext {
    pub fn new(user_id: Option<UserId>) -> Self {
        Self {
            user_id,
            running: Arc::new(AtomicBool::new(false)),
            last_result: None,
            detected_emotion: None,
            status: "Camera idle".to_string(),
        }
    }

    /// Flag another thread can clear to stop the session within one tick.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Emotion handed to recommendation logic, if a session has completed.
    pub fn detected_emotion(&self) -> Option<Emotion> {
        self.detected_emotion
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    CeilingReached,
    CameraLost,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub ticks: u64,
    pub dominant: Option<Emotion>,
    pub reason: StopReason,
    pub duration: Duration,
}

#[derive(Debug)]
pub enum TickOutcome {
    Continued { faces: usize },
    Stopped(SessionSummary),
}

/// Receives every annotated frame together with the primary face's result.
pub trait DisplaySink {
    fn show(&mut self, frame: &RgbImage, current: Option<&EmotionResult>);
}

struct ActiveSession {
    id: Uuid,
    started: Instant,
    ticks: u64,
}

pub struct FramePipeline {
    camera: CameraManager,
    locator: Box<dyn FaceLocator>,
    classifier: EmotionClassifier,
    aggregator: SessionAggregator,
    config: PipelineConfig,
    state: PipelineState,
    session: Option<ActiveSession>,
    /// Sticky result per face slot, indexed by detection order.
    slots: Vec<Option<EmotionResult>>,
    label_font: Option<FontVec>,
}

impl FramePipeline {
    pub fn new(
        camera: CameraManager,
        locator: Box<dyn FaceLocator>,
        classifier: EmotionClassifier,
        aggregator: SessionAggregator,
        config: PipelineConfig,
    ) -> Self {
        Self {
            camera,
            locator,
            classifier,
            aggregator,
            config,
            state: PipelineState::Idle,
            session: None,
            slots: Vec::new(),
            label_font: None,
        }
    }

    /// Draw label text on annotated frames with this font.
    pub fn with_label_font(mut self, font: FontVec) -> Self {
        self.label_font = Some(font);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Idle → Running: open the camera and reset the session history.
    ///
    /// A camera failure leaves the pipeline Idle and is also written to
    /// `ctx.status`.
    pub fn start(&mut self, ctx: &mut SessionContext) -> Result<Uuid, PipelineError> {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::AlreadyRunning);
        }

        let info = match self.camera.open() {
            Ok(info) => info,
            Err(e) => {
                ctx.status = format!("Camera error: {e}");
                ctx.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let id = Uuid::new_v4();
        self.aggregator.begin(ctx.user_id);
        self.slots.clear();
        self.session = Some(ActiveSession {
            id,
            started: Instant::now(),
            ticks: 0,
        });
        self.state = PipelineState::Running;

        ctx.running.store(true, Ordering::SeqCst);
        ctx.last_result = None;
        ctx.status = "Camera running".to_string();

        tracing::info!(
            session = %id,
            backend = %info.backend,
            classifier = %self.classifier.selected(),
            user_id = ?ctx.user_id,
            "session started"
        );
        Ok(id)
    }

    /// Process one frame.
    pub fn tick(
        &mut self,
        ctx: &mut SessionContext,
        display: &mut dyn DisplaySink,
    ) -> Result<TickOutcome, PipelineError> {
        let Some((tick, started)) = self.session.as_ref().map(|s| (s.ticks, s.started)) else {
            return Err(PipelineError::NotRunning);
        };

        if !ctx.is_running() {
            return Ok(TickOutcome::Stopped(self.finish(ctx, StopReason::Requested)));
        }
        if started.elapsed() >= self.config.session_ceiling {
            return Ok(TickOutcome::Stopped(self.finish(ctx, StopReason::CeilingReached)));
        }

        let mut frame = match self.camera.read() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "camera lost; stopping session");
                self.finish(ctx, StopReason::CameraLost);
                ctx.status = format!("Camera error: {e}");
                return Err(e.into());
            }
        };
        if self.config.mirror {
            frame.mirror();
        }

        let faces = self.locator.locate(&frame.image);
        self.slots.resize(faces.len(), None);

        let fresh = tick % self.config.throttle_interval.max(1) == 0;
        for (face, slot) in faces.iter().zip(self.slots.iter_mut()) {
            if fresh || slot.is_none() {
                let crop = face.crop(&frame.image);
                let result = self.classifier.classify(&crop);
                tracing::debug!(
                    tick,
                    label = %result.label,
                    confidence = result.confidence,
                    source = %result.source,
                    "face classified"
                );
                *slot = Some(result);
            }
            if let Some(result) = slot.as_ref() {
                self.aggregator.record(result.label);
            }
        }

        let current = self.slots.first().cloned().flatten();
        if let (Some(user_id), Some(result)) = (ctx.user_id, current.as_ref()) {
            self.aggregator.maybe_persist(user_id, result.label, result.confidence);
        }
        if current.is_some() {
            ctx.last_result = current.clone();
        }

        let annotated = annotate(&frame.image, &faces, &self.slots, self.label_font.as_ref());
        display.show(&annotated, current.as_ref());

        if let Some(session) = self.session.as_mut() {
            session.ticks += 1;
        }
        Ok(TickOutcome::Continued { faces: faces.len() })
    }

    /// Running → Idle on an explicit stop command.
    pub fn stop(&mut self, ctx: &mut SessionContext) -> Result<SessionSummary, PipelineError> {
        if self.session.is_none() {
            return Err(PipelineError::NotRunning);
        }
        Ok(self.finish(ctx, StopReason::Requested))
    }

    /// Start a session and tick until it ends.
    pub fn run(
        &mut self,
        ctx: &mut SessionContext,
        display: &mut dyn DisplaySink,
    ) -> Result<SessionSummary, PipelineError> {
        let id = self.start(ctx)?;
        let span = tracing::info_span!("session", id = %id);
        let _enter = span.enter();

        loop {
            match self.tick(ctx, display)? {
                TickOutcome::Stopped(summary) => return Ok(summary),
                TickOutcome::Continued { .. } => std::thread::sleep(self.config.tick_interval),
            }
        }
    }

    fn finish(&mut self, ctx: &mut SessionContext, reason: StopReason) -> SessionSummary {
        self.state = PipelineState::Stopping;

        let dominant = self.aggregator.finalize();
        self.camera.close();
        self.slots.clear();

        let (session_id, ticks, duration) = match self.session.take() {
            Some(s) => (s.id, s.ticks, s.started.elapsed()),
            None => (Uuid::nil(), 0, Duration::ZERO),
        };

        if dominant.is_some() {
            ctx.detected_emotion = dominant;
        }
        ctx.running.store(false, Ordering::SeqCst);
        ctx.status = "Camera stopped".to_string();
        self.state = PipelineState::Idle;

        tracing::info!(
            session = %session_id,
            ticks,
            dominant = ?dominant,
            reason = ?reason,
            duration_ms = duration.as_millis() as u64,
            "session finished"
        );

        SessionSummary {
            session_id,
            ticks,
            dominant,
            reason,
            duration,
        }
    }
}
