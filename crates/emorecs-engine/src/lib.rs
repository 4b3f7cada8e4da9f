//! emorecs-engine: The per-tick frame pipeline.
//!
//! Ties a [`emorecs_hw::CameraManager`] to the face locator, the emotion
//! classifier chain and the session aggregator, and hands annotated frames
//! to a caller-supplied [`DisplaySink`].

pub mod annotate;
pub mod pipeline;

pub use annotate::{annotate, emotion_color, load_label_font, FontError};
pub use pipeline::{
    DisplaySink, FramePipeline, PipelineConfig, PipelineError, PipelineState, SessionContext,
    SessionSummary, StopReason, TickOutcome,
};
