//! emorecs-core: Face location and emotion classification.
//!
//! Finds faces with an OpenCV Haar cascade, classifies each crop
//! through a fallback chain of ONNX networks ending in a rule-based
//! heuristic, and aggregates per-frame labels into a session verdict.

pub mod classifier;
pub mod heuristic;
pub mod locator;
pub mod onnx;
pub mod session;
pub mod types;

use std::path::PathBuf;

pub use classifier::{BackendError, EmotionBackend, EmotionClassifier};
pub use heuristic::{HeuristicBackend, HeuristicRules};
pub use locator::{CascadeLocator, FaceLocator, LocatorError, LocatorParams, LocatorProfile};
pub use onnx::OnnxEmotionBackend;
pub use session::{EmotionSink, SessionAggregator, SinkError, UserId};
pub use types::{BackendKind, Emotion, EmotionDistribution, EmotionResult, FaceBox};

/// Default cascade file name inside the model directory.
pub const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

/// `$XDG_DATA_HOME/emorecs/models`, falling back to `~/.local/share/emorecs/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("emorecs")
        .join("models")
}
