use emorecs_core::{Emotion, EmotionResult};
use emorecs_engine::DisplaySink;
use image::RgbImage;
use std::path::PathBuf;

/// Roughly one second of frames at 30 fps.
const SNAPSHOT_EVERY: u64 = 30;

/// Terminal display: logs label changes and optionally writes the latest
/// annotated frame to an image file.
pub struct LogDisplay {
    snapshot: Option<PathBuf>,
    last_label: Option<Emotion>,
    frames: u64,
}

impl LogDisplay {
    pub fn new(snapshot: Option<PathBuf>) -> Self {
        Self {
            snapshot,
            last_label: None,
            frames: 0,
        }
    }
}

impl DisplaySink for LogDisplay {
    fn show(&mut self, frame: &RgbImage, current: Option<&EmotionResult>) {
        let label = current.map(|r| r.label);
        if label != self.last_label {
            match current {
                Some(result) => tracing::info!(
                    label = %result.label,
                    confidence = result.confidence,
                    source = %result.source,
                    "emotion"
                ),
                None => tracing::info!("no face in view"),
            }
            self.last_label = label;
        }

        if let Some(path) = &self.snapshot {
            if self.frames % SNAPSHOT_EVERY == 0 {
                if let Err(e) = frame.save(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write snapshot");
                }
            }
        }
        self.frames += 1;
    }
}
