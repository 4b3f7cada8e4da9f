//! Emotion classifier fallback chain.
//!
//! Backends are held in priority order. The first available one is selected
//! once at construction; a call that fails on the selected backend falls
//! through to the later ones for that call only, ending at the heuristic
//! backend, which cannot fail.

use crate::heuristic::{HeuristicBackend, HeuristicRules};
use crate::onnx::OnnxEmotionBackend;
use crate::types::{BackendKind, EmotionResult};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model failed to load: {0}")]
    LoadFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("backend returned an invalid distribution")]
    InvalidOutput,
    #[error("empty face crop")]
    EmptyInput,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One interchangeable classification strategy.
pub trait EmotionBackend {
    fn kind(&self) -> BackendKind;

    /// Cheap availability probe used for selection; must not load models.
    fn is_available(&self) -> bool {
        true
    }

    fn classify(&self, face: &RgbImage) -> Result<EmotionResult, BackendError>;
}

/// Priority-ordered backends with a guaranteed heuristic tail.
pub struct EmotionClassifier {
    chain: Vec<Box<dyn EmotionBackend>>,
    /// Index of the first backend tried on every call.
    selected: usize,
    fallback: HeuristicBackend,
}

impl EmotionClassifier {
    /// Select the first available backend of `chain`. When none is available
    /// every call goes straight to `fallback`.
    pub fn new(chain: Vec<Box<dyn EmotionBackend>>, fallback: HeuristicBackend) -> Self {
        let selected = chain
            .iter()
            .position(|b| b.is_available())
            .unwrap_or(chain.len());

        match chain.get(selected) {
            Some(backend) => tracing::info!(backend = %backend.kind(), "emotion backend selected"),
            None => tracing::info!(backend = %BackendKind::Heuristic, "no model backend available"),
        }

        Self {
            chain,
            selected,
            fallback,
        }
    }

    /// Standard chain: neural network, then the local 48×48 model, then heuristics.
    pub fn from_model_files(neural: &Path, local: &Path, rules: HeuristicRules) -> Self {
        Self::new(
            vec![
                Box::new(OnnxEmotionBackend::neural(neural)),
                Box::new(OnnxEmotionBackend::local(local)),
            ],
            HeuristicBackend::new(rules),
        )
    }

    /// Backend tried first on every call.
    pub fn selected(&self) -> BackendKind {
        self.chain
            .get(self.selected)
            .map(|b| b.kind())
            .unwrap_or(BackendKind::Heuristic)
    }

    /// Classify one face crop. Never fails.
    pub fn classify(&self, face: &RgbImage) -> EmotionResult {
        for backend in &self.chain[self.selected..] {
            match backend.classify(face) {
                Ok(result) if result.distribution.is_valid() => return result,
                Ok(_) => {
                    tracing::warn!(
                        backend = %backend.kind(),
                        error = %BackendError::InvalidOutput,
                        "emotion backend failed; falling back"
                    );
                }
                Err(e) => {
                    tracing::warn!(backend = %backend.kind(), error = %e, "emotion backend failed; falling back");
                }
            }
        }
        self.fallback.classify_face(face)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Emotion, EmotionDistribution};
    use image::Rgb;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FailingBackend {
        calls: Rc<Cell<usize>>,
    }

    impl EmotionBackend for FailingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Neural
        }

        fn classify(&self, _face: &RgbImage) -> Result<EmotionResult, BackendError> {
            self.calls.set(self.calls.get() + 1);
            Err(BackendError::InferenceFailed("injected".into()))
        }
    }

    struct FixedBackend {
        kind: BackendKind,
        available: bool,
        scores: [f32; 7],
    }

    impl EmotionBackend for FixedBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn classify(&self, _face: &RgbImage) -> Result<EmotionResult, BackendError> {
            Ok(EmotionResult::from_distribution(
                EmotionDistribution::from_scores(self.scores),
                100.0,
                self.kind,
            ))
        }
    }

    fn face() -> RgbImage {
        RgbImage::from_pixel(48, 48, Rgb([128, 128, 128]))
    }

    const SAD: [f32; 7] = [5.0, 5.0, 5.0, 5.0, 10.0, 65.0, 5.0];

    #[test]
    fn test_failing_first_backend_falls_through() {
        let calls = Rc::new(Cell::new(0));
        let classifier = EmotionClassifier::new(
            vec![
                Box::new(FailingBackend { calls: calls.clone() }),
                Box::new(FixedBackend { kind: BackendKind::LocalModel, available: true, scores: SAD }),
            ],
            HeuristicBackend::default(),
        );

        assert_eq!(classifier.selected(), BackendKind::Neural);
        let result = classifier.classify(&face());
        assert_eq!(result.label, Emotion::Sad);
        assert_eq!(result.source, BackendKind::LocalModel);
        assert_eq!(calls.get(), 1);

        // Selection is not re-evaluated: the failing backend is tried again.
        classifier.classify(&face());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_all_backends_failing_reaches_heuristic() {
        let calls = Rc::new(Cell::new(0));
        let classifier = EmotionClassifier::new(
            vec![Box::new(FailingBackend { calls: calls.clone() })],
            HeuristicBackend::default(),
        );
        let result = classifier.classify(&face());
        assert_eq!(result.source, BackendKind::Heuristic);
        assert!(Emotion::ALL.contains(&result.label));
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn test_unavailable_backends_are_skipped_at_selection() {
        let classifier = EmotionClassifier::new(
            vec![
                Box::new(FixedBackend { kind: BackendKind::Neural, available: false, scores: SAD }),
                Box::new(FixedBackend { kind: BackendKind::LocalModel, available: true, scores: SAD }),
            ],
            HeuristicBackend::default(),
        );
        assert_eq!(classifier.selected(), BackendKind::LocalModel);
        assert_eq!(classifier.classify(&face()).source, BackendKind::LocalModel);
    }

    #[test]
    fn test_invalid_distribution_is_a_failure() {
        let classifier = EmotionClassifier::new(
            vec![Box::new(FixedBackend { kind: BackendKind::Neural, available: true, scores: [0.0; 7] })],
            HeuristicBackend::default(),
        );
        assert_eq!(classifier.classify(&face()).source, BackendKind::Heuristic);
    }

    #[test]
    fn test_empty_chain_uses_heuristic() {
        let classifier = EmotionClassifier::new(Vec::new(), HeuristicBackend::default());
        assert_eq!(classifier.selected(), BackendKind::Heuristic);
        let result = classifier.classify(&RgbImage::new(0, 0));
        assert_eq!(result.label, Emotion::Neutral);
        assert!((result.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_model_files_select_heuristic() {
        let classifier = EmotionClassifier::from_model_files(
            Path::new("/nonexistent/emotion_net.onnx"),
            Path::new("/nonexistent/emotion_fer48.onnx"),
            HeuristicRules::default(),
        );
        assert_eq!(classifier.selected(), BackendKind::Heuristic);
        let result = classifier.classify(&face());
        assert!((result.distribution.total() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_probabilistic_distribution_sums_to_hundred() {
        let classifier = EmotionClassifier::new(
            vec![Box::new(FixedBackend { kind: BackendKind::Neural, available: true, scores: SAD })],
            HeuristicBackend::default(),
        );
        let result = classifier.classify(&face());
        assert!((result.distribution.total() - 100.0).abs() <= 1.0);
        assert!((result.confidence - 0.65).abs() < 1e-6);
    }
}
