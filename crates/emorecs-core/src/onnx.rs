//! ONNX emotion networks via ONNX Runtime.
//!
//! Two model layouts are supported: a full-color network at 224×224 with
//! ImageNet normalization, and a small grayscale 48×48 classifier. Both
//! produce 7 scores in FER-2013 label order, reported as percentages.
//!
//! The runtime session is created on the first `classify` call and kept
//! for the life of the backend; a failed load is remembered so later calls
//! fail fast and fall through the chain.

use crate::classifier::{BackendError, EmotionBackend};
use crate::types::{BackendKind, Emotion, EmotionDistribution, EmotionResult};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

// --- Named constants ---
const NEURAL_INPUT_SIZE: usize = 224;
const NEURAL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const NEURAL_STD: [f32; 3] = [0.229, 0.224, 0.225];
const LOCAL_INPUT_SIZE: usize = 48;
const PERCENT: f32 = 100.0;
const PROBABILITY_TOLERANCE: f32 = 1e-3;

pub const NEURAL_MODEL_FILE: &str = "emotion_net.onnx";
pub const LOCAL_MODEL_FILE: &str = "emotion_fer48.onnx";

/// Output index → emotion, FER-2013 order.
const FER_LABELS: [Emotion; 7] = [
    Emotion::Angry,
    Emotion::Disgust,
    Emotion::Fear,
    Emotion::Happy,
    Emotion::Sad,
    Emotion::Surprise,
    Emotion::Neutral,
];

/// Input layout of a model.
#[derive(Debug, Clone, Copy)]
struct InputSpec {
    size: usize,
    grayscale: bool,
    mean: [f32; 3],
    std: [f32; 3],
}

const NEURAL_INPUT: InputSpec = InputSpec {
    size: NEURAL_INPUT_SIZE,
    grayscale: false,
    mean: NEURAL_MEAN,
    std: NEURAL_STD,
};

const LOCAL_INPUT: InputSpec = InputSpec {
    size: LOCAL_INPUT_SIZE,
    grayscale: true,
    mean: [0.0; 3],
    std: [1.0; 3],
};

/// Runtime session loaded at most once, on first use.
struct LazySession {
    path: PathBuf,
    cell: OnceLock<Result<Mutex<Session>, String>>,
}

impl LazySession {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            cell: OnceLock::new(),
        }
    }

    fn get(&self) -> Result<&Mutex<Session>, BackendError> {
        self.cell
            .get_or_init(|| match load_session(&self.path) {
                Ok(session) => Ok(Mutex::new(session)),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "emotion model failed to load");
                    Err(e.to_string())
                }
            })
            .as_ref()
            .map_err(|e| BackendError::LoadFailed(e.clone()))
    }
}

fn load_session(path: &Path) -> Result<Session, BackendError> {
    if !path.exists() {
        return Err(BackendError::ModelNotFound(path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded emotion model"
    );

    Ok(session)
}

/// Emotion network backed by an ONNX model file.
pub struct OnnxEmotionBackend {
    kind: BackendKind,
    input: InputSpec,
    session: LazySession,
}

impl OnnxEmotionBackend {
    /// Full-color pre-trained network.
    pub fn neural(model_path: &Path) -> Self {
        Self {
            kind: BackendKind::Neural,
            input: NEURAL_INPUT,
            session: LazySession::new(model_path),
        }
    }

    /// Small grayscale 48×48 classifier.
    pub fn local(model_path: &Path) -> Self {
        Self {
            kind: BackendKind::LocalModel,
            input: LOCAL_INPUT,
            session: LazySession::new(model_path),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.session.path
    }

    /// Resize and normalize a face crop into a NCHW tensor.
    fn preprocess(&self, face: &RgbImage) -> Array4<f32> {
        let size = self.input.size;
        let resized = image::imageops::resize(face, size as u32, size as u32, FilterType::Triangle);

        if self.input.grayscale {
            let gray = image::imageops::grayscale(&resized);
            let mut tensor = Array4::<f32>::zeros((1, 1, size, size));
            for (x, y, p) in gray.enumerate_pixels() {
                let v = p.0[0] as f32 / 255.0;
                tensor[[0, 0, y as usize, x as usize]] = (v - self.input.mean[0]) / self.input.std[0];
            }
            return tensor;
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, p) in resized.enumerate_pixels() {
            for c in 0..3 {
                let v = p.0[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (v - self.input.mean[c]) / self.input.std[c];
            }
        }
        tensor
    }
}

impl EmotionBackend for OnnxEmotionBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.session.path.exists()
    }

    fn classify(&self, face: &RgbImage) -> Result<EmotionResult, BackendError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(BackendError::EmptyInput);
        }

        let input = self.preprocess(face);
        let raw: Vec<f32> = {
            let mut session = self
                .session
                .get()?
                .lock()
                .map_err(|_| BackendError::InferenceFailed("session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("scores: {e}")))?;
            data.to_vec()
        };

        let distribution = scores_to_distribution(&raw)?;
        Ok(EmotionResult::from_distribution(distribution, PERCENT, self.kind))
    }
}

/// Map raw model output to a percentage distribution in canonical order.
///
/// Outputs that already form a probability vector are used as-is; anything
/// else is treated as logits and passed through softmax.
fn scores_to_distribution(raw: &[f32]) -> Result<EmotionDistribution, BackendError> {
    if raw.len() != FER_LABELS.len() {
        return Err(BackendError::InferenceFailed(format!(
            "expected {} scores, got {}",
            FER_LABELS.len(),
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(BackendError::InvalidOutput);
    }

    let is_probability = raw.iter().all(|v| (0.0..=1.0).contains(v))
        && (raw.iter().sum::<f32>() - 1.0).abs() < PROBABILITY_TOLERANCE;
    let probs: Vec<f32> = if is_probability {
        raw.to_vec()
    } else {
        softmax(raw)
    };

    let mut scores = [0.0f32; 7];
    for (label, p) in FER_LABELS.iter().zip(probs) {
        scores[label.index()] = p;
    }
    EmotionDistribution::from_scores(scores)
        .normalized(PERCENT)
        .ok_or(BackendError::InvalidOutput)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_neural_shape_and_normalization() {
        let backend = OnnxEmotionBackend::neural(Path::new("/nonexistent.onnx"));
        let face = RgbImage::from_pixel(100, 80, Rgb([255, 0, 128]));
        let tensor = backend.preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, NEURAL_INPUT_SIZE, NEURAL_INPUT_SIZE]);

        let expected_r = (1.0 - NEURAL_MEAN[0]) / NEURAL_STD[0];
        let expected_g = (0.0 - NEURAL_MEAN[1]) / NEURAL_STD[1];
        assert!((tensor[[0, 0, 10, 10]] - expected_r).abs() < 0.02);
        assert!((tensor[[0, 1, 10, 10]] - expected_g).abs() < 0.02);
    }

    #[test]
    fn test_preprocess_local_is_single_channel_unit_range() {
        let backend = OnnxEmotionBackend::local(Path::new("/nonexistent.onnx"));
        let face = RgbImage::from_pixel(30, 30, Rgb([255, 255, 255]));
        let tensor = backend.preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 1, LOCAL_INPUT_SIZE, LOCAL_INPUT_SIZE]);
        assert!(tensor.iter().all(|v| (v - 1.0).abs() < 0.01));
    }

    #[test]
    fn test_missing_model_is_unavailable_and_fails() {
        let backend = OnnxEmotionBackend::neural(Path::new("/nonexistent/emotion_net.onnx"));
        assert!(!backend.is_available());
        let face = RgbImage::from_pixel(48, 48, Rgb([100, 100, 100]));
        assert!(matches!(backend.classify(&face), Err(BackendError::LoadFailed(_))));
        // Remembered failure: second call fails the same way without reloading.
        assert!(matches!(backend.classify(&face), Err(BackendError::LoadFailed(_))));
    }

    #[test]
    fn test_empty_crop_rejected() {
        let backend = OnnxEmotionBackend::local(Path::new("/nonexistent.onnx"));
        assert!(matches!(backend.classify(&RgbImage::new(0, 0)), Err(BackendError::EmptyInput)));
    }

    #[test]
    fn test_probabilities_mapped_to_canonical_order() {
        // FER order: angry, disgust, fear, happy, sad, surprise, neutral
        let probs = [0.05, 0.05, 0.05, 0.10, 0.60, 0.05, 0.10];
        let d = scores_to_distribution(&probs).unwrap();
        assert_eq!(d.dominant(), Emotion::Sad);
        assert!((d.get(Emotion::Sad) - 60.0).abs() < 1e-3);
        assert!((d.get(Emotion::Neutral) - 10.0).abs() < 1e-3);
        assert!((d.total() - 100.0).abs() <= 1.0);
    }

    #[test]
    fn test_logits_go_through_softmax() {
        let logits = [0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0];
        let d = scores_to_distribution(&logits).unwrap();
        assert_eq!(d.dominant(), Emotion::Happy);
        assert!(d.get(Emotion::Happy) > 90.0);
        assert!((d.total() - 100.0).abs() <= 1.0);
    }

    #[test]
    fn test_wrong_output_width() {
        assert!(scores_to_distribution(&[0.5, 0.5]).is_err());
        assert!(scores_to_distribution(&[f32::NAN; 7]).is_err());
    }
}
