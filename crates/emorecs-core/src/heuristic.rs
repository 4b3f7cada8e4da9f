//! Rule-based emotion classifier.
//!
//! Splits an equalized face crop into brow, eye/nose and mouth/chin bands,
//! measures brightness, spread and edge density per band, and accumulates
//! weighted evidence per emotion from fixed rules. Always succeeds.
//!
//! The thresholds in [`HeuristicRules`] are empirical and uncalibrated; they
//! can be overridden from a TOML file.

use crate::classifier::{BackendError, EmotionBackend};
use crate::types::{BackendKind, Emotion, EmotionDistribution, EmotionResult};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

// --- Band split by relative crop height ---
const UPPER_BAND_END: f32 = 0.35;
const MIDDLE_BAND_END: f32 = 0.65;

// --- Canny hysteresis thresholds ---
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 100.0;

/// Smallest side Canny and the Laplacian can work on.
const MIN_FILTER_SIDE: u32 = 3;

const DEGENERATE_CONFIDENCE: f32 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid rules file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Rule thresholds and weights. Intensities are on a 0–255 scale,
/// edge densities are fractions in [0, 1], entropy is in bits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicRules {
    /// Evidence every category starts with.
    pub floor: f32,
    /// Extra starting evidence for neutral.
    pub neutral_prior: f32,

    pub happy_lower_mean_min: f32,
    pub happy_upper_std_max: f32,
    pub happy_lower_edge_min: f32,
    pub happy_lower_edge_max: f32,
    pub happy_weight: f32,

    pub sad_band_gap_min: f32,
    pub sad_lower_std_max: f32,
    pub sad_entropy_max: f32,
    pub sad_weight: f32,

    pub angry_std_min: f32,
    pub angry_edge_min: f32,
    pub angry_weight: f32,

    pub surprise_edge_min: f32,
    pub surprise_focus_min: f32,
    pub surprise_weight: f32,

    pub fear_entropy_min: f32,
    pub fear_middle_std_min: f32,
    pub fear_weight: f32,

    pub disgust_middle_edge_min: f32,
    pub disgust_lower_mean_max: f32,
    pub disgust_weight: f32,

    pub neutral_edge_max: f32,
    pub neutral_focus_max: f32,
    pub neutral_weight: f32,
}

impl Default for HeuristicRules {
    fn default() -> Self {
        Self {
            floor: 0.05,
            neutral_prior: 1.0,

            happy_lower_mean_min: 140.0,
            happy_upper_std_max: 60.0,
            happy_lower_edge_min: 0.05,
            happy_lower_edge_max: 0.25,
            happy_weight: 2.0,

            sad_band_gap_min: 15.0,
            sad_lower_std_max: 45.0,
            sad_entropy_max: 6.5,
            sad_weight: 2.0,

            angry_std_min: 70.0,
            angry_edge_min: 0.15,
            angry_weight: 2.0,

            surprise_edge_min: 0.18,
            surprise_focus_min: 500.0,
            surprise_weight: 2.0,

            fear_entropy_min: 7.5,
            fear_middle_std_min: 65.0,
            fear_weight: 1.5,

            disgust_middle_edge_min: 0.20,
            disgust_lower_mean_max: 110.0,
            disgust_weight: 1.5,

            neutral_edge_max: 0.08,
            neutral_focus_max: 200.0,
            neutral_weight: 1.5,
        }
    }
}

impl HeuristicRules {
    /// Parse rules from TOML; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, RulesError> {
        Ok(toml::from_str(src)?)
    }

    pub fn load(path: &Path) -> Result<Self, RulesError> {
        let src = std::fs::read_to_string(path)?;
        let rules = Self::from_toml_str(&src)?;
        tracing::info!(path = %path.display(), "loaded heuristic rules");
        Ok(rules)
    }
}

/// Statistics for one horizontal band of the face.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandStats {
    pub mean: f32,
    pub std_dev: f32,
    pub edge_density: f32,
}

/// Everything the rules look at.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaceFeatures {
    pub upper: BandStats,
    pub middle: BandStats,
    pub lower: BandStats,
    pub std_dev: f32,
    pub edge_density: f32,
    /// Shannon entropy of the intensity histogram, in bits.
    pub entropy: f32,
    /// Variance of the 4-neighbour Laplacian.
    pub laplacian_variance: f32,
}

/// Equalize, stretch and measure a face crop. `None` for a zero-area crop.
pub fn extract_features(face: &RgbImage) -> Option<FaceFeatures> {
    if face.width() == 0 || face.height() == 0 {
        return None;
    }

    let gray = image::imageops::grayscale(face);
    let mut gray = imageproc::contrast::equalize_histogram(&gray);
    stretch_min_max(&mut gray);

    let edges = if gray.width() >= MIN_FILTER_SIDE && gray.height() >= MIN_FILTER_SIDE {
        imageproc::edges::canny(&gray, CANNY_LOW, CANNY_HIGH)
    } else {
        GrayImage::new(gray.width(), gray.height())
    };

    let h = gray.height();
    let upper_end = ((h as f32 * UPPER_BAND_END).round() as u32).min(h);
    let middle_end = ((h as f32 * MIDDLE_BAND_END).round() as u32).clamp(upper_end, h);

    let (_, std_dev) = mean_std(&gray, 0, h);
    Some(FaceFeatures {
        upper: band_stats(&gray, &edges, 0, upper_end),
        middle: band_stats(&gray, &edges, upper_end, middle_end),
        lower: band_stats(&gray, &edges, middle_end, h),
        std_dev,
        edge_density: edge_density(&edges, 0, h),
        entropy: entropy(&gray),
        laplacian_variance: laplacian_variance(&gray),
    })
}

/// Accumulate unnormalized evidence per emotion.
pub fn score(features: &FaceFeatures, rules: &HeuristicRules) -> [f32; 7] {
    let mut weights = [rules.floor.max(0.0); 7];
    let mut add = |emotion: Emotion, w: f32| weights[emotion.index()] += w.max(0.0);
    let f = features;

    add(Emotion::Neutral, rules.neutral_prior);

    if f.lower.mean > rules.happy_lower_mean_min
        && f.upper.std_dev < rules.happy_upper_std_max
        && (rules.happy_lower_edge_min..=rules.happy_lower_edge_max).contains(&f.lower.edge_density)
    {
        add(Emotion::Happy, rules.happy_weight);
    }
    if f.lower.mean > f.middle.mean {
        add(Emotion::Happy, rules.happy_weight * 0.25);
    }

    if f.upper.mean - f.lower.mean > rules.sad_band_gap_min && f.lower.std_dev < rules.sad_lower_std_max {
        add(Emotion::Sad, rules.sad_weight);
    }
    if f.entropy < rules.sad_entropy_max {
        add(Emotion::Sad, rules.sad_weight * 0.25);
    }

    let mid_upper_edges = (f.upper.edge_density + f.middle.edge_density) / 2.0;
    if f.std_dev > rules.angry_std_min && mid_upper_edges > rules.angry_edge_min {
        add(Emotion::Angry, rules.angry_weight);
    }

    if f.upper.edge_density > rules.surprise_edge_min
        && f.lower.edge_density > rules.surprise_edge_min
        && f.laplacian_variance > rules.surprise_focus_min
    {
        add(Emotion::Surprise, rules.surprise_weight);
    }

    if f.entropy > rules.fear_entropy_min && f.middle.std_dev > rules.fear_middle_std_min {
        add(Emotion::Fear, rules.fear_weight);
    }

    if f.middle.edge_density > rules.disgust_middle_edge_min && f.lower.mean < rules.disgust_lower_mean_max {
        add(Emotion::Disgust, rules.disgust_weight);
    }

    if f.edge_density < rules.neutral_edge_max && f.laplacian_variance < rules.neutral_focus_max {
        add(Emotion::Neutral, rules.neutral_weight);
    }

    weights
}

/// Deterministic always-available backend.
#[derive(Debug, Clone, Default)]
pub struct HeuristicBackend {
    rules: HeuristicRules,
}

impl HeuristicBackend {
    pub fn new(rules: HeuristicRules) -> Self {
        Self { rules }
    }

    /// Classify a crop. Zero-area crops get a neutral default.
    pub fn classify_face(&self, face: &RgbImage) -> EmotionResult {
        let Some(features) = extract_features(face) else {
            return degenerate_result();
        };
        let weights = EmotionDistribution::from_scores(score(&features, &self.rules));
        match weights.normalized(1.0) {
            Some(distribution) => EmotionResult::from_distribution(distribution, 1.0, BackendKind::Heuristic),
            None => degenerate_result(),
        }
    }
}

impl EmotionBackend for HeuristicBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Heuristic
    }

    fn classify(&self, face: &RgbImage) -> Result<EmotionResult, BackendError> {
        Ok(self.classify_face(face))
    }
}

fn degenerate_result() -> EmotionResult {
    EmotionResult {
        label: Emotion::Neutral,
        confidence: DEGENERATE_CONFIDENCE,
        distribution: EmotionDistribution::uniform(1.0),
        source: BackendKind::Heuristic,
    }
}

/// Stretch intensities so the darkest pixel is 0 and the brightest 255.
fn stretch_min_max(gray: &mut GrayImage) {
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if max <= min {
        return;
    }
    let range = (max - min) as f32;
    for p in gray.pixels_mut() {
        p.0[0] = (((p.0[0] - min) as f32 / range) * 255.0).round() as u8;
    }
}

fn rows(gray: &GrayImage, start: u32, end: u32) -> impl Iterator<Item = u8> + '_ {
    let w = gray.width() as usize;
    gray.as_raw()[start as usize * w..end as usize * w].iter().copied()
}

fn mean_std(gray: &GrayImage, start: u32, end: u32) -> (f32, f32) {
    let n = ((end - start) * gray.width()) as f32;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = rows(gray, start, end).map(|p| p as f32).sum::<f32>() / n;
    let var = rows(gray, start, end).map(|p| (p as f32 - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

fn edge_density(edges: &GrayImage, start: u32, end: u32) -> f32 {
    let n = ((end - start) * edges.width()) as f32;
    if n == 0.0 {
        return 0.0;
    }
    rows(edges, start, end).filter(|&p| p > 0).count() as f32 / n
}

fn band_stats(gray: &GrayImage, edges: &GrayImage, start: u32, end: u32) -> BandStats {
    let (mean, std_dev) = mean_std(gray, start, end);
    BandStats {
        mean,
        std_dev,
        edge_density: edge_density(edges, start, end),
    }
}

fn entropy(gray: &GrayImage) -> f32 {
    let mut hist = [0u32; 256];
    for p in gray.as_raw() {
        hist[*p as usize] += 1;
    }
    let n = gray.as_raw().len() as f32;
    hist.iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f32 / n;
            -p * p.log2()
        })
        .sum()
}

fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < MIN_FILTER_SIDE || h < MIN_FILTER_SIDE {
        return 0.0;
    }
    let px = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f32;
    let mut values = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            values.push(px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y));
        }
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}
