use image::RgbImage;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The closed set of emotion categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Neutral,
    Sad,
    Surprise,
}

impl Emotion {
    /// Canonical order; also the index order of [`EmotionDistribution`].
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprise,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownEmotion(pub String);

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownEmotion(s.to_string()))
    }
}

/// Non-negative score per emotion category.
///
/// Probabilistic backends report percentages (sum ≈ 100); the heuristic
/// backend reports unit weights (sum = 1).
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionDistribution {
    scores: [f32; 7],
}

impl EmotionDistribution {
    /// Scores indexed by [`Emotion::ALL`] order.
    pub fn from_scores(scores: [f32; 7]) -> Self {
        Self { scores }
    }

    /// Equal score for every category, summing to `total`.
    pub fn uniform(total: f32) -> Self {
        Self {
            scores: [total / 7.0; 7],
        }
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.scores[emotion.index()]
    }

    pub fn scores(&self) -> &[f32; 7] {
        &self.scores
    }

    pub fn total(&self) -> f32 {
        self.scores.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.into_iter().zip(self.scores.iter().copied())
    }

    /// Arg-max; ties resolve to the earlier category in canonical order.
    pub fn dominant(&self) -> Emotion {
        let mut best = Emotion::ALL[0];
        for (emotion, score) in self.iter() {
            if score > self.get(best) {
                best = emotion;
            }
        }
        best
    }

    /// True when every score is finite and non-negative and the total is positive.
    pub fn is_valid(&self) -> bool {
        self.scores.iter().all(|s| s.is_finite() && *s >= 0.0) && self.total() > 0.0
    }

    /// Rescale so the scores sum to `total`. `None` for an empty or invalid distribution.
    pub fn normalized(&self, total: f32) -> Option<Self> {
        if !self.is_valid() {
            return None;
        }
        let sum = self.total();
        Some(Self {
            scores: self.scores.map(|s| s / sum * total),
        })
    }
}

impl Serialize for EmotionDistribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.scores.len()))?;
        for (emotion, score) in self.iter() {
            map.serialize_entry(emotion.as_str(), &score)?;
        }
        map.end()
    }
}

/// Which link of the classifier chain produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Neural,
    LocalModel,
    Heuristic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Neural => "neural",
            BackendKind::LocalModel => "local_model",
            BackendKind::Heuristic => "heuristic",
        })
    }
}

/// Output of one classification call on one face crop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionResult {
    pub label: Emotion,
    /// Share of the dominant category, in [0, 1].
    pub confidence: f32,
    pub distribution: EmotionDistribution,
    pub source: BackendKind,
}

impl EmotionResult {
    /// Build a result whose label is the arg-max of `distribution`.
    ///
    /// `scale` is what a certain score would be (100 for percentages, 1 for weights).
    pub fn from_distribution(distribution: EmotionDistribution, scale: f32, source: BackendKind) -> Self {
        let label = distribution.dominant();
        let confidence = if scale > 0.0 {
            (distribution.get(label) / scale).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            label,
            confidence,
            distribution,
            source,
        }
    }
}

/// Face bounding box in frame-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn area(&self) -> u32 {
        self.width * self.height
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = x2.saturating_sub(x1) as f32 * y2.saturating_sub(y1) as f32;
        let union = self.area() as f32 + other.area() as f32 - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Clip to an image of the given size. The result may have zero area.
    pub fn clamp_to(&self, width: u32, height: u32) -> FaceBox {
        let x = self.x.min(width);
        let y = self.y.min(height);
        FaceBox {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }

    /// Copy the boxed region out of `image`, clipped to its bounds.
    pub fn crop(&self, image: &RgbImage) -> RgbImage {
        let b = self.clamp_to(image.width(), image.height());
        image::imageops::crop_imm(image, b.x, b.y, b.width, b.height).to_image()
    }
}
